//! Model-backed confidence policy.
//!
//! [`ChatModelPolicy`] asks an OpenAI-compatible chat model to judge the
//! retrieval statistics. It is always wrapped in a
//! [`FallbackPolicy`] so a failing or unparseable model falls back to the
//! rule gate, and the model can never overturn an unambiguous baseline.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use helpdesk_harness_core::confidence::{
    ConfidenceInput, ConfidencePolicy, FallbackPolicy, ModelVerdict, RuleGate, ACCEPT_THRESHOLD,
};
use helpdesk_harness_core::error::PolicyError;
use helpdesk_harness_core::models::ConfidenceDecision;

use crate::config::ConfidenceConfig;

const DEFAULT_CHAT_URL: &str = "https://api.openai.com";

const SYSTEM_PROMPT: &str = "You review retrieval results for a customer support assistant \
and decide whether an automatic answer is safe.\n\
Rules:\n\
- accept when the mean confidence is at least 0.6 and at least one source supports it\n\
- escalate when confidence is below 0.6, no source was found, or the sources look unrelated\n\
- escalation priority: high below 0.3, medium below 0.5, low otherwise\n\
Reply with JSON only, no markdown: \
{\"decision\": \"accept|escalate\", \"confidence\": 0.0-1.0, \"reason\": \"...\", \
\"priority\": \"low|medium|high\"}";

pub struct ChatModelPolicy {
    model: String,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl ChatModelPolicy {
    pub fn new(config: &ConfidenceConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("confidence.model required for model policy"))?;
        let base = config.url.as_deref().unwrap_or(DEFAULT_CHAT_URL);
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            model,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            timeout,
            client,
        })
    }

    fn user_prompt(input: &ConfidenceInput) -> String {
        format!(
            "Retrieval statistics:\n\
             - mean confidence: {:.3} (threshold {:.1})\n\
             - distinct sources: {} ({})\n\
             - chunks retrieved: {}\n\
             - question category: {}\n\
             Decide: accept or escalate?",
            input.mean_score,
            ACCEPT_THRESHOLD,
            input.source_count,
            input.sources.join(", "),
            input.chunk_count,
            if input.category.is_empty() {
                "general"
            } else {
                input.category.as_str()
            }
        )
    }

    async fn complete(&self, input: &ConfidenceInput) -> Result<String, PolicyError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::user_prompt(input)},
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PolicyError::Timeout
            } else {
                PolicyError::Backend(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PolicyError::Backend(format!("HTTP {}: {}", status, text)));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PolicyError::Parse(e.to_string()))?;
        extract_message_content(&json)
    }
}

/// `choices[0].message.content` of a chat completion.
fn extract_message_content(json: &serde_json::Value) -> Result<String, PolicyError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| PolicyError::Parse("chat response has no message content".into()))
}

#[async_trait]
impl ConfidencePolicy for ChatModelPolicy {
    fn name(&self) -> &str {
        &self.model
    }

    async fn evaluate(&self, input: &ConfidenceInput) -> Result<ConfidenceDecision, PolicyError> {
        let content = tokio::time::timeout(self.timeout, self.complete(input))
            .await
            .map_err(|_| PolicyError::Timeout)??;
        let verdict = ModelVerdict::parse(&content)?;
        Ok(verdict.into_decision(&input.baseline(), input.mean_score))
    }
}

/// Build the configured policy, always layered over the rule gate.
pub fn build_policy(config: &ConfidenceConfig) -> Result<FallbackPolicy> {
    let primary: Box<dyn ConfidencePolicy> = match config.policy.as_str() {
        "rules" => Box::new(RuleGate),
        "model" => Box::new(ChatModelPolicy::new(config)?),
        other => bail!("Unknown confidence.policy: {}", other),
    };
    Ok(FallbackPolicy::new(primary, config.unambiguous_margin))
}
