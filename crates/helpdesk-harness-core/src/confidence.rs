//! Confidence gate: accept or escalate based on retrieval statistics.
//!
//! [`decide`] is the deterministic baseline. Richer policies implement
//! [`ConfidencePolicy`] and are composed with the baseline through
//! [`FallbackPolicy`], which falls back to [`decide`] on any policy error
//! and never lets the richer policy overturn the baseline in unambiguous
//! cases (see [`reconcile`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PolicyError;
use crate::models::{ConfidenceDecision, Priority, RetrievalResult, Verdict};

/// Minimum mean score for an automatic answer.
pub const ACCEPT_THRESHOLD: f64 = 0.6;
/// Escalations below this mean score are high priority.
pub const HIGH_PRIORITY_BELOW: f64 = 0.3;
/// Escalations below this mean score (and at least [`HIGH_PRIORITY_BELOW`])
/// are medium priority.
pub const MEDIUM_PRIORITY_BELOW: f64 = 0.5;
/// Default distance from [`ACCEPT_THRESHOLD`] beyond which the baseline
/// verdict is final.
pub const DEFAULT_UNAMBIGUOUS_MARGIN: f64 = 0.15;

/// Escalation priority band for a mean score.
pub fn priority_for(mean_score: f64) -> Priority {
    if mean_score.is_nan() || mean_score < HIGH_PRIORITY_BELOW {
        Priority::High
    } else if mean_score < MEDIUM_PRIORITY_BELOW {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Baseline decision. Pure and total.
///
/// Accepts when `mean_score >= 0.6` and at least one source backs it;
/// escalates otherwise, with a priority from [`priority_for`].
///
/// ```
/// use helpdesk_harness_core::confidence::decide;
/// use helpdesk_harness_core::models::{Priority, Verdict};
///
/// assert_eq!(decide(0.6, 1, 1).verdict, Verdict::Accept);
/// assert_eq!(decide(0.9, 0, 0).verdict, Verdict::Escalate);
/// assert_eq!(decide(0.45, 1, 1).priority, Some(Priority::Medium));
/// ```
pub fn decide(mean_score: f64, source_count: usize, chunk_count: usize) -> ConfidenceDecision {
    let final_confidence = clamp_unit(mean_score);
    if mean_score >= ACCEPT_THRESHOLD && source_count >= 1 {
        ConfidenceDecision {
            verdict: Verdict::Accept,
            final_confidence,
            priority: None,
            reason: format!(
                "confidence {:.0}% with {} source(s) over {} chunk(s)",
                final_confidence * 100.0,
                source_count,
                chunk_count
            ),
        }
    } else {
        let reason = if source_count == 0 {
            "no supporting source found".to_string()
        } else {
            format!(
                "confidence {:.0}% below the {:.0}% threshold",
                final_confidence * 100.0,
                ACCEPT_THRESHOLD * 100.0
            )
        };
        ConfidenceDecision {
            verdict: Verdict::Escalate,
            final_confidence,
            priority: Some(priority_for(mean_score)),
            reason,
        }
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Retrieval statistics a policy decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInput {
    pub mean_score: f64,
    pub source_count: usize,
    pub chunk_count: usize,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub category: String,
}

impl ConfidenceInput {
    pub fn from_result(result: &RetrievalResult, category: &str) -> Self {
        Self {
            mean_score: result.mean_score,
            source_count: result.source_count(),
            chunk_count: result.chunk_count,
            sources: result.sources.iter().cloned().collect(),
            category: category.to_string(),
        }
    }

    pub fn baseline(&self) -> ConfidenceDecision {
        decide(self.mean_score, self.source_count, self.chunk_count)
    }
}

/// A strategy that turns retrieval statistics into a decision.
#[async_trait]
pub trait ConfidencePolicy: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, input: &ConfidenceInput) -> Result<ConfidenceDecision, PolicyError>;
}

/// The baseline rule as a policy. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleGate;

#[async_trait]
impl ConfidencePolicy for RuleGate {
    fn name(&self) -> &str {
        "rules"
    }

    async fn evaluate(&self, input: &ConfidenceInput) -> Result<ConfidenceDecision, PolicyError> {
        Ok(input.baseline())
    }
}

/// Structured output expected from a model-backed policy. Every field is
/// optional; gaps are filled from the baseline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelVerdict {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl ModelVerdict {
    /// Extract a verdict from raw model text: code fences are stripped and
    /// the outermost `{...}` is parsed as JSON.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let mut content = raw.trim();
        if content.starts_with("```") {
            content = content
                .split_once('\n')
                .map(|(_, rest)| rest)
                .unwrap_or("");
            content = content.trim_end().trim_end_matches("```");
        }
        let start = content.find('{');
        let end = content.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if e > s => &content[s..=e],
            _ => return Err(PolicyError::Parse("no JSON object in model output".into())),
        };
        serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Complete this verdict into a decision, filling gaps from `baseline`.
    pub fn into_decision(self, baseline: &ConfidenceDecision, mean_score: f64) -> ConfidenceDecision {
        let verdict = match self.decision.as_deref().map(str::trim) {
            Some(d) if d.eq_ignore_ascii_case("accept") => Verdict::Accept,
            Some(d) if d.eq_ignore_ascii_case("escalate") => Verdict::Escalate,
            _ => baseline.verdict,
        };
        let final_confidence = clamp_unit(self.confidence.unwrap_or(mean_score));
        let priority = match verdict {
            Verdict::Accept => None,
            Verdict::Escalate => {
                let p = self
                    .priority
                    .as_deref()
                    .and_then(Priority::parse)
                    .unwrap_or_else(|| priority_for(mean_score));
                Some(p.min(Priority::High))
            }
        };
        let reason = self
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| baseline.reason.clone());
        ConfidenceDecision {
            verdict,
            final_confidence,
            priority,
            reason,
        }
    }
}

/// Keep `candidate` unless it contradicts the baseline in a case the
/// baseline settles on its own: no sources, or a mean score at least
/// `margin` away from [`ACCEPT_THRESHOLD`].
pub fn reconcile(
    input: &ConfidenceInput,
    candidate: ConfidenceDecision,
    margin: f64,
) -> ConfidenceDecision {
    let baseline = input.baseline();
    let unambiguous = input.source_count == 0
        || (input.mean_score - ACCEPT_THRESHOLD).abs() >= margin
        || input.mean_score.is_nan();
    if unambiguous && candidate.verdict != baseline.verdict {
        debug!(
            mean_score = input.mean_score,
            model_verdict = %candidate.verdict,
            "policy verdict overruled by baseline"
        );
        return baseline;
    }
    candidate
}

/// Primary policy with the baseline rule as the secondary tier.
pub struct FallbackPolicy {
    primary: Box<dyn ConfidencePolicy>,
    margin: f64,
}

impl FallbackPolicy {
    pub fn new(primary: Box<dyn ConfidencePolicy>, margin: f64) -> Self {
        Self { primary, margin }
    }

    /// Evaluate with the primary; on error, log and use [`decide`].
    pub async fn decide(&self, input: &ConfidenceInput) -> ConfidenceDecision {
        match self.primary.evaluate(input).await {
            Ok(candidate) => reconcile(input, candidate, self.margin),
            Err(e) => {
                warn!(
                    policy = self.primary.name(),
                    error = %e,
                    "confidence policy failed; using rule gate"
                );
                input.baseline()
            }
        }
    }
}

#[async_trait]
impl ConfidencePolicy for FallbackPolicy {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn evaluate(&self, input: &ConfidenceInput) -> Result<ConfidenceDecision, PolicyError> {
        Ok(self.decide(input).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(mean: f64, sources: usize) -> ConfidenceInput {
        ConfidenceInput {
            mean_score: mean,
            source_count: sources,
            chunk_count: sources,
            sources: Vec::new(),
            category: String::new(),
        }
    }

    struct Scripted(Result<ConfidenceDecision, ()>);

    #[async_trait]
    impl ConfidencePolicy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn evaluate(&self, _: &ConfidenceInput) -> Result<ConfidenceDecision, PolicyError> {
            self.0.clone().map_err(|_| PolicyError::Timeout)
        }
    }

    fn verdict(v: Verdict) -> ConfidenceDecision {
        ConfidenceDecision {
            verdict: v,
            final_confidence: 0.5,
            priority: (v == Verdict::Escalate).then_some(Priority::Low),
            reason: "model".into(),
        }
    }

    #[test]
    fn test_threshold_boundary() {
        assert_eq!(decide(0.6, 1, 1).verdict, Verdict::Accept);
        assert_eq!(decide(0.599999, 5, 5).verdict, Verdict::Escalate);
        assert_eq!(decide(0.9, 0, 0).verdict, Verdict::Escalate);
    }

    #[test]
    fn test_priority_bands() {
        assert_eq!(decide(0.25, 1, 1).priority, Some(Priority::High));
        assert_eq!(decide(0.45, 1, 1).priority, Some(Priority::Medium));
        assert_eq!(decide(0.55, 1, 1).priority, Some(Priority::Low));
        assert_eq!(decide(0.3, 1, 1).priority, Some(Priority::Medium));
        assert_eq!(decide(0.5, 1, 1).priority, Some(Priority::Low));
        assert_eq!(decide(0.9, 1, 1).priority, None);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(decide(1.4, 1, 1).final_confidence, 1.0);
        assert_eq!(decide(-0.2, 1, 1).final_confidence, 0.0);
        let nan = decide(f64::NAN, 1, 1);
        assert_eq!(nan.verdict, Verdict::Escalate);
        assert_eq!(nan.priority, Some(Priority::High));
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"decision\": \"escalate\", \"confidence\": 0.4, \"priority\": \"medium\"}\n```";
        let v = ModelVerdict::parse(raw).unwrap();
        assert_eq!(v.decision.as_deref(), Some("escalate"));
        assert_eq!(v.confidence, Some(0.4));
    }

    #[test]
    fn test_parse_embedded_object() {
        let v = ModelVerdict::parse("Sure! {\"decision\":\"accept\"} hope that helps").unwrap();
        assert_eq!(v.decision.as_deref(), Some("accept"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(ModelVerdict::parse("no json here"), Err(PolicyError::Parse(_))));
        assert!(matches!(ModelVerdict::parse("{not json}"), Err(PolicyError::Parse(_))));
    }

    #[test]
    fn test_into_decision_fills_gaps() {
        let baseline = decide(0.45, 1, 1);
        let d = ModelVerdict::default().into_decision(&baseline, 0.45);
        assert_eq!(d.verdict, Verdict::Escalate);
        assert_eq!(d.priority, Some(Priority::Medium));
        assert_eq!(d.final_confidence, 0.45);
        assert_eq!(d.reason, baseline.reason);

        let accept = ModelVerdict {
            decision: Some("ACCEPT".into()),
            priority: Some("high".into()),
            ..Default::default()
        }
        .into_decision(&baseline, 0.45);
        assert_eq!(accept.verdict, Verdict::Accept);
        assert_eq!(accept.priority, None);
    }

    #[test]
    fn test_into_decision_caps_priority() {
        let baseline = decide(0.2, 1, 1);
        let d = ModelVerdict {
            decision: Some("escalate".into()),
            priority: Some("critical".into()),
            ..Default::default()
        }
        .into_decision(&baseline, 0.2);
        assert_eq!(d.priority, Some(Priority::High));
    }

    #[test]
    fn test_reconcile_unambiguous_keeps_baseline() {
        let d = reconcile(&input(0.95, 2), verdict(Verdict::Escalate), 0.15);
        assert_eq!(d.verdict, Verdict::Accept);

        let d = reconcile(&input(0.1, 2), verdict(Verdict::Accept), 0.15);
        assert_eq!(d.verdict, Verdict::Escalate);

        let d = reconcile(&input(0.62, 0), verdict(Verdict::Accept), 0.15);
        assert_eq!(d.verdict, Verdict::Escalate);
    }

    #[test]
    fn test_reconcile_ambiguous_trusts_policy() {
        let d = reconcile(&input(0.62, 2), verdict(Verdict::Escalate), 0.15);
        assert_eq!(d.verdict, Verdict::Escalate);
        assert_eq!(d.reason, "model");
    }

    #[tokio::test]
    async fn test_fallback_on_error_matches_decide() {
        let policy = FallbackPolicy::new(Box::new(Scripted(Err(()))), 0.15);
        let i = input(0.45, 1);
        assert_eq!(policy.decide(&i).await, decide(0.45, 1, 1));
    }

    #[tokio::test]
    async fn test_fallback_uses_primary_when_ok() {
        let policy = FallbackPolicy::new(Box::new(Scripted(Ok(verdict(Verdict::Accept)))), 0.15);
        let d = policy.decide(&input(0.55, 2)).await;
        assert_eq!(d.verdict, Verdict::Accept);
        assert_eq!(d.reason, "model");
    }

    #[tokio::test]
    async fn test_rule_gate_policy() {
        let d = RuleGate.evaluate(&input(0.7, 1)).await.unwrap();
        assert_eq!(d, decide(0.7, 1, 1));
    }
}
