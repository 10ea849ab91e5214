//! TOML configuration.
//!
//! Every section except `[index]` and `[db]` is optional and falls back to
//! the defaults below. [`load_config`] parses and validates; validation
//! failures are reported with the offending key.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use helpdesk_harness_core::models::ChunkingParams;
use helpdesk_harness_core::retrieve::{RerankMode, RetrieverOptions};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding `vectors.bin` and `metadata.json`.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_sentences")]
    pub overlap_sentences: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_sentences: default_overlap_sentences(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            max_tokens: self.max_tokens,
            overlap_sentences: self.overlap_sentences,
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap_sentences() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub use_augmentation: bool,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// `stored` or `reembed`; any other value fails to parse.
    #[serde(default)]
    pub rerank: RerankMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            use_augmentation: true,
            overfetch_factor: default_overfetch_factor(),
            rerank: RerankMode::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrieverOptions {
        RetrieverOptions {
            overfetch_factor: self.overfetch_factor,
            rerank: self.rerank,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_overfetch_factor() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AugmentationConfig {
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    /// Category → context terms, merged over the built-in table.
    #[serde(default)]
    pub category_terms: BTreeMap<String, String>,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            max_keywords: default_max_keywords(),
            category_terms: BTreeMap::new(),
        }
    }
}

fn default_max_keywords() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AnalysisConfig {
    /// Category → source allow-list, merged over the built-in table.
    #[serde(default)]
    pub category_documents: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfidenceConfig {
    /// `rules` or `model`.
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_policy_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_unambiguous_margin")]
    pub unambiguous_margin: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            model: None,
            url: None,
            timeout_secs: default_policy_timeout_secs(),
            unambiguous_margin: default_unambiguous_margin(),
        }
    }
}

fn default_policy() -> String {
    "rules".to_string()
}
fn default_policy_timeout_secs() -> u64 {
    20
}
fn default_unambiguous_margin() -> f64 {
    helpdesk_harness_core::confidence::DEFAULT_UNAMBIGUOUS_MARGIN
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Defaults rooted at `dir`: index under `dir/index`, database at
    /// `dir/hdx.sqlite`, hashed embeddings, rule-based confidence.
    pub fn minimal(dir: &Path) -> Self {
        Self {
            index: IndexConfig {
                dir: dir.join("index"),
            },
            db: DbConfig {
                path: dir.join("hdx.sqlite"),
            },
            documents: DocumentsConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            augmentation: AugmentationConfig::default(),
            analysis: AnalysisConfig::default(),
            embedding: EmbeddingConfig::default(),
            confidence: ConfidenceConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.overfetch_factor < 1 {
        bail!("retrieval.overfetch_factor must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hashed" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be set when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashed, openai, ollama, or local.",
            other
        ),
    }

    match config.confidence.policy.as_str() {
        "rules" => {}
        "model" => {
            if config.confidence.model.is_none() {
                bail!("confidence.model must be specified when policy is 'model'");
            }
        }
        other => bail!(
            "Unknown confidence.policy: '{}'. Must be rules or model.",
            other
        ),
    }
    if !(0.0..=1.0).contains(&config.confidence.unambiguous_margin) {
        bail!("confidence.unambiguous_margin must be in [0.0, 1.0]");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(extra: &str) -> Result<Config> {
        let toml_str = format!(
            "[index]\ndir = \"/tmp/hdx/index\"\n\n[db]\npath = \"/tmp/hdx/hdx.sqlite\"\n\n{}",
            extra
        );
        let config: Config = toml::from_str(&toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.overlap_sentences, 2);
        assert_eq!(config.retrieval.top_k, 5);
        assert!(config.retrieval.use_augmentation);
        assert_eq!(config.retrieval.options().rerank, RerankMode::Stored);
        assert_eq!(config.embedding.provider, "hashed");
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.confidence.policy, "rules");
        assert_eq!(config.server.bind, "127.0.0.1:7341");
        assert_eq!(config.documents.include_globs.len(), 3);
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let err = parse("[chunking]\nmax_tokens = 0\n").unwrap_err();
        assert!(err.to_string().contains("chunking.max_tokens"));
    }

    #[test]
    fn test_openai_requires_model_and_dims() {
        let err = parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[embedding]\nprovider = \"word2vec\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_model_policy_requires_model() {
        let err = parse("[confidence]\npolicy = \"model\"\n").unwrap_err();
        assert!(err.to_string().contains("confidence.model"));
    }

    #[test]
    fn test_rerank_reembed() {
        let config = parse("[retrieval]\nrerank = \"reembed\"\n").unwrap();
        assert_eq!(config.retrieval.options().rerank, RerankMode::Reembed);
    }

    #[test]
    fn test_unknown_rerank_fails_to_parse() {
        let err = parse("[retrieval]\nrerank = \"Reembed\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("unknown variant"));
        assert!(parse("[retrieval]\nrerank = \"cross\"\n").is_err());
    }

    #[test]
    fn test_category_terms_table() {
        let config = parse("[augmentation.category_terms]\nbilling = \"invoice refund\"\n").unwrap();
        assert_eq!(
            config.augmentation.category_terms.get("billing").map(String::as_str),
            Some("invoice refund")
        );
    }

    #[test]
    fn test_minimal_is_valid() {
        let config = Config::minimal(&PathBuf::from("/tmp/hdx"));
        validate(&config).unwrap();
        assert_eq!(config.index.dir, PathBuf::from("/tmp/hdx/index"));
    }
}
