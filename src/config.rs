//! TOML configuration.
//!
//! Every section except `[db]` has serde defaults, so a minimal config is
//! just a database path. Validation happens once in [`load_config`]; the
//! rest of the crate assumes a validated [`Config`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ErrorClass;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tagger: TaggerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub anchor: AnchorProfile,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_openai_url")]
    pub url: String,
    /// Texts per embedding API call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Contacts read from the store per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_cost")]
    pub cost_per_mtok: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: default_openai_url(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            timeout_secs: default_embedding_timeout(),
            cost_per_mtok: default_embedding_cost(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_completion_model(),
            url: default_openai_url(),
            timeout_secs: default_completion_timeout(),
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_flat_delay_ms")]
    pub flat_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            flat_delay_ms: default_flat_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Policy for external-service calls: rate limits back off
    /// exponentially, other transient failures wait a flat delay.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            flat_delay: Duration::from_millis(self.flat_delay_ms),
            retry_on: vec![ErrorClass::RateLimit, ErrorClass::Transient],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaggerConfig {
    #[serde(default = "default_profile_workers")]
    pub profile_workers: usize,
    #[serde(default = "default_overlap_workers")]
    pub overlap_workers: usize,
    #[serde(default = "default_closeness_workers")]
    pub closeness_workers: usize,
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            profile_workers: default_profile_workers(),
            overlap_workers: default_overlap_workers(),
            closeness_workers: default_closeness_workers(),
            progress_every: default_progress_every(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            semantic_weight: default_weight(),
            keyword_weight: default_weight(),
            candidate_k_vector: default_candidate_k(),
            candidate_k_keyword: default_candidate_k(),
            final_limit: default_final_limit(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// The operator's own profile. Every contact's proximity and institutional
/// overlap is judged against it.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AnchorProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub employment: Vec<AnchorTenure>,
    #[serde(default)]
    pub education: Vec<AnchorTenure>,
    #[serde(default)]
    pub boards: Vec<AnchorTenure>,
    #[serde(default)]
    pub volunteering: Vec<AnchorTenure>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AnchorTenure {
    pub organization: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
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

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_page_size() -> usize {
    1000
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_cost() -> f64 {
    0.02
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_input_cost() -> f64 {
    0.15
}
fn default_output_cost() -> f64 {
    0.60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_flat_delay_ms() -> u64 {
    1000
}
fn default_profile_workers() -> usize {
    8
}
fn default_overlap_workers() -> usize {
    5
}
fn default_closeness_workers() -> usize {
    20
}
fn default_progress_every() -> u64 {
    50
}
fn default_max_error_rate() -> f64 {
    0.05
}
fn default_rrf_k() -> f64 {
    50.0
}
fn default_weight() -> f64 {
    1.0
}
fn default_candidate_k() -> usize {
    80
}
fn default_final_limit() -> usize {
    20
}
fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// A config with every section defaulted, pointed at `db_path`.
    pub fn with_db(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            embedding: EmbeddingConfig::default(),
            completion: CompletionConfig::default(),
            retry: RetryConfig::default(),
            tagger: TaggerConfig::default(),
            retrieval: RetrievalConfig::default(),
            anchor: AnchorProfile::default(),
            server: ServerConfig::default(),
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
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    match config.completion.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 || config.embedding.page_size == 0 {
        anyhow::bail!("embedding.batch_size and embedding.page_size must be > 0");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }

    let t = &config.tagger;
    if t.profile_workers == 0 || t.overlap_workers == 0 || t.closeness_workers == 0 {
        anyhow::bail!("tagger worker counts must be >= 1");
    }
    if t.progress_every == 0 {
        anyhow::bail!("tagger.progress_every must be >= 1");
    }
    if !(0.0..=1.0).contains(&t.max_error_rate) {
        anyhow::bail!("tagger.max_error_rate must be in [0.0, 1.0]");
    }

    let r = &config.retrieval;
    if r.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }
    if r.semantic_weight < 0.0 || r.keyword_weight < 0.0 {
        anyhow::bail!("retrieval weights must be >= 0");
    }
    if r.semantic_weight == 0.0 && r.keyword_weight == 0.0 {
        anyhow::bail!("retrieval.semantic_weight and retrieval.keyword_weight cannot both be 0");
    }
    if r.final_limit == 0 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse("[db]\npath = \"/tmp/rapport.sqlite\"\n").unwrap();
        assert_eq!(cfg.embedding.dims, 768);
        assert_eq!(cfg.embedding.batch_size, 100);
        assert_eq!(cfg.embedding.page_size, 1000);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retrieval.rrf_k, 50.0);
        assert!(cfg.tagger.closeness_workers > cfg.tagger.overlap_workers);
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse(include_str!("../config/rapport.example.toml")).unwrap();
        assert!(cfg.embedding.is_enabled());
        assert_eq!(cfg.anchor.employment[0].organization, "Google");
        assert_eq!(cfg.anchor.boards[0].end, None);
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn zero_weights_rejected() {
        let src = "[db]\npath = \"x\"\n[retrieval]\nsemantic_weight = 0.0\nkeyword_weight = 0.0\n";
        assert!(parse(src).is_err());
    }

    #[test]
    fn anchor_profile_parses() {
        let src = r#"
[db]
path = "x"

[anchor]
name = "Jordan Lee"
headline = "Nonprofit founder"

[[anchor.employment]]
organization = "Acme Foundation"
title = "Executive Director"
start = "2015"
end = "2021"
"#;
        let cfg = parse(src).unwrap();
        assert_eq!(cfg.anchor.name, "Jordan Lee");
        assert_eq!(cfg.anchor.employment.len(), 1);
        assert_eq!(cfg.anchor.employment[0].end.as_deref(), Some("2021"));
    }

    #[test]
    fn retry_policy_from_config() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert!(policy.retry_on.contains(&ErrorClass::RateLimit));
        assert!(!policy.retry_on.contains(&ErrorClass::Schema));
    }
}
