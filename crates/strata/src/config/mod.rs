use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure for Strata
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retrieval defaults
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Context assembly defaults
    #[serde(default)]
    pub context: ContextConfig,
    /// Consolidation pipeline configuration
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Decay and hygiene sweep configuration
    #[serde(default)]
    pub decay: DecayConfig,
    /// Remote extraction agent configuration
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the database file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Episode capacity ceiling for hygiene cleanup
    #[serde(default = "default_episode_capacity")]
    pub episode_capacity: usize,
    /// Episode time-to-live in days
    #[serde(default = "default_episode_ttl_days")]
    pub episode_ttl_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            episode_capacity: default_episode_capacity(),
            episode_ttl_days: default_episode_ttl_days(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_episode_capacity() -> usize {
    10_000
}

fn default_episode_ttl_days() -> i64 {
    7
}

/// Retrieval defaults, overridable per call
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Default result limit
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Minimum effective confidence for recall results
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Weight of relevance in the composite recall score
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    /// Weight of importance in the composite recall score
    #[serde(default = "default_importance_weight")]
    pub importance_weight: f64,
    /// Weight of recency in the composite recall score
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// Weight of effective confidence in the composite recall score
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,
    /// Query-embedding cache entries
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            min_confidence: default_min_confidence(),
            relevance_weight: default_relevance_weight(),
            importance_weight: default_importance_weight(),
            recency_weight: default_recency_weight(),
            confidence_weight: default_confidence_weight(),
            query_cache_size: default_query_cache_size(),
        }
    }
}

fn default_limit() -> usize {
    10
}

fn default_min_confidence() -> f64 {
    0.2
}

fn default_relevance_weight() -> f64 {
    0.4
}

fn default_importance_weight() -> f64 {
    0.3
}

fn default_recency_weight() -> f64 {
    0.2
}

fn default_confidence_weight() -> f64 {
    0.1
}

fn default_query_cache_size() -> usize {
    256
}

/// Context assembly defaults
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Token budget for an assembled context block
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Maximum facts section size
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
    /// Maximum rules section size
    #[serde(default = "default_max_rules")]
    pub max_rules: usize,
    /// Maximum recent-episodes section size (0 disables the section)
    #[serde(default = "default_max_episodes")]
    pub max_episodes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_facts: default_max_facts(),
            max_rules: default_max_rules(),
            max_episodes: default_max_episodes(),
        }
    }
}

fn default_token_budget() -> usize {
    3000
}

fn default_max_facts() -> usize {
    10
}

fn default_max_rules() -> usize {
    5
}

fn default_max_episodes() -> usize {
    3
}

/// Consolidation pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationConfig {
    /// Attempt ceiling before an episode is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minutes until a failed episode becomes eligible for retry
    #[serde(default = "default_retry_backoff_minutes")]
    pub retry_backoff_minutes: i64,
    /// Reference cadence between pipeline runs, in hours
    #[serde(default = "default_cadence_hours")]
    pub cadence_hours: u64,
    /// Timeout for a single extraction agent call, in seconds
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_minutes: default_retry_backoff_minutes(),
            cadence_hours: default_cadence_hours(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_minutes() -> i64 {
    30
}

fn default_cadence_hours() -> u64 {
    6
}

fn default_agent_timeout_secs() -> u64 {
    60
}

/// Decay sweep thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    /// Effective confidence below which items fade
    #[serde(default = "default_retrieval_threshold")]
    pub retrieval_threshold: f64,
    /// Effective confidence below which items expire
    #[serde(default = "default_expiry_threshold")]
    pub expiry_threshold: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            retrieval_threshold: default_retrieval_threshold(),
            expiry_threshold: default_expiry_threshold(),
        }
    }
}

fn default_retrieval_threshold() -> f64 {
    0.2
}

fn default_expiry_threshold() -> f64 {
    0.05
}

/// Remote extraction agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    /// OpenAI-compatible API endpoint URL
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_extractor_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_extractor_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_api_key_env(),
            model: default_extractor_model(),
            timeout_secs: default_extractor_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "STRATA_EXTRACTOR_API_KEY".to_string()
}

fn default_extractor_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_extractor_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.episode_capacity, 10_000);
        assert_eq!(config.storage.episode_ttl_days, 7);
        assert_eq!(config.retrieval.default_limit, 10);
        assert_eq!(config.retrieval.min_confidence, 0.2);
        assert_eq!(config.retrieval.relevance_weight, 0.4);
        assert_eq!(config.retrieval.importance_weight, 0.3);
        assert_eq!(config.retrieval.recency_weight, 0.2);
        assert_eq!(config.retrieval.confidence_weight, 0.1);
        assert_eq!(config.context.token_budget, 3000);
        assert_eq!(config.consolidation.max_attempts, 3);
        assert_eq!(config.consolidation.cadence_hours, 6);
        assert_eq!(config.decay.retrieval_threshold, 0.2);
        assert_eq!(config.decay.expiry_threshold, 0.05);
        assert_eq!(config.extractor.api_key_env, "STRATA_EXTRACTOR_API_KEY");
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/strata"
episode_capacity = 500
episode_ttl_days = 3

[retrieval]
default_limit = 20
min_confidence = 0.1

[context]
token_budget = 1500
max_facts = 4

[consolidation]
max_attempts = 5
agent_timeout_secs = 10

[decay]
retrieval_threshold = 0.3

[extractor]
api_url = "https://api.example.com/v1"
model = "gpt-4"
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/strata"));
        assert_eq!(config.storage.episode_capacity, 500);
        assert_eq!(config.storage.episode_ttl_days, 3);
        assert_eq!(config.retrieval.default_limit, 20);
        assert_eq!(config.retrieval.min_confidence, 0.1);
        assert_eq!(config.context.token_budget, 1500);
        assert_eq!(config.context.max_facts, 4);
        assert_eq!(config.consolidation.max_attempts, 5);
        assert_eq!(config.consolidation.agent_timeout_secs, 10);
        assert_eq!(config.decay.retrieval_threshold, 0.3);
        assert_eq!(config.extractor.api_url, "https://api.example.com/v1");
        assert_eq!(config.extractor.model, "gpt-4");
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[retrieval]
default_limit = 5
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse partial TOML");
        assert_eq!(config.retrieval.default_limit, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.retrieval.min_confidence, 0.2);
        assert_eq!(config.storage.episode_capacity, 10_000);
        assert_eq!(config.decay.expiry_threshold, 0.05);
    }

    #[test]
    fn test_empty_toml_is_valid() {
        let config: Config = toml::from_str("").expect("Empty config should parse");
        assert_eq!(config.context.token_budget, 3000);
    }
}
