use serde::{Deserialize, Serialize};

/// Rate-limit and retry settings attached per LLM model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<usize>,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub retry_attempts: u32,
    pub retry_delay_seconds: f64,
    /// TTL for cached completions, in seconds. None disables caching.
    pub cache_ttl_seconds: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.7,
            max_tokens: None,
            requests_per_minute: 50,
            tokens_per_minute: 40_000,
            retry_attempts: 3,
            retry_delay_seconds: 1.0,
            cache_ttl_seconds: Some(3600),
        }
    }
}

/// In-memory cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_seconds: Some(3600),
        }
    }
}

/// Analysis engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enable_caching: bool,
    pub timeout_seconds: Option<u64>,
    pub collect_metrics: bool,
    /// TTL used when storing successful results.
    pub cache_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_caching: false,
            timeout_seconds: None,
            collect_metrics: false,
            cache_ttl_seconds: 3600,
        }
    }
}

/// Investigation pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub adaptive: bool,
    pub continue_on_error: bool,
    pub timeout_seconds: Option<u64>,
    pub enable_parallel: bool,
    pub enable_persistence: bool,
    pub collect_metrics: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            adaptive: false,
            continue_on_error: false,
            timeout_seconds: None,
            enable_parallel: false,
            enable_persistence: false,
            collect_metrics: false,
        }
    }
}
