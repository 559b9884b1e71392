use crate::model::Source;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProviderKind {
    ProviderX,
    ProviderY,
    ProviderZ,
}

/// Process-wide configuration, enumerating exactly the recognized options
/// from the external interfaces design. Loaded once at startup and carried
/// downward via `Context` rather than read from module-level globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db_url: String,
    pub db_pool_size: usize,
    pub db_timeout: Duration,

    pub llm_provider: LlmProviderKind,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout: Duration,

    pub ingest_workers: usize,
    pub ingest_retry_max: u32,
    pub ingest_backoff_base_ms: u64,

    pub conversation_ttl_s: u64,
    pub conversation_max_messages: usize,

    pub insight_cache_ttl_s: u64,

    /// Static source priority map used by the Normalizer's conflict
    /// resolution (§4.3 Open Question: exposed here as configuration).
    pub source_priority: HashMap<Source, u8>,

    pub tool_timeout: Duration,
    pub whole_query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let mut source_priority = HashMap::new();
        source_priority.insert(Source::DialectA, 2);
        source_priority.insert(Source::DialectB, 1);

        Config {
            db_url: "memory://".to_string(),
            db_pool_size: 20,
            db_timeout: Duration::from_secs(5),

            llm_provider: LlmProviderKind::ProviderX,
            llm_api_key: String::new(),
            llm_model: "default-model".to_string(),
            llm_temperature: 0.2,
            llm_max_tokens: 1024,
            llm_timeout: Duration::from_secs(30),

            ingest_workers: 4,
            ingest_retry_max: 5,
            ingest_backoff_base_ms: 100,

            conversation_ttl_s: 3600,
            conversation_max_messages: 50,

            insight_cache_ttl_s: 3600,

            source_priority,

            tool_timeout: Duration::from_secs(10),
            whole_query_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// `Default::default()` for anything unset. Fails fast (as required of
    /// `ConfigurationError`) on values that parse but are out of range.
    pub fn from_env() -> crate::error::Result<Config> {
        use crate::error::CoreError;

        let mut config = Config::default();

        if let Ok(v) = std::env::var("DB_URL") {
            config.db_url = v;
        }
        if let Ok(v) = std::env::var("DB_POOL_SIZE") {
            config.db_pool_size = v
                .parse()
                .map_err(|_| CoreError::ConfigurationError("DB_POOL_SIZE must be a number".into()))?;
        }
        if let Ok(v) = std::env::var("LLM_PROVIDER") {
            config.llm_provider = match v.as_str() {
                "ProviderX" => LlmProviderKind::ProviderX,
                "ProviderY" => LlmProviderKind::ProviderY,
                "ProviderZ" => LlmProviderKind::ProviderZ,
                other => {
                    return Err(CoreError::ConfigurationError(format!(
                        "unknown llm_provider: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            config.llm_api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            config.llm_model = v;
        }
        if let Ok(v) = std::env::var("INGEST_WORKERS") {
            config.ingest_workers = v.parse().map_err(|_| {
                CoreError::ConfigurationError("INGEST_WORKERS must be a number".into())
            })?;
        }

        if config.db_pool_size == 0 {
            return Err(CoreError::ConfigurationError(
                "db_pool_size must be > 0".into(),
            ));
        }

        Ok(config)
    }
}
