use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemhubConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
    /// Owner id bound to the single trusted stdio session.
    pub local_owner: String,
    /// Owner id used by remote sessions that present no bearer credential.
    pub anonymous_owner: String,
    pub idle_timeout_secs: u64,
    pub call_timeout_secs: u64,
    /// Capacity of each remote session's notification channel.
    pub event_buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub default_namespace: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    /// Inputs longer than this are truncated before embedding.
    pub max_input_chars: usize,
    pub chunk_chars: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
    pub semantic_weight: f64,
    pub lexical_weight: f64,
    /// Each signal contributes up to `k * candidate_multiplier` candidates before fusion.
    pub candidate_multiplier: usize,
    pub preview_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub max_depth: u32,
    pub max_nodes: usize,
    pub max_topics: usize,
}

impl Default for MemhubConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            graph: GraphConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8848,
            local_owner: "local".into(),
            anonymous_owner: "anonymous".into(),
            idle_timeout_secs: 900,
            call_timeout_secs: 30,
            event_buffer: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_memhub_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_namespace: crate::memory::types::SHARED_NAMESPACE.into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_memhub_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            max_input_chars: 2000,
            chunk_chars: 1000,
            chunk_overlap: 100,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 50,
            semantic_weight: 0.7,
            lexical_weight: 0.3,
            candidate_multiplier: 4,
            preview_chars: 120,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_nodes: 200,
            max_topics: 3,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// Returns `~/.memhub/`
pub fn default_memhub_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memhub")
}

/// Returns the default config file path: `~/.memhub/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memhub_dir().join("config.toml")
}

impl MemhubConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemhubConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (MEMHUB_DB, MEMHUB_LOG_LEVEL, MEMHUB_HOST,
    /// MEMHUB_PORT, MEMHUB_EMBEDDING_PROVIDER).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMHUB_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMHUB_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEMHUB_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("MEMHUB_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MEMHUB_PORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMHUB_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        anyhow::ensure!(
            r.semantic_weight.is_finite() && r.semantic_weight >= 0.0,
            "retrieval.semantic_weight must be a non-negative number"
        );
        anyhow::ensure!(
            r.lexical_weight.is_finite() && r.lexical_weight >= 0.0,
            "retrieval.lexical_weight must be a non-negative number"
        );
        anyhow::ensure!(
            r.semantic_weight + r.lexical_weight > 0.0,
            "retrieval weights must not both be zero"
        );
        anyhow::ensure!(r.max_k >= 1, "retrieval.max_k must be at least 1");
        anyhow::ensure!(
            self.embedding.chunk_overlap < self.embedding.chunk_chars,
            "embedding.chunk_overlap must be smaller than embedding.chunk_chars"
        );
        crate::memory::types::validate_namespace(&self.storage.default_namespace)
            .map_err(|e| anyhow::anyhow!("storage.default_namespace: {e}"))?;
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
