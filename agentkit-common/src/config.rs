//! Configuration for the agentkit memory subsystem.
//!
//! The memory configuration lives at `~/.agentkit/memory.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (AGENTKIT_* prefix, plus provider API keys)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `AGENTKIT_MEMORY_PROVIDER` → provider
//! - `AGENTKIT_MEMORY_CONNECTION` → connection
//! - `AGENTKIT_MEMORY_DIMENSIONS` → dimensions
//! - `AGENTKIT_EMBEDDING_PROVIDER` → embedding.provider
//! - `AGENTKIT_EMBEDDING_MODEL` → embedding.model
//! - `OPENAI_API_KEY` → embedding.api_key
//! - `OLLAMA_BASE_URL` → embedding.base_url

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ResultExt};
use crate::validation::Validate;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".agentkit"),
        |dirs| dirs.home_dir().join(".agentkit"),
    )
}

/// Get the memory configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("memory.json")
}

// ============================================================================
// Memory Configuration
// ============================================================================

/// Memory subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Backend provider: memory, chromem, pgvector or weaviate (plus aliases)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Connection string. A PostgreSQL URL for pgvector, a file path (or
    /// "memory") for the embedded vector backend.
    #[serde(default = "default_connection")]
    pub connection: String,

    /// Default limit for personal memory queries
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Embedding dimensions, fixed per deployment
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Default limit for knowledge searches
    #[serde(default = "default_knowledge_max_results")]
    pub knowledge_max_results: usize,

    /// Default minimum score for knowledge searches
    #[serde(default = "default_knowledge_score_threshold")]
    pub knowledge_score_threshold: f32,

    /// Chunk size hint for callers that split documents
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunk overlap hint for callers that split documents
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_rag_max_context_tokens")]
    pub rag_max_context_tokens: usize,

    #[serde(default = "default_rag_personal_weight")]
    pub rag_personal_weight: f32,

    #[serde(default = "default_rag_knowledge_weight")]
    pub rag_knowledge_weight: f32,

    #[serde(default = "default_true")]
    pub rag_include_sources: bool,

    /// Number of recent chat messages included in RAG context
    #[serde(default = "default_rag_history_limit")]
    pub rag_history_limit: usize,

    /// Documents per transaction during batch ingestion
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

fn default_provider() -> String {
    "memory".into()
}

fn default_connection() -> String {
    "memory".into()
}

fn default_max_results() -> usize {
    10
}

fn default_dimensions() -> usize {
    1536
}

fn default_knowledge_max_results() -> usize {
    20
}

fn default_knowledge_score_threshold() -> f32 {
    0.7
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_rag_max_context_tokens() -> usize {
    4000
}

fn default_rag_personal_weight() -> f32 {
    0.3
}

fn default_rag_knowledge_weight() -> f32 {
    0.7
}

fn default_rag_history_limit() -> usize {
    5
}

fn default_ingest_batch_size() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            connection: default_connection(),
            max_results: default_max_results(),
            dimensions: default_dimensions(),
            knowledge_max_results: default_knowledge_max_results(),
            knowledge_score_threshold: default_knowledge_score_threshold(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            rag_max_context_tokens: default_rag_max_context_tokens(),
            rag_personal_weight: default_rag_personal_weight(),
            rag_knowledge_weight: default_rag_knowledge_weight(),
            rag_include_sources: true,
            rag_history_limit: default_rag_history_limit(),
            ingest_batch_size: default_ingest_batch_size(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Load configuration from `~/.agentkit/memory.json`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Memory config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load from the default path, apply environment overrides and validate.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        Ok(Self::load()?.validated()?)
    }

    /// Load from `path`, apply environment overrides and validate.
    pub fn load_and_validate_from(path: &Path) -> Result<Self> {
        Self::load_from(path)?.validated()
    }

    fn validated(mut self) -> Result<Self> {
        self.apply_env_overrides();
        self.validate().context("Memory configuration is invalid")?;
        Ok(self)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = std::env::var("AGENTKIT_MEMORY_PROVIDER") {
            self.provider = provider;
        }
        if let Ok(connection) = std::env::var("AGENTKIT_MEMORY_CONNECTION") {
            self.connection = connection;
        }
        if let Ok(dims) = std::env::var("AGENTKIT_MEMORY_DIMENSIONS") {
            if let Ok(d) = dims.parse() {
                self.dimensions = d;
            }
        }
        if let Ok(provider) = std::env::var("AGENTKIT_EMBEDDING_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Ok(model) = std::env::var("AGENTKIT_EMBEDDING_MODEL") {
            self.embedding.model = Some(model);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if self.embedding.api_key.is_none() {
                self.embedding.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            if self.embedding.base_url.is_none() {
                self.embedding.base_url = Some(url);
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).context(format!(
                    "Failed to create config directory {}",
                    dir.display()
                ))?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).context(format!("Failed to write config to {}", path.display()))
    }

    /// Score threshold applied to knowledge searches when the caller gives none.
    ///
    /// Zero-vector embeddings from the dummy provider score 0 against
    /// everything, so the threshold is dropped for it.
    pub fn effective_knowledge_score_threshold(&self) -> f32 {
        if self.embedding.provider.trim().eq_ignore_ascii_case("dummy") {
            0.0
        } else {
            self.knowledge_score_threshold
        }
    }

    /// Connection string with `~` and environment variables expanded.
    pub fn expanded_connection(&self) -> String {
        shellexpand::full(&self.connection)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.connection.clone())
    }
}

// ============================================================================
// Embedding Configuration
// ============================================================================

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// dummy, openai or ollama
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Model name; provider default when unset
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Override the provider's API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Maximum texts per embedding request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_true")]
    pub cache_embeddings: bool,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

fn default_embedding_provider() -> String {
    "dummy".into()
}

fn default_max_batch_size() -> usize {
    100
}

fn default_cache_size() -> usize {
    1000
}

fn default_embedding_timeout() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            api_key: None,
            base_url: None,
            max_batch_size: default_max_batch_size(),
            cache_embeddings: true,
            cache_size: default_cache_size(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

// ============================================================================
// Pool & Retry Configuration
// ============================================================================

/// Connection pool bounds for the relational backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long a caller waits for a free connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Ping connections before handing them out
    #[serde(default = "default_true")]
    pub test_before_acquire: bool,
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    3600
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_lifetime_secs: default_max_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            test_before_acquire: true,
        }
    }
}

/// Exponential backoff policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
