//! Backend selection from configuration.

use crate::embedded::EmbeddedMemory;
use crate::embedding::{create_embedding_provider, EmbeddingProvider};
use crate::ephemeral::EphemeralMemory;
use crate::error::{MemoryError, Result};
use crate::postgres::PgVectorMemory;
use crate::stub::UnimplementedMemory;
use crate::traits::Memory;
use crate::types::MemoryDefaults;
use agentkit_common::{MemoryConfig, Validate};
use std::sync::Arc;

/// Storage backend named by `MemoryConfig::provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `memory`, `inmemory`
    Ephemeral,
    /// `chromem`, `embedded`, `vector`
    Embedded,
    /// `pgvector`, `postgres`
    PgVector,
    /// `weaviate`
    Weaviate,
}

impl BackendKind {
    pub fn parse(provider: &str) -> Result<Self> {
        match provider.trim().to_lowercase().as_str() {
            "memory" | "inmemory" => Ok(Self::Ephemeral),
            "chromem" | "embedded" | "vector" => Ok(Self::Embedded),
            "pgvector" | "postgres" => Ok(Self::PgVector),
            "weaviate" => Ok(Self::Weaviate),
            other => Err(MemoryError::Config(format!(
                "unknown memory provider: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "memory",
            Self::Embedded => "chromem",
            Self::PgVector => "pgvector",
            Self::Weaviate => "weaviate",
        }
    }
}

/// Build the backend named by `config.provider`.
///
/// `embedder` is used by the vector backends; the ephemeral backend ignores
/// it and the embedded one falls back to zero vectors without it.
pub async fn create_memory(
    config: &MemoryConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<dyn Memory>> {
    config.validate()?;
    let kind = BackendKind::parse(&config.provider)?;

    let memory: Arc<dyn Memory> = match kind {
        BackendKind::Ephemeral => Arc::new(EphemeralMemory::new(MemoryDefaults::from_config(config))),
        BackendKind::Embedded => Arc::new(EmbeddedMemory::open(config, embedder).await?),
        BackendKind::PgVector => Arc::new(PgVectorMemory::connect(config, embedder).await?),
        BackendKind::Weaviate => Arc::new(UnimplementedMemory::new(
            kind.as_str(),
            MemoryDefaults::from_config(config),
        )),
    };

    tracing::info!(backend = kind.as_str(), "Memory backend ready");
    Ok(memory)
}

/// Like [`create_memory`], building the embedder from `config.embedding`.
pub async fn create_memory_from_config(config: &MemoryConfig) -> Result<Arc<dyn Memory>> {
    let embedder = match BackendKind::parse(&config.provider)? {
        BackendKind::Ephemeral | BackendKind::Weaviate => None,
        BackendKind::Embedded | BackendKind::PgVector => Some(
            create_embedding_provider(&config.embedding, config.dimensions)
                .map_err(|e| MemoryError::Config(format!("{e:#}")))?,
        ),
    };
    create_memory(config, embedder).await
}
