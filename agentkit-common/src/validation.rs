//! Configuration validation.
//!
//! Each configuration section implements [`Validate`]; the top-level memory
//! config collects every failing section instead of stopping at the first.

use thiserror::Error;

use crate::config::{EmbeddingConfig, MemoryConfig, PoolConfig, RetryConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

/// Provider names the memory factory understands.
pub const KNOWN_PROVIDERS: &[&str] = &[
    "memory", "inmemory", "chromem", "embedded", "vector", "pgvector", "postgres", "weaviate",
];

/// Embedding provider names the embedding factory understands.
pub const KNOWN_EMBEDDING_PROVIDERS: &[&str] = &["dummy", "openai", "ollama"];

fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ValidationError::Multiple(errors))
    }
}

fn unit_interval(field: &str, value: f32) -> ValidationResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue {
            field: field.into(),
            reason: format!("{value} is outside 0.0..=1.0"),
        })
    }
}

fn positive(field: &str, value: usize) -> ValidationResult<()> {
    if value == 0 {
        Err(ValidationError::InvalidValue {
            field: field.into(),
            reason: "must be greater than zero".into(),
        })
    } else {
        Ok(())
    }
}

impl Validate for MemoryConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let provider = self.provider.trim().to_lowercase();

        if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
            errors.push(ValidationError::InvalidValue {
                field: "provider".into(),
                reason: format!("must be one of: {}", KNOWN_PROVIDERS.join(", ")),
            });
        }

        if matches!(provider.as_str(), "pgvector" | "postgres") && self.connection.trim().is_empty()
        {
            errors.push(ValidationError::MissingField {
                field: "connection (required for pgvector provider)".into(),
            });
        }

        let checks = [
            positive("dimensions", self.dimensions),
            positive("max_results", self.max_results),
            positive("knowledge_max_results", self.knowledge_max_results),
            positive("rag_max_context_tokens", self.rag_max_context_tokens),
            positive("ingest_batch_size", self.ingest_batch_size),
            unit_interval("knowledge_score_threshold", self.knowledge_score_threshold),
            unit_interval("rag_personal_weight", self.rag_personal_weight),
            unit_interval("rag_knowledge_weight", self.rag_knowledge_weight),
            self.embedding.validate(),
            self.pool.validate(),
            self.retry.validate(),
        ];
        errors.extend(checks.into_iter().filter_map(Result::err));

        if self.chunk_overlap >= self.chunk_size {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "chunk_overlap ({}) must be smaller than chunk_size ({})",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }

        collect(errors)
    }
}

impl Validate for EmbeddingConfig {
    fn validate(&self) -> ValidationResult<()> {
        let provider = self.provider.trim().to_lowercase();
        if !KNOWN_EMBEDDING_PROVIDERS.contains(&provider.as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "embedding.provider".into(),
                reason: format!("must be one of: {}", KNOWN_EMBEDDING_PROVIDERS.join(", ")),
            });
        }

        if provider == "openai" && self.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(ValidationError::MissingField {
                field: "embedding.api_key (required for openai provider)".into(),
            });
        }

        positive("embedding.max_batch_size", self.max_batch_size)
    }
}

impl Validate for PoolConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_connections == 0 {
            return Err(ValidationError::InvalidValue {
                field: "pool.max_connections".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.min_connections > self.max_connections {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "pool.min_connections ({}) exceeds pool.max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            });
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidValue {
                field: "retry.max_attempts".into(),
                reason: "must allow at least one attempt".into(),
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ValidationError::Conflict {
                reason: "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            });
        }
        Ok(())
    }
}
