//! Error types for memory operations.
//!
//! Messages name the operation and salient identifiers (document ids, batch
//! ranges). Session ids never appear in error text.

use thiserror::Error;

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Substrings of backend error text that mark a failure as transient.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "temporary failure",
    "server is not ready",
    "too many connections",
    "connection lost",
    "network unreachable",
    "host unreachable",
];

/// Errors returned by memory backends.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Invalid construction parameters; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Embedding service failure; nothing was written
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Storage failure reported by the backend
    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Cancellation observed while waiting between retries
    #[error("{operation} cancelled during retry backoff")]
    Cancelled { operation: String },

    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented { backend: String, operation: String },

    /// A batch sub-range failed; earlier sub-batches stay committed
    #[error("{operation} failed for items {start}..{end} ({committed} committed before the failure): {message}")]
    PartialBatch {
        operation: String,
        start: usize,
        end: usize,
        committed: usize,
        message: String,
    },

    #[error("Memory backend is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<MemoryError>,
    },
}

impl MemoryError {
    /// Backend error for a named operation.
    pub fn backend(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Embedding error, keeping the full cause chain of `anyhow` errors.
    pub fn embedding(err: &anyhow::Error) -> Self {
        Self::Embedding(format!("{err:#}"))
    }

    pub fn not_implemented(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Only backend errors whose text matches [`RETRYABLE_PATTERNS`] qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { message, .. } => {
                let lower = message.to_lowercase();
                RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
            }
            Self::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        match self {
            Self::NotImplemented { .. } => true,
            Self::WithContext { source, .. } => source.is_not_implemented(),
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::WithContext { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}

impl From<agentkit_common::Error> for MemoryError {
    fn from(err: agentkit_common::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<agentkit_common::ValidationError> for MemoryError {
    fn from(err: agentkit_common::ValidationError) -> Self {
        Self::Config(err.to_string())
    }
}
