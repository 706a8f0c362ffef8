//! agentkit memory: session memory and a global knowledge base for agents.
//!
//! Every backend implements [`Memory`]:
//! - [`EphemeralMemory`]: in-process, lexical scoring, no embeddings
//! - [`EmbeddedMemory`]: in-process vector index, optional SQLite file
//! - [`PgVectorMemory`]: PostgreSQL with pgvector, pooled and retried
//! - [`UnimplementedMemory`]: recognised but unsupported providers
//!
//! ## Architecture
//!
//! ```text
//! MemoryConfig ─→ create_memory ─→ Arc<dyn Memory>
//!                                      │
//!         search_all / build_context ──┤ (shared, rag.rs)
//!                                      │
//!   personal memory · facts · chat ────┤ (per session, MemoryContext)
//!   documents · knowledge ─────────────┘ (global)
//! ```
//!
//! Personal memories, facts and chat history are scoped by the session id in
//! [`MemoryContext`]. The knowledge base is shared by all sessions.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod context;
pub mod embedded;
pub mod embedding;
pub mod ephemeral;
pub mod error;
pub mod factory;
pub mod postgres;
pub mod rag;
pub mod retry;
pub mod scoring;
pub mod stub;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use context::{generate_session_id, MemoryContext, DEFAULT_SESSION};
pub use embedded::EmbeddedMemory;
pub use embedding::{
    create_embedding_provider, CachedEmbedding, DummyEmbedding, EmbeddingProvider,
    OllamaEmbedding, OpenAiEmbedding,
};
pub use ephemeral::EphemeralMemory;
pub use error::{MemoryError, Result};
pub use factory::{create_memory, create_memory_from_config, BackendKind};
pub use postgres::{PersonalMemory, PgVectorMemory};
pub use retry::{with_retry, RetryPolicy};
pub use stub::UnimplementedMemory;
pub use traits::Memory;
pub use types::{
    ContextOptions, DateRange, Document, DocumentType, HybridResult, KnowledgeResult,
    MemoryDefaults, MemoryResult, Message, RagContext, SearchOptions,
};
