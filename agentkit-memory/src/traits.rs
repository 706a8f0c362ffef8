//! Core Memory trait shared by every backend.

use crate::context::{generate_session_id, MemoryContext};
use crate::error::Result;
use crate::rag;
use crate::types::{
    ContextOptions, Document, HybridResult, KnowledgeResult, MemoryDefaults, MemoryResult,
    Message, RagContext, SearchOptions,
};
use async_trait::async_trait;

/// Session memory plus a global knowledge base.
///
/// Personal memories, key-value facts and chat history are partitioned by the
/// session in [`MemoryContext`]; no call reads or writes another session's
/// data. The knowledge base is shared by all sessions.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Backend name (e.g., "memory", "chromem", "pgvector")
    fn name(&self) -> &str;

    /// Defaults applied when options leave a field unset.
    fn defaults(&self) -> &MemoryDefaults;

    /// Store a personal memory in the current session.
    ///
    /// Fails with no partial write if embedding fails.
    async fn store(&self, ctx: &MemoryContext, content: &str, tags: &[&str]) -> Result<()>;

    /// Personal memories of the current session, most relevant first.
    ///
    /// `limit` defaults to the configured maximum. No match is an empty list.
    async fn query(
        &self,
        ctx: &MemoryContext,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryResult>>;

    /// Upsert a session-scoped fact. Last write wins.
    async fn remember(&self, ctx: &MemoryContext, key: &str, value: serde_json::Value)
        -> Result<()>;

    /// Read a session-scoped fact; `None` if never remembered.
    async fn recall(&self, ctx: &MemoryContext, key: &str) -> Result<Option<serde_json::Value>>;

    /// Append a chat message to the current session.
    async fn add_message(&self, ctx: &MemoryContext, role: &str, content: &str) -> Result<()>;

    /// Chat history in chronological order. With a limit, the most recent
    /// `limit` messages, still oldest first.
    async fn get_history(&self, ctx: &MemoryContext, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Upsert a document into the knowledge base, replacing its vector
    /// representation. Returns the document id (generated when empty).
    async fn ingest_document(&self, ctx: &MemoryContext, doc: Document) -> Result<String>;

    /// Ingest many documents. Returns ids in input order.
    async fn ingest_documents(&self, ctx: &MemoryContext, docs: Vec<Document>)
        -> Result<Vec<String>>;

    /// Filtered, ranked knowledge-base search.
    async fn search_knowledge(
        &self,
        ctx: &MemoryContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeResult>>;

    /// Personal and knowledge results for one query.
    async fn search_all(
        &self,
        ctx: &MemoryContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<HybridResult> {
        rag::search_all(self, ctx, query, options).await
    }

    /// Token-bounded context for a prompt.
    async fn build_context(
        &self,
        ctx: &MemoryContext,
        query: &str,
        options: &ContextOptions,
    ) -> Result<RagContext> {
        rag::build_context(self, ctx, query, options).await
    }

    /// Fresh session id.
    fn new_session(&self) -> String {
        generate_session_id()
    }

    /// Context bound to `session_id`, keeping the caller's cancellation.
    fn set_session(&self, ctx: &MemoryContext, session_id: &str) -> MemoryContext {
        ctx.with_session(session_id)
    }

    /// Remove personal memories, facts and chat history of the current
    /// session. Other sessions and the knowledge base are untouched.
    async fn clear_session(&self, ctx: &MemoryContext) -> Result<()>;

    /// Release resources. Later calls fail with `MemoryError::Closed`.
    async fn close(&self) -> Result<()>;

    /// True while the backend can serve requests.
    async fn health_check(&self) -> bool;
}
