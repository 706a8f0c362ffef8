//! Placeholder for backends that are recognised but not implemented.
//!
//! Every operation fails with [`MemoryError::NotImplemented`] so callers can
//! tell "unsupported" apart from "broken".

use crate::context::MemoryContext;
use crate::error::{MemoryError, Result};
use crate::traits::Memory;
use crate::types::{
    ContextOptions, Document, HybridResult, KnowledgeResult, MemoryDefaults, MemoryResult,
    Message, RagContext, SearchOptions,
};
use async_trait::async_trait;

pub struct UnimplementedMemory {
    backend: String,
    defaults: MemoryDefaults,
}

impl UnimplementedMemory {
    pub fn new(backend: impl Into<String>, defaults: MemoryDefaults) -> Self {
        Self {
            backend: backend.into(),
            defaults,
        }
    }

    fn unsupported<T>(&self, operation: &str) -> Result<T> {
        Err(MemoryError::not_implemented(&self.backend, operation))
    }
}

#[async_trait]
impl Memory for UnimplementedMemory {
    fn name(&self) -> &str {
        &self.backend
    }

    fn defaults(&self) -> &MemoryDefaults {
        &self.defaults
    }

    async fn store(&self, _ctx: &MemoryContext, _content: &str, _tags: &[&str]) -> Result<()> {
        self.unsupported("store")
    }

    async fn query(
        &self,
        _ctx: &MemoryContext,
        _query: &str,
        _limit: Option<usize>,
    ) -> Result<Vec<MemoryResult>> {
        self.unsupported("query")
    }

    async fn remember(
        &self,
        _ctx: &MemoryContext,
        _key: &str,
        _value: serde_json::Value,
    ) -> Result<()> {
        self.unsupported("remember")
    }

    async fn recall(&self, _ctx: &MemoryContext, _key: &str) -> Result<Option<serde_json::Value>> {
        self.unsupported("recall")
    }

    async fn add_message(&self, _ctx: &MemoryContext, _role: &str, _content: &str) -> Result<()> {
        self.unsupported("add_message")
    }

    async fn get_history(
        &self,
        _ctx: &MemoryContext,
        _limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.unsupported("get_history")
    }

    async fn ingest_document(&self, _ctx: &MemoryContext, _doc: Document) -> Result<String> {
        self.unsupported("ingest_document")
    }

    async fn ingest_documents(
        &self,
        _ctx: &MemoryContext,
        _docs: Vec<Document>,
    ) -> Result<Vec<String>> {
        self.unsupported("ingest_documents")
    }

    async fn search_knowledge(
        &self,
        _ctx: &MemoryContext,
        _query: &str,
        _options: &SearchOptions,
    ) -> Result<Vec<KnowledgeResult>> {
        self.unsupported("search_knowledge")
    }

    async fn search_all(
        &self,
        _ctx: &MemoryContext,
        _query: &str,
        _options: &SearchOptions,
    ) -> Result<HybridResult> {
        self.unsupported("search_all")
    }

    async fn build_context(
        &self,
        _ctx: &MemoryContext,
        _query: &str,
        _options: &ContextOptions,
    ) -> Result<RagContext> {
        self.unsupported("build_context")
    }

    async fn clear_session(&self, _ctx: &MemoryContext) -> Result<()> {
        self.unsupported("clear_session")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        false
    }
}
