//! In-process memory with lexical scoring.
//!
//! No embeddings and no I/O. Everything lives behind one `RwLock` and is lost
//! on drop. Scoring here is the baseline other backends are compared with.

use crate::context::MemoryContext;
use crate::error::{MemoryError, Result};
use crate::scoring::{best_lexical_score, sort_by_score_desc};
use crate::traits::Memory;
use crate::types::{
    Document, KnowledgeResult, MemoryDefaults, MemoryResult, Message, SearchOptions,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

struct PersonalEntry {
    content: String,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionState {
    memories: Vec<PersonalEntry>,
    facts: HashMap<String, serde_json::Value>,
    messages: Vec<Message>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, SessionState>,
    /// Insertion order is the tie-break for equal scores
    knowledge: Vec<Document>,
}

/// Ephemeral in-process backend.
pub struct EphemeralMemory {
    state: RwLock<State>,
    defaults: MemoryDefaults,
    closed: AtomicBool,
}

impl Default for EphemeralMemory {
    fn default() -> Self {
        Self::new(MemoryDefaults::default())
    }
}

impl EphemeralMemory {
    pub fn new(defaults: MemoryDefaults) -> Self {
        Self {
            state: RwLock::new(State::default()),
            defaults,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Memory for EphemeralMemory {
    fn name(&self) -> &str {
        "memory"
    }

    fn defaults(&self) -> &MemoryDefaults {
        &self.defaults
    }

    async fn store(&self, ctx: &MemoryContext, content: &str, tags: &[&str]) -> Result<()> {
        self.ensure_open()?;
        if content.trim().is_empty() {
            return Err(MemoryError::InvalidInput("memory content is empty".into()));
        }

        let mut state = self.state.write().await;
        state
            .sessions
            .entry(ctx.session_id().to_string())
            .or_default()
            .memories
            .push(PersonalEntry {
                content: content.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn query(
        &self,
        ctx: &MemoryContext,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryResult>> {
        self.ensure_open()?;
        let limit = limit.unwrap_or(self.defaults.max_results);
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let Some(session) = state.sessions.get(ctx.session_id()) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f32, &PersonalEntry)> = session
            .memories
            .iter()
            .map(|entry| {
                let fields = std::iter::once(entry.content.as_str())
                    .chain(entry.tags.iter().map(String::as_str));
                (best_lexical_score(query, fields), entry)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, entry)| MemoryResult {
                content: entry.content.clone(),
                score,
                tags: entry.tags.clone(),
                created_at: entry.created_at,
            })
            .collect())
    }

    async fn remember(
        &self,
        ctx: &MemoryContext,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state
            .sessions
            .entry(ctx.session_id().to_string())
            .or_default()
            .facts
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn recall(&self, ctx: &MemoryContext, key: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(ctx.session_id())
            .and_then(|s| s.facts.get(key).cloned()))
    }

    async fn add_message(&self, ctx: &MemoryContext, role: &str, content: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state
            .sessions
            .entry(ctx.session_id().to_string())
            .or_default()
            .messages
            .push(Message::new(role, content));
        Ok(())
    }

    async fn get_history(&self, ctx: &MemoryContext, limit: Option<usize>) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let state = self.state.read().await;
        let Some(session) = state.sessions.get(ctx.session_id()) else {
            return Ok(Vec::new());
        };

        let messages = &session.messages;
        let start = match limit {
            Some(n) if n < messages.len() => messages.len() - n,
            _ => 0,
        };
        Ok(messages[start..].to_vec())
    }

    async fn ingest_document(&self, _ctx: &MemoryContext, mut doc: Document) -> Result<String> {
        self.ensure_open()?;
        if doc.content.trim().is_empty() {
            return Err(MemoryError::InvalidInput(format!(
                "document {} has empty content",
                doc.id
            )));
        }
        doc.prepare_for_ingest();
        let id = doc.id.clone();

        let mut state = self.state.write().await;
        match state.knowledge.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => {
                doc.created_at = existing.created_at;
                *existing = doc;
            }
            None => state.knowledge.push(doc),
        }

        tracing::debug!(document_id = %id, "Document ingested");
        Ok(id)
    }

    async fn ingest_documents(
        &self,
        ctx: &MemoryContext,
        docs: Vec<Document>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.ingest_document(ctx, doc).await?);
        }
        Ok(ids)
    }

    async fn search_knowledge(
        &self,
        _ctx: &MemoryContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeResult>> {
        self.ensure_open()?;
        let limit = options.limit.unwrap_or(self.defaults.knowledge_max_results);
        let threshold = options
            .score_threshold
            .unwrap_or(self.defaults.knowledge_score_threshold);
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut scored: Vec<(f32, &Document)> = state
            .knowledge
            .iter()
            .filter(|doc| options.matches(doc))
            .map(|doc| {
                let score = best_lexical_score(query, [doc.content.as_str(), doc.title.as_str()]);
                (score, doc)
            })
            .filter(|(score, _)| *score > 0.0 && *score >= threshold)
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| KnowledgeResult::from_document(doc, score))
            .collect())
    }

    async fn clear_session(&self, ctx: &MemoryContext) -> Result<()> {
        self.ensure_open()?;
        self.state.write().await.sessions.remove(ctx.session_id());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.write().await;
        state.sessions.clear();
        state.knowledge.clear();
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextOptions, DocumentType};
    use serde_json::json;

    fn setup() -> (EphemeralMemory, MemoryContext) {
        (EphemeralMemory::default(), MemoryContext::for_session("s1"))
    }

    #[tokio::test]
    async fn store_then_query_ranks_by_lexical_score() {
        let (mem, ctx) = setup();
        mem.store(&ctx, "The sky is blue", &[]).await.unwrap();
        mem.store(&ctx, "Grass is green", &[]).await.unwrap();
        mem.store(&ctx, "sky", &[]).await.unwrap();

        let results = mem.query(&ctx, "sky", None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "sky");
        assert!((results[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(results[1].content, "The sky is blue");
        assert!((results[1].score - 0.8).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn tags_participate_in_scoring() {
        let (mem, ctx) = setup();
        mem.store(&ctx, "Meeting at noon", &["calendar"]).await.unwrap();

        let results = mem.query(&ctx, "calendar", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(results[0].tags, vec!["calendar".to_string()]);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let (mem, ctx) = setup();
        mem.store(&ctx, "first note about rust", &[]).await.unwrap();
        mem.store(&ctx, "second note about rust", &[]).await.unwrap();

        let results = mem.query(&ctx, "rust", None).await.unwrap();
        assert_eq!(results[0].content, "first note about rust");
        assert_eq!(results[1].content, "second note about rust");
    }

    #[tokio::test]
    async fn query_respects_limit() {
        let (mem, ctx) = setup();
        for i in 0..5 {
            mem.store(&ctx, &format!("note {i} about rust"), &[]).await.unwrap();
        }
        assert_eq!(mem.query(&ctx, "rust", Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn store_rejects_empty_content() {
        let (mem, ctx) = setup();
        let err = mem.store(&ctx, "   ", &[]).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn remember_overwrites_and_missing_is_none() {
        let (mem, ctx) = setup();
        mem.remember(&ctx, "user_name", json!("Alice")).await.unwrap();
        mem.remember(&ctx, "user_name", json!("Bob")).await.unwrap();

        assert_eq!(mem.recall(&ctx, "user_name").await.unwrap(), Some(json!("Bob")));
        assert_eq!(mem.recall(&ctx, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_limit_returns_most_recent_in_order() {
        let (mem, ctx) = setup();
        for i in 0..5 {
            mem.add_message(&ctx, "user", &format!("m{i}")).await.unwrap();
        }

        let last_two = mem.get_history(&ctx, Some(2)).await.unwrap();
        let contents: Vec<_> = last_two.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        assert_eq!(mem.get_history(&ctx, None).await.unwrap().len(), 5);
        assert_eq!(mem.get_history(&ctx, Some(50)).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn knowledge_filters_apply_before_scoring() {
        let (mem, ctx) = setup();
        mem.ingest_document(
            &ctx,
            Document::new("a", "Go performance tuning")
                .with_source("wiki")
                .with_type(DocumentType::Web),
        )
        .await
        .unwrap();
        mem.ingest_document(
            &ctx,
            Document::new("b", "Go performance guide").with_source("blog"),
        )
        .await
        .unwrap();

        let results = mem
            .search_knowledge(&ctx, "Go performance", &SearchOptions::new().source("wiki"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "a");

        let results = mem
            .search_knowledge(
                &ctx,
                "Go performance",
                &SearchOptions::new().document_type(DocumentType::Pdf),
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn title_is_scored_for_knowledge() {
        let (mem, ctx) = setup();
        mem.ingest_document(
            &ctx,
            Document::new("t", "body text unrelated").with_title("Scheduler internals"),
        )
        .await
        .unwrap();

        let results = mem
            .search_knowledge(&ctx, "scheduler internals", &SearchOptions::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn reingest_replaces_document() {
        let (mem, ctx) = setup();
        mem.ingest_document(&ctx, Document::new("doc1", "version one")).await.unwrap();
        mem.ingest_document(&ctx, Document::new("doc1", "version one")).await.unwrap();
        mem.ingest_document(&ctx, Document::new("doc1", "version two")).await.unwrap();

        let results = mem
            .search_knowledge(&ctx, "version", &SearchOptions::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "version two");
    }

    #[tokio::test]
    async fn clear_session_leaves_other_sessions_and_knowledge() {
        let mem = EphemeralMemory::default();
        let s1 = MemoryContext::for_session("s1");
        let s2 = MemoryContext::for_session("s2");

        mem.store(&s1, "alpha", &[]).await.unwrap();
        mem.store(&s2, "alpha", &[]).await.unwrap();
        mem.ingest_document(&s1, Document::new("k", "alpha knowledge")).await.unwrap();

        mem.clear_session(&s1).await.unwrap();

        assert!(mem.query(&s1, "alpha", None).await.unwrap().is_empty());
        assert_eq!(mem.query(&s2, "alpha", None).await.unwrap().len(), 1);
        assert_eq!(
            mem.search_knowledge(&s1, "alpha", &SearchOptions::new())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn build_context_uses_shared_layout() {
        let (mem, ctx) = setup();
        mem.store(&ctx, "The sky is blue", &[]).await.unwrap();
        mem.add_message(&ctx, "user", "what colour is the sky?").await.unwrap();

        let rag = mem
            .build_context(&ctx, "sky", &ContextOptions::new())
            .await
            .unwrap();
        assert!(rag.context_text.starts_with("Query: sky\n\n"));
        assert!(rag.context_text.contains("Personal Memory:\n1. The sky is blue\n"));
        assert!(rag.context_text.contains("Recent Conversation:\nuser: what colour is the sky?\n"));
    }

    #[tokio::test]
    async fn calls_after_close_fail() {
        let (mem, ctx) = setup();
        mem.close().await.unwrap();
        assert!(!mem.health_check().await);
        assert!(mem.store(&ctx, "x", &[]).await.unwrap_err().is_closed());
        assert!(mem.recall(&ctx, "k").await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn name_returns_memory() {
        let (mem, _) = setup();
        assert_eq!(mem.name(), "memory");
    }
}
