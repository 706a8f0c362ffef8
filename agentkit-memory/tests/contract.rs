//! Behaviour every in-process backend must share.
//!
//! Each test runs against the ephemeral and the embedded backend. The
//! embedded backend gets a bag-of-words hashing embedder so that texts sharing
//! words are similar.

use agentkit_memory::{
    ContextOptions, Document, EmbeddedMemory, EmbeddingProvider, EphemeralMemory, Memory,
    MemoryContext, MemoryError, SearchOptions,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const DIMENSIONS: usize = 64;

struct HashingEmbedding;

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; DIMENSIONS];
                for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
                    if word.is_empty() {
                        continue;
                    }
                    let bucket = word
                        .bytes()
                        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)));
                    v[(bucket % DIMENSIONS as u64) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

async fn backends() -> Vec<Arc<dyn Memory>> {
    let embedded = EmbeddedMemory::in_memory(Some(Arc::new(HashingEmbedding)))
        .await
        .unwrap();
    vec![Arc::new(EphemeralMemory::default()), Arc::new(embedded)]
}

#[tokio::test]
async fn sky_memory_ranks_first() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        mem.store(&ctx, "Grass is green", &[]).await.unwrap();
        mem.store(&ctx, "The sky is blue", &[]).await.unwrap();

        let results = mem.query(&ctx, "sky", None).await.unwrap();
        assert!(!results.is_empty(), "{}", mem.name());
        assert_eq!(results[0].content, "The sky is blue", "{}", mem.name());
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score, "{}", mem.name());
        }
    }
}

#[tokio::test]
async fn remembered_name_is_recalled() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        mem.remember(&ctx, "user_name", json!("Alice")).await.unwrap();

        assert_eq!(
            mem.recall(&ctx, "user_name").await.unwrap(),
            Some(json!("Alice")),
            "{}",
            mem.name()
        );
        assert_eq!(mem.recall(&ctx, "user_age").await.unwrap(), None);
    }
}

#[tokio::test]
async fn source_filter_keeps_wiki_results() {
    for mem in backends().await {
        let ctx = MemoryContext::new();
        mem.ingest_documents(
            &ctx,
            vec![
                Document::new("wiki-go", "Go performance tips").with_source("wiki"),
                Document::new("blog-go", "Go performance tuning").with_source("blog"),
                Document::new("wiki-rust", "Rust ownership guide").with_source("wiki"),
            ],
        )
        .await
        .unwrap();

        let opts = SearchOptions::new().source("wiki").score_threshold(0.0);
        let results = mem
            .search_knowledge(&ctx, "Go performance", &opts)
            .await
            .unwrap();

        assert!(!results.is_empty(), "{}", mem.name());
        assert_eq!(results[0].document_id, "wiki-go", "{}", mem.name());
        assert!(results.iter().all(|r| r.source == "wiki"), "{}", mem.name());
    }
}

#[tokio::test]
async fn sessions_are_isolated() {
    for mem in backends().await {
        let s1 = MemoryContext::for_session("s1");
        let s2 = s1.with_session("s2");

        mem.store(&s1, "The sky is blue", &[]).await.unwrap();
        mem.remember(&s1, "user_name", json!("Alice")).await.unwrap();
        mem.add_message(&s1, "user", "hello").await.unwrap();

        assert!(mem.query(&s2, "sky", None).await.unwrap().is_empty(), "{}", mem.name());
        assert_eq!(mem.recall(&s2, "user_name").await.unwrap(), None);
        assert!(mem.get_history(&s2, None).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn knowledge_is_shared_across_sessions() {
    for mem in backends().await {
        let s1 = MemoryContext::for_session("s1");
        let s2 = MemoryContext::for_session("s2");
        mem.ingest_document(&s1, Document::new("doc", "Rust ownership guide"))
            .await
            .unwrap();

        let opts = SearchOptions::new().score_threshold(0.0);
        let results = mem.search_knowledge(&s2, "ownership", &opts).await.unwrap();
        assert_eq!(results.len(), 1, "{}", mem.name());
        assert_eq!(results[0].document_id, "doc");
    }
}

#[tokio::test]
async fn reingesting_a_document_keeps_one_entry() {
    for mem in backends().await {
        let ctx = MemoryContext::new();
        for content in ["version one", "version one", "version two"] {
            let id = mem
                .ingest_document(&ctx, Document::new("doc1", content))
                .await
                .unwrap();
            assert_eq!(id, "doc1");
        }

        let opts = SearchOptions::new().score_threshold(0.0);
        let results = mem.search_knowledge(&ctx, "version", &opts).await.unwrap();
        assert_eq!(results.len(), 1, "{}", mem.name());
        assert_eq!(results[0].content, "version two", "{}", mem.name());
    }
}

#[tokio::test]
async fn clear_session_is_scoped() {
    for mem in backends().await {
        let s1 = MemoryContext::for_session("s1");
        let s2 = MemoryContext::for_session("s2");
        for ctx in [&s1, &s2] {
            mem.store(ctx, "The sky is blue", &[]).await.unwrap();
            mem.remember(ctx, "user_name", json!("Alice")).await.unwrap();
            mem.add_message(ctx, "user", "hello").await.unwrap();
        }
        mem.ingest_document(&s1, Document::new("doc", "The sky is blue"))
            .await
            .unwrap();

        mem.clear_session(&s1).await.unwrap();

        assert!(mem.query(&s1, "sky", None).await.unwrap().is_empty(), "{}", mem.name());
        assert_eq!(mem.recall(&s1, "user_name").await.unwrap(), None);
        assert!(mem.get_history(&s1, None).await.unwrap().is_empty());

        assert_eq!(mem.query(&s2, "sky", None).await.unwrap().len(), 1);
        assert_eq!(mem.recall(&s2, "user_name").await.unwrap(), Some(json!("Alice")));
        assert_eq!(mem.get_history(&s2, None).await.unwrap().len(), 1);

        let opts = SearchOptions::new().score_threshold(0.0);
        assert_eq!(mem.search_knowledge(&s1, "sky", &opts).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn history_limit_returns_latest_in_order() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        for (role, content) in [("user", "a"), ("assistant", "b"), ("user", "c")] {
            mem.add_message(&ctx, role, content).await.unwrap();
        }

        let history = mem.get_history(&ctx, Some(2)).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"], "{}", mem.name());
    }
}

#[tokio::test]
async fn search_all_combines_both_branches() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        mem.store(&ctx, "The sky is blue", &[]).await.unwrap();
        mem.ingest_document(&ctx, Document::new("doc", "sky facts").with_source("wiki"))
            .await
            .unwrap();

        let opts = SearchOptions::new().score_threshold(0.0);
        let hybrid = mem.search_all(&ctx, "sky", &opts).await.unwrap();
        assert_eq!(hybrid.query, "sky");
        assert_eq!(hybrid.personal_memory.len(), 1, "{}", mem.name());
        assert_eq!(hybrid.knowledge.len(), 1, "{}", mem.name());
        assert_eq!(hybrid.total_results, 2);

        let personal_only = mem
            .search_all(&ctx, "sky", &opts.clone().include_knowledge(false))
            .await
            .unwrap();
        assert!(personal_only.knowledge.is_empty());
        assert_eq!(personal_only.total_results, 1);
    }
}

#[tokio::test]
async fn context_stays_within_token_budget() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        for i in 0..20 {
            mem.store(&ctx, &format!("The sky is blue on day {i}"), &[])
                .await
                .unwrap();
            mem.add_message(&ctx, "user", &format!("message number {i} about the sky"))
                .await
                .unwrap();
        }
        mem.ingest_document(&ctx, Document::new("doc", "sky facts").with_source("wiki"))
            .await
            .unwrap();

        let rag = mem
            .build_context(&ctx, "sky", &ContextOptions::new().max_tokens(60))
            .await
            .unwrap();
        assert!(rag.token_count <= 60, "{}: {}", mem.name(), rag.token_count);
        assert_eq!(rag.token_count, rag.context_text.len() / 4);
        assert!(rag.context_text.starts_with("Query: sky"));
    }
}

#[tokio::test]
async fn context_lists_sources_once() {
    for mem in backends().await {
        let ctx = MemoryContext::for_session("s1");
        mem.ingest_documents(
            &ctx,
            vec![
                Document::new("a", "sky facts").with_source("wiki"),
                Document::new("b", "more sky facts").with_source("wiki"),
            ],
        )
        .await
        .unwrap();

        let rag = mem
            .build_context(&ctx, "sky", &ContextOptions::new())
            .await
            .unwrap();
        assert_eq!(rag.sources, vec!["wiki".to_string()], "{}", mem.name());
        assert!(rag.context_text.contains("(Source: wiki)"));
    }
}

#[tokio::test]
async fn empty_content_is_rejected() {
    for mem in backends().await {
        let ctx = MemoryContext::new();
        let err = mem.store(&ctx, "", &[]).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)), "{}", mem.name());

        let err = mem
            .ingest_document(&ctx, Document::new("doc", "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)), "{}", mem.name());
    }
}

#[tokio::test]
async fn set_session_rebinds_context() {
    for mem in backends().await {
        let base = MemoryContext::new();
        let session = mem.new_session();
        assert_eq!(session.len(), 16);

        let ctx = mem.set_session(&base, &session);
        assert_eq!(ctx.session_id(), session);
        mem.remember(&ctx, "k", json!(true)).await.unwrap();
        assert_eq!(mem.recall(&base, "k").await.unwrap(), None, "{}", mem.name());
        assert_eq!(mem.recall(&ctx, "k").await.unwrap(), Some(json!(true)));
    }
}

#[tokio::test]
async fn closed_backends_fail_cleanly() {
    for mem in backends().await {
        let ctx = MemoryContext::new();
        assert!(mem.health_check().await);
        mem.close().await.unwrap();

        assert!(!mem.health_check().await, "{}", mem.name());
        assert!(mem.store(&ctx, "x", &[]).await.unwrap_err().is_closed());
        assert!(mem
            .search_knowledge(&ctx, "x", &SearchOptions::new())
            .await
            .unwrap_err()
            .is_closed());
    }
}
