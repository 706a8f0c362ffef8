//! PostgreSQL + pgvector memory.
//!
//! Personal memories, facts and chat history are rows keyed by session;
//! documents and their knowledge rows are global. Similarity is
//! `1 - cosine_distance` computed by pgvector. Every statement runs under the
//! retry policy, so each retried unit is either a single idempotent statement
//! or a whole transaction.
//!
//! Vectors are bound as text literals (`'[0.1,0.2]'`) and cast with
//! `::vector` in SQL.

use crate::context::MemoryContext;
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::traits::Memory;
use crate::types::{
    Document, DocumentType, KnowledgeResult, MemoryDefaults, MemoryResult, Message,
    SearchOptions,
};
use agentkit_common::MemoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A personal memory for [`PgVectorMemory::batch_store`].
#[derive(Debug, Clone)]
pub struct PersonalMemory {
    pub content: String,
    pub tags: Vec<String>,
}

impl PersonalMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Strictly increasing microsecond timestamps for chat rows.
///
/// `TIMESTAMPTZ` keeps microseconds, so two messages added within the same
/// microsecond would otherwise tie in `ORDER BY created_at`.
#[derive(Debug, Default)]
struct MessageClock {
    last_micros: AtomicI64,
}

impl MessageClock {
    fn next(&self) -> DateTime<Utc> {
        self.next_after(Utc::now().timestamp_micros())
    }

    fn next_after(&self, now_micros: i64) -> DateTime<Utc> {
        let prev = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now_micros.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        DateTime::from_timestamp_micros(now_micros.max(prev + 1)).unwrap_or_else(Utc::now)
    }
}

/// PostgreSQL backend with pgvector similarity search.
pub struct PgVectorMemory {
    pool: PgPool,
    embedder: Arc<dyn EmbeddingProvider>,
    dimensions: usize,
    retry: RetryPolicy,
    batch_size: usize,
    defaults: MemoryDefaults,
    message_clock: MessageClock,
    closed: AtomicBool,
}

impl PgVectorMemory {
    /// Connect, verify the server answers, and create the schema.
    ///
    /// Missing embedder, zero or mismatched dimensions and a missing
    /// connection string are configuration errors raised before any I/O.
    pub async fn connect(
        config: &MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let embedder = embedder.ok_or_else(|| {
            MemoryError::Config("pgvector backend requires an embedding provider".into())
        })?;
        if config.dimensions == 0 {
            return Err(MemoryError::Config("dimensions must be greater than zero".into()));
        }
        if embedder.dimensions() != config.dimensions {
            return Err(MemoryError::Config(format!(
                "embedding provider {} produces {} dimensions, pgvector expects {}",
                embedder.name(),
                embedder.dimensions(),
                config.dimensions
            )));
        }

        let url = config.expanded_connection();
        let trimmed = url.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("memory") {
            return Err(MemoryError::Config(
                "pgvector backend requires a PostgreSQL connection string".into(),
            ));
        }

        let pool_config = &config.pool;
        let pool = PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .max_lifetime(Duration::from_secs(pool_config.max_lifetime_secs))
            .idle_timeout(Duration::from_secs(pool_config.idle_timeout_secs))
            .acquire_timeout(Duration::from_secs(pool_config.acquire_timeout_secs))
            .test_before_acquire(pool_config.test_before_acquire)
            .connect_lazy(trimmed)
            .map_err(|e| MemoryError::Config(format!("invalid PostgreSQL connection string: {e}")))?;

        let memory = Self {
            pool,
            embedder,
            dimensions: config.dimensions,
            retry: RetryPolicy::from(&config.retry),
            batch_size: config.ingest_batch_size.max(1),
            defaults: MemoryDefaults::from_config(config),
            message_clock: MessageClock::default(),
            closed: AtomicBool::new(false),
        };

        let ctx = MemoryContext::new();
        memory.ping(&ctx).await?;
        memory.create_tables(&ctx).await?;

        tracing::info!(
            dimensions = memory.dimensions,
            max_connections = pool_config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(memory)
    }

    async fn ping(&self, ctx: &MemoryContext) -> Result<()> {
        let pool = &self.pool;
        with_retry(ctx, "ping database", &self.retry, || async move {
            sqlx::query("SELECT 1")
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(|e| MemoryError::backend("ping database", e))
        })
        .await
    }

    async fn create_tables(&self, ctx: &MemoryContext) -> Result<()> {
        let statements = schema_statements(self.dimensions);
        let pool = &self.pool;
        let statements = statements.as_slice();

        with_retry(ctx, "create tables", &self.retry, || async move {
            for statement in statements {
                sqlx::query(statement)
                    .execute(pool)
                    .await
                    .map_err(|e| MemoryError::backend("create tables", e))?;
            }
            Ok(())
        })
        .await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let vectors = self
            .embedder
            .embed(texts)
            .await
            .map_err(|e| MemoryError::embedding(&e))?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(MemoryError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                bad.len()
            )));
        }
        Ok(vectors)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::Embedding("no embedding returned".into()))
    }

    /// Store many personal memories with one embedding call.
    ///
    /// Rows are written in sub-batches of `ingest_batch_size`, each in its
    /// own transaction. A failing sub-batch leaves earlier ones committed and
    /// is reported as [`MemoryError::PartialBatch`].
    pub async fn batch_store(&self, ctx: &MemoryContext, items: &[PersonalMemory]) -> Result<()> {
        const OPERATION: &str = "batch store";
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(());
        }
        if let Some(pos) = items.iter().position(|m| m.content.trim().is_empty()) {
            return Err(MemoryError::InvalidInput(format!(
                "memory {pos} in batch has empty content"
            )));
        }

        let texts: Vec<&str> = items.iter().map(|m| m.content.as_str()).collect();
        let embeddings = self.embed(&texts).await?;
        let rows: Vec<PersonalRow<'_>> = items
            .iter()
            .zip(&embeddings)
            .map(|(item, embedding)| PersonalRow {
                id: Uuid::new_v4(),
                content: &item.content,
                tags: &item.tags,
                embedding: vector_literal(embedding),
            })
            .collect();

        let pool = &self.pool;
        let session_id = ctx.session_id();
        let mut committed = 0;

        for (chunk_index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let start = chunk_index * self.batch_size;
            let end = start + chunk.len();

            let result = with_retry(ctx, OPERATION, &self.retry, || async move {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| MemoryError::backend(OPERATION, e))?;
                for row in chunk {
                    insert_personal(&mut tx, session_id, row)
                        .await
                        .map_err(|e| MemoryError::backend(OPERATION, e))?;
                }
                tx.commit()
                    .await
                    .map_err(|e| MemoryError::backend(OPERATION, e))
            })
            .await;

            if let Err(err) = result {
                return Err(partial_batch(OPERATION, start, end, committed, err));
            }
            committed = end;
        }

        tracing::info!(count = committed, "Personal memories stored");
        Ok(())
    }

    /// Ingest many documents with one embedding call.
    ///
    /// Each sub-batch of `ingest_batch_size` documents is one transaction that
    /// upserts the document rows and replaces their knowledge rows.
    pub async fn batch_ingest_documents(
        &self,
        ctx: &MemoryContext,
        mut docs: Vec<Document>,
    ) -> Result<Vec<String>> {
        const OPERATION: &str = "batch ingest documents";
        self.ensure_open()?;
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        for doc in docs.iter_mut() {
            validate_document(doc)?;
            doc.prepare_for_ingest();
        }

        let texts: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        let embeddings = self.embed(&texts).await?;
        let rows = docs
            .iter()
            .zip(&embeddings)
            .map(|(doc, embedding)| DocumentRow::new(doc, embedding))
            .collect::<Result<Vec<_>>>()?;

        let pool = &self.pool;
        let mut committed = 0;

        for (chunk_index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let start = chunk_index * self.batch_size;
            let end = start + chunk.len();

            let result = with_retry(ctx, OPERATION, &self.retry, || async move {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| MemoryError::backend(OPERATION, e))?;
                for row in chunk {
                    write_document(&mut tx, row)
                        .await
                        .map_err(|e| MemoryError::backend(OPERATION, e))?;
                }
                tx.commit()
                    .await
                    .map_err(|e| MemoryError::backend(OPERATION, e))
            })
            .await;

            if let Err(err) = result {
                return Err(partial_batch(OPERATION, start, end, committed, err));
            }
            committed = end;
            tracing::debug!(start, end, "Document sub-batch committed");
        }

        tracing::info!(count = committed, "Documents ingested");
        Ok(docs.into_iter().map(|d| d.id).collect())
    }
}

fn partial_batch(
    operation: &str,
    start: usize,
    end: usize,
    committed: usize,
    err: MemoryError,
) -> MemoryError {
    if err.is_cancelled() {
        return err;
    }
    tracing::error!(operation, start, end, committed, error = %err, "Sub-batch failed");
    MemoryError::PartialBatch {
        operation: operation.to_string(),
        start,
        end,
        committed,
        message: err.to_string(),
    }
}

fn validate_document(doc: &Document) -> Result<()> {
    if doc.content.trim().is_empty() {
        return Err(MemoryError::InvalidInput(format!(
            "document {} has empty content",
            doc.id
        )));
    }
    Ok(())
}

/// pgvector text form of `v`.
pub(crate) fn vector_literal(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// DDL for the five tables and their indexes.
pub(crate) fn schema_statements(dimensions: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS personal_memory (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                session_id VARCHAR(255) NOT NULL,
                content TEXT NOT NULL,
                embedding vector({dimensions}),
                tags TEXT[],
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )"#
        ),
        r#"CREATE TABLE IF NOT EXISTS key_value_store (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                session_id VARCHAR(255) NOT NULL,
                key VARCHAR(255) NOT NULL,
                value JSONB NOT NULL,
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE(session_id, key)
            )"#
        .to_string(),
        r#"CREATE TABLE IF NOT EXISTS chat_history (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                session_id VARCHAR(255) NOT NULL,
                role VARCHAR(50) NOT NULL,
                content TEXT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT NOW()
            )"#
        .to_string(),
        r#"CREATE TABLE IF NOT EXISTS documents (
                id VARCHAR(255) PRIMARY KEY,
                title TEXT,
                content TEXT NOT NULL,
                source TEXT,
                doc_type VARCHAR(50),
                metadata JSONB,
                tags TEXT[],
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW(),
                chunk_index INTEGER DEFAULT 0,
                chunk_total INTEGER DEFAULT 1
            )"#
        .to_string(),
        format!(
            r#"CREATE TABLE IF NOT EXISTS knowledge_base (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                document_id VARCHAR(255) NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                embedding vector({dimensions}),
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )"#
        ),
        "CREATE INDEX IF NOT EXISTS idx_personal_memory_session ON personal_memory(session_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_personal_memory_embedding ON personal_memory \
         USING ivfflat (embedding vector_cosine_ops)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_personal_memory_tags ON personal_memory USING gin(tags)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_kv_session_key ON key_value_store(session_id, key)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_chat_history_session ON chat_history(session_id, created_at)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_documents_type ON documents(doc_type)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_documents_tags ON documents USING gin(tags)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_knowledge_document ON knowledge_base(document_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_knowledge_embedding ON knowledge_base \
         USING ivfflat (embedding vector_cosine_ops)"
            .to_string(),
    ]
}

/// A bound parameter of a knowledge query, after the query vector (`$1`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KnowledgeParam {
    Texts(Vec<String>),
    Timestamp(DateTime<Utc>),
    Score(f64),
    Limit(i64),
}

#[derive(Debug, Clone)]
pub(crate) struct KnowledgeQuery {
    pub sql: String,
    pub params: Vec<KnowledgeParam>,
}

/// Knowledge search SQL with filters in the order source, type, tags, date
/// range, score threshold. The threshold clause is emitted only when it is
/// positive.
pub(crate) fn build_knowledge_query(
    options: &SearchOptions,
    threshold: f32,
    limit: usize,
) -> KnowledgeQuery {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    let next = |params: &mut Vec<KnowledgeParam>, param: KnowledgeParam| {
        params.push(param);
        params.len() + 1
    };

    if !options.sources.is_empty() {
        let n = next(&mut params, KnowledgeParam::Texts(options.sources.clone()));
        conditions.push(format!("d.source = ANY(${n})"));
    }
    if !options.document_types.is_empty() {
        let types = options.document_types.iter().map(|t| t.to_string()).collect();
        let n = next(&mut params, KnowledgeParam::Texts(types));
        conditions.push(format!("d.doc_type = ANY(${n})"));
    }
    if !options.tags.is_empty() {
        let n = next(&mut params, KnowledgeParam::Texts(options.tags.clone()));
        conditions.push(format!("d.tags && ${n}"));
    }
    if let Some(range) = &options.date_range {
        let start = next(&mut params, KnowledgeParam::Timestamp(range.start));
        let end = next(&mut params, KnowledgeParam::Timestamp(range.end));
        conditions.push(format!("d.created_at BETWEEN ${start} AND ${end}"));
    }
    if threshold > 0.0 {
        let n = next(&mut params, KnowledgeParam::Score(f64::from(threshold)));
        conditions.push(format!("(1 - (kb.embedding <=> $1::vector)) >= ${n}"));
    }
    let limit_n = next(&mut params, KnowledgeParam::Limit(limit as i64));

    let mut sql = String::from(
        "SELECT kb.content, 1 - (kb.embedding <=> $1::vector) AS similarity, \
         d.source, d.title, d.id AS document_id, d.doc_type, d.metadata, d.tags, \
         kb.created_at, d.chunk_index \
         FROM knowledge_base kb JOIN documents d ON kb.document_id = d.id",
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY kb.embedding <=> $1::vector LIMIT ${limit_n}"));

    KnowledgeQuery { sql, params }
}

struct PersonalRow<'a> {
    id: Uuid,
    content: &'a str,
    tags: &'a [String],
    embedding: String,
}

struct DocumentRow<'a> {
    doc: &'a Document,
    metadata: serde_json::Value,
    embedding: String,
}

impl<'a> DocumentRow<'a> {
    fn new(doc: &'a Document, embedding: &[f32]) -> Result<Self> {
        Ok(Self {
            doc,
            metadata: serde_json::to_value(&doc.metadata)?,
            embedding: vector_literal(embedding),
        })
    }
}

async fn insert_personal(
    conn: &mut PgConnection,
    session_id: &str,
    row: &PersonalRow<'_>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO personal_memory (id, session_id, content, embedding, tags) \
         VALUES ($1, $2, $3, $4::vector, $5) ON CONFLICT (id) DO NOTHING",
    )
    .bind(row.id)
    .bind(session_id)
    .bind(row.content)
    .bind(&row.embedding)
    .bind(row.tags)
    .execute(conn)
    .await?;
    Ok(())
}

/// Upsert the document row, then replace its knowledge rows.
async fn write_document(
    conn: &mut PgConnection,
    row: &DocumentRow<'_>,
) -> std::result::Result<(), sqlx::Error> {
    let doc = row.doc;
    sqlx::query(
        r#"
        INSERT INTO documents (id, title, content, source, doc_type, metadata, tags,
                               chunk_index, chunk_total, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            content = EXCLUDED.content,
            source = EXCLUDED.source,
            doc_type = EXCLUDED.doc_type,
            metadata = EXCLUDED.metadata,
            tags = EXCLUDED.tags,
            chunk_index = EXCLUDED.chunk_index,
            chunk_total = EXCLUDED.chunk_total,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.title)
    .bind(&doc.content)
    .bind(&doc.source)
    .bind(doc.doc_type.to_string())
    .bind(&row.metadata)
    .bind(&doc.tags)
    .bind(doc.chunk_index)
    .bind(doc.chunk_total)
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM knowledge_base WHERE document_id = $1")
        .bind(&doc.id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO knowledge_base (document_id, content, embedding) VALUES ($1, $2, $3::vector)",
    )
    .bind(&doc.id)
    .bind(&doc.content)
    .bind(&row.embedding)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn row_to_memory(row: &PgRow) -> std::result::Result<MemoryResult, sqlx::Error> {
    let score: f64 = row.try_get("similarity_score")?;
    Ok(MemoryResult {
        content: row.try_get("content")?,
        score: score as f32,
        tags: row.try_get::<Option<Vec<String>>, _>("tags")?.unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_knowledge(row: &PgRow) -> std::result::Result<KnowledgeResult, sqlx::Error> {
    let score: f64 = row.try_get("similarity")?;
    let doc_type: Option<String> = row.try_get("doc_type")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let metadata = match metadata {
        Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    };

    Ok(KnowledgeResult {
        document_id: row.try_get("document_id")?,
        content: row.try_get("content")?,
        score: score as f32,
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        source: row.try_get::<Option<String>, _>("source")?.unwrap_or_default(),
        doc_type: doc_type.map(DocumentType::from).unwrap_or_default(),
        tags: row.try_get::<Option<Vec<String>>, _>("tags")?.unwrap_or_default(),
        metadata,
        chunk_index: row.try_get::<Option<i32>, _>("chunk_index")?.unwrap_or(0),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_message(row: &PgRow) -> std::result::Result<Message, sqlx::Error> {
    Ok(Message {
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Memory for PgVectorMemory {
    fn name(&self) -> &str {
        "pgvector"
    }

    fn defaults(&self) -> &MemoryDefaults {
        &self.defaults
    }

    async fn store(&self, ctx: &MemoryContext, content: &str, tags: &[&str]) -> Result<()> {
        const OPERATION: &str = "store memory";
        self.ensure_open()?;
        if content.trim().is_empty() {
            return Err(MemoryError::InvalidInput("memory content is empty".into()));
        }

        let embedding = self.embed_one(content).await?;
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let row = PersonalRow {
            id: Uuid::new_v4(),
            content,
            tags: &tags,
            embedding: vector_literal(&embedding),
        };
        let row = &row;
        let pool = &self.pool;
        let session_id = ctx.session_id();

        with_retry(ctx, OPERATION, &self.retry, || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))?;
            insert_personal(&mut conn, session_id, row)
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await
    }

    async fn query(
        &self,
        ctx: &MemoryContext,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryResult>> {
        const OPERATION: &str = "query memories";
        self.ensure_open()?;
        let limit = limit.unwrap_or(self.defaults.max_results);
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = vector_literal(&self.embed_one(query).await?);
        let embedding = embedding.as_str();
        let pool = &self.pool;
        let session_id = ctx.session_id();

        let rows = with_retry(ctx, OPERATION, &self.retry, || async move {
            sqlx::query(
                "SELECT content, tags, created_at, 1 - (embedding <=> $1::vector) AS similarity_score \
                 FROM personal_memory WHERE session_id = $2 \
                 ORDER BY embedding <=> $1::vector LIMIT $3",
            )
            .bind(embedding)
            .bind(session_id)
            .bind(limit as i64)
            .fetch_all(pool)
            .await
            .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await?;

        rows.iter()
            .map(row_to_memory)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::backend(OPERATION, e))
    }

    async fn remember(
        &self,
        ctx: &MemoryContext,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        const OPERATION: &str = "remember";
        self.ensure_open()?;
        let value = &value;
        let pool = &self.pool;
        let session_id = ctx.session_id();

        with_retry(ctx, OPERATION, &self.retry, || async move {
            sqlx::query(
                "INSERT INTO key_value_store (session_id, key, value) VALUES ($1, $2, $3) \
                 ON CONFLICT (session_id, key) DO UPDATE SET value = $3, updated_at = NOW()",
            )
            .bind(session_id)
            .bind(key)
            .bind(value)
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await
    }

    async fn recall(&self, ctx: &MemoryContext, key: &str) -> Result<Option<serde_json::Value>> {
        const OPERATION: &str = "recall";
        self.ensure_open()?;
        let pool = &self.pool;
        let session_id = ctx.session_id();

        let row = with_retry(ctx, OPERATION, &self.retry, || async move {
            sqlx::query("SELECT value FROM key_value_store WHERE session_id = $1 AND key = $2")
                .bind(session_id)
                .bind(key)
                .fetch_optional(pool)
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await?;

        row.map(|r| r.try_get::<serde_json::Value, _>("value"))
            .transpose()
            .map_err(|e| MemoryError::backend(OPERATION, e))
    }

    async fn add_message(&self, ctx: &MemoryContext, role: &str, content: &str) -> Result<()> {
        const OPERATION: &str = "add message";
        self.ensure_open()?;
        let id = Uuid::new_v4();
        let created_at = self.message_clock.next();
        let pool = &self.pool;
        let session_id = ctx.session_id();

        with_retry(ctx, OPERATION, &self.retry, || async move {
            sqlx::query(
                "INSERT INTO chat_history (id, session_id, role, content, created_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
            )
            .bind(id)
            .bind(session_id)
            .bind(role)
            .bind(content)
            .bind(created_at)
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await
    }

    async fn get_history(&self, ctx: &MemoryContext, limit: Option<usize>) -> Result<Vec<Message>> {
        const OPERATION: &str = "get history";
        self.ensure_open()?;
        let pool = &self.pool;
        let session_id = ctx.session_id();

        // `created_at` is unique per instance (MessageClock); rows written by
        // different instances in the same microsecond have no defined order.
        let rows = with_retry(ctx, OPERATION, &self.retry, || async move {
            let result = match limit {
                Some(n) => {
                    sqlx::query(
                        "SELECT role, content, created_at FROM chat_history \
                         WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2",
                    )
                    .bind(session_id)
                    .bind(n as i64)
                    .fetch_all(pool)
                    .await
                }
                None => {
                    sqlx::query(
                        "SELECT role, content, created_at FROM chat_history \
                         WHERE session_id = $1 ORDER BY created_at ASC",
                    )
                    .bind(session_id)
                    .fetch_all(pool)
                    .await
                }
            };
            result.map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await?;

        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::backend(OPERATION, e))?;
        if limit.is_some() {
            messages.reverse();
        }
        Ok(messages)
    }

    async fn ingest_document(&self, ctx: &MemoryContext, mut doc: Document) -> Result<String> {
        const OPERATION: &str = "ingest document";
        self.ensure_open()?;
        validate_document(&doc)?;
        doc.prepare_for_ingest();

        let embedding = self.embed_one(&doc.content).await?;
        let row = DocumentRow::new(&doc, &embedding)?;
        let row = &row;
        let pool = &self.pool;

        with_retry(ctx, OPERATION, &self.retry, || async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))?;
            write_document(&mut tx, row)
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))?;
            tx.commit()
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await
        .map_err(|e| e.with_context(format!("document {}", doc.id)))?;

        tracing::debug!(document_id = %doc.id, "Document ingested");
        Ok(doc.id)
    }

    async fn ingest_documents(
        &self,
        ctx: &MemoryContext,
        docs: Vec<Document>,
    ) -> Result<Vec<String>> {
        self.batch_ingest_documents(ctx, docs).await
    }

    async fn search_knowledge(
        &self,
        ctx: &MemoryContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeResult>> {
        const OPERATION: &str = "search knowledge";
        self.ensure_open()?;
        let limit = options.limit.unwrap_or(self.defaults.knowledge_max_results);
        let threshold = options
            .score_threshold
            .unwrap_or(self.defaults.knowledge_score_threshold);
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = vector_literal(&self.embed_one(query).await?);
        let embedding = embedding.as_str();
        let knowledge_query = build_knowledge_query(options, threshold, limit);
        let knowledge_query = &knowledge_query;
        let pool = &self.pool;

        let rows = with_retry(ctx, OPERATION, &self.retry, || async move {
            let mut q = sqlx::query(&knowledge_query.sql).bind(embedding);
            for param in &knowledge_query.params {
                q = match param {
                    KnowledgeParam::Texts(values) => q.bind(values.clone()),
                    KnowledgeParam::Timestamp(at) => q.bind(*at),
                    KnowledgeParam::Score(score) => q.bind(*score),
                    KnowledgeParam::Limit(limit) => q.bind(*limit),
                };
            }
            q.fetch_all(pool)
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await?;

        rows.iter()
            .map(row_to_knowledge)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::backend(OPERATION, e))
    }

    async fn clear_session(&self, ctx: &MemoryContext) -> Result<()> {
        const OPERATION: &str = "clear session";
        self.ensure_open()?;
        let pool = &self.pool;
        let session_id = ctx.session_id();

        with_retry(ctx, OPERATION, &self.retry, || async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))?;
            for table in ["personal_memory", "key_value_store", "chat_history"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE session_id = $1"))
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MemoryError::backend(OPERATION, e))?;
            }
            tx.commit()
                .await
                .map_err(|e| MemoryError::backend(OPERATION, e))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close().await;
            tracing::info!("PostgreSQL pool closed");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
