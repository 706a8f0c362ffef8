//! Embedded vector-index memory.
//!
//! One collection per instance holding personal and knowledge records, each
//! tagged with its kind and (for personal records) the owning session.
//! Similarity is cosine over injected embeddings. Facts and chat history are
//! plain maps beside the collection.
//!
//! When the connection is a path rather than `"memory"`, every write goes
//! through to a SQLite file which is reloaded on open.

use crate::context::MemoryContext;
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::scoring::{cosine_similarity, sort_by_score_desc};
use crate::traits::Memory;
use crate::types::{
    Document, KnowledgeResult, MemoryDefaults, MemoryResult, Message, SearchOptions,
};
use agentkit_common::MemoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const KIND_PERSONAL: &str = "personal";
const KIND_KNOWLEDGE: &str = "knowledge";

#[derive(Debug, Clone)]
enum Payload {
    Personal { session_id: String, tags: Vec<String> },
    Knowledge(Document),
}

#[derive(Debug, Clone)]
struct VectorRecord {
    id: String,
    content: String,
    embedding: Vec<f32>,
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl VectorRecord {
    fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Personal { .. } => KIND_PERSONAL,
            Payload::Knowledge(_) => KIND_KNOWLEDGE,
        }
    }

    fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.created_at = created_at;
        if let Payload::Knowledge(doc) = &mut self.payload {
            doc.created_at = created_at;
        }
    }

    fn session_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::Personal { session_id, .. } => Some(session_id.as_str()),
            Payload::Knowledge(_) => None,
        }
    }
}

#[derive(Default)]
struct Collection {
    records: Vec<VectorRecord>,
    facts: HashMap<String, HashMap<String, serde_json::Value>>,
    messages: HashMap<String, Vec<Message>>,
}

impl Collection {
    /// Carry the first ingest time of an already stored document over to
    /// `record`, so memory and disk agree on `created_at`.
    fn keep_created_at(&self, record: &mut VectorRecord) {
        let existing = self
            .records
            .iter()
            .find(|r| r.kind() == KIND_KNOWLEDGE && r.id == record.id);
        if let Some(existing) = existing {
            record.set_created_at(existing.created_at);
        }
    }

    fn upsert_knowledge(&mut self, record: VectorRecord) {
        let existing = self
            .records
            .iter_mut()
            .find(|r| r.kind() == KIND_KNOWLEDGE && r.id == record.id);
        match existing {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }
}

/// Embedded vector-index backend.
pub struct EmbeddedMemory {
    collection: RwLock<Collection>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    dimensions: usize,
    store: Option<SqliteStore>,
    defaults: MemoryDefaults,
    closed: AtomicBool,
}

impl EmbeddedMemory {
    /// Open the backend described by `config`.
    ///
    /// Without an embedder every record gets a zero vector: the contract holds
    /// but similarity carries no signal.
    pub async fn open(
        config: &MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        if config.dimensions == 0 {
            return Err(MemoryError::Config("dimensions must be greater than zero".into()));
        }
        if let Some(embedder) = &embedder {
            if embedder.dimensions() != config.dimensions {
                return Err(MemoryError::Config(format!(
                    "embedding provider {} produces {} dimensions, collection expects {}",
                    embedder.name(),
                    embedder.dimensions(),
                    config.dimensions
                )));
            }
        }

        let connection = config.expanded_connection();
        let mut collection = Collection::default();
        let store = if is_in_memory(&connection) {
            None
        } else {
            let store = SqliteStore::open(PathBuf::from(&connection)).await?;
            collection = store.load().await?;
            tracing::info!(
                path = %store.path.display(),
                records = collection.records.len(),
                "Embedded memory loaded from disk"
            );
            Some(store)
        };

        Ok(Self {
            collection: RwLock::new(collection),
            embedder,
            dimensions: config.dimensions,
            store,
            defaults: MemoryDefaults::from_config(config),
            closed: AtomicBool::new(false),
        })
    }

    /// In-memory collection with default settings.
    pub async fn in_memory(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        let mut config = MemoryConfig::default();
        config.provider = "chromem".into();
        if let Some(embedder) = &embedder {
            config.dimensions = embedder.dimensions();
        }
        Self::open(&config, embedder).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(vec![vec![0.0; self.dimensions]; texts.len()]);
        };

        let vectors = embedder
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
        let mut vectors = self.embed(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::Embedding("no embedding returned".into()))
    }

    fn knowledge_record(doc: Document, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: doc.id.clone(),
            content: doc.content.clone(),
            embedding,
            created_at: doc.created_at,
            payload: Payload::Knowledge(doc),
        }
    }
}

fn is_in_memory(connection: &str) -> bool {
    let trimmed = connection.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("memory") || trimmed == ":memory:"
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

#[async_trait]
impl Memory for EmbeddedMemory {
    fn name(&self) -> &str {
        "chromem"
    }

    fn defaults(&self) -> &MemoryDefaults {
        &self.defaults
    }

    async fn store(&self, ctx: &MemoryContext, content: &str, tags: &[&str]) -> Result<()> {
        self.ensure_open()?;
        if content.trim().is_empty() {
            return Err(MemoryError::InvalidInput("memory content is empty".into()));
        }

        let embedding = self.embed_one(content).await?;
        let record = VectorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            embedding,
            payload: Payload::Personal {
                session_id: ctx.session_id().to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
            created_at: Utc::now(),
        };

        let mut collection = self.collection.write().await;
        if let Some(store) = &self.store {
            store.put_records(vec![record.clone()]).await?;
        }
        collection.records.push(record);
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

        let session_id = ctx.session_id();
        let count = {
            let collection = self.collection.read().await;
            collection
                .records
                .iter()
                .filter(|r| r.session_id() == Some(session_id))
                .count()
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embed_one(query).await?;
        let collection = self.collection.read().await;
        let mut scored: Vec<(f32, &VectorRecord)> = collection
            .records
            .iter()
            .filter(|r| r.session_id() == Some(session_id))
            .map(|r| (cosine_similarity(&query_embedding, &r.embedding), r))
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit.min(count))
            .map(|(score, record)| MemoryResult {
                content: record.content.clone(),
                score,
                tags: match &record.payload {
                    Payload::Personal { tags, .. } => tags.clone(),
                    Payload::Knowledge(_) => Vec::new(),
                },
                created_at: record.created_at,
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
        let mut collection = self.collection.write().await;
        if let Some(store) = &self.store {
            store.put_fact(ctx.session_id(), key, &value).await?;
        }
        collection
            .facts
            .entry(ctx.session_id().to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn recall(&self, ctx: &MemoryContext, key: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_open()?;
        let collection = self.collection.read().await;
        Ok(collection
            .facts
            .get(ctx.session_id())
            .and_then(|facts| facts.get(key).cloned()))
    }

    async fn add_message(&self, ctx: &MemoryContext, role: &str, content: &str) -> Result<()> {
        self.ensure_open()?;
        let message = Message::new(role, content);
        let mut collection = self.collection.write().await;
        if let Some(store) = &self.store {
            store.put_message(ctx.session_id(), &message).await?;
        }
        collection
            .messages
            .entry(ctx.session_id().to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_history(&self, ctx: &MemoryContext, limit: Option<usize>) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let collection = self.collection.read().await;
        let Some(messages) = collection.messages.get(ctx.session_id()) else {
            return Ok(Vec::new());
        };
        let start = match limit {
            Some(n) if n < messages.len() => messages.len() - n,
            _ => 0,
        };
        Ok(messages[start..].to_vec())
    }

    async fn ingest_document(&self, _ctx: &MemoryContext, mut doc: Document) -> Result<String> {
        self.ensure_open()?;
        validate_document(&doc)?;
        doc.prepare_for_ingest();

        let embedding = self.embed_one(&doc.content).await?;
        let id = doc.id.clone();
        let mut record = Self::knowledge_record(doc, embedding);

        let mut collection = self.collection.write().await;
        collection.keep_created_at(&mut record);
        if let Some(store) = &self.store {
            store.put_records(vec![record.clone()]).await?;
        }
        collection.upsert_knowledge(record);

        tracing::debug!(document_id = %id, "Document ingested");
        Ok(id)
    }

    async fn ingest_documents(
        &self,
        _ctx: &MemoryContext,
        mut docs: Vec<Document>,
    ) -> Result<Vec<String>> {
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

        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let mut records: Vec<VectorRecord> = docs
            .into_iter()
            .zip(embeddings)
            .map(|(doc, embedding)| Self::knowledge_record(doc, embedding))
            .collect();

        let mut collection = self.collection.write().await;
        let mut first_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in records.iter_mut() {
            collection.keep_created_at(record);
            // A repeated id within the batch keeps the first occurrence's time.
            let created_at = *first_seen
                .entry(record.id.clone())
                .or_insert(record.created_at);
            record.set_created_at(created_at);
        }
        if let Some(store) = &self.store {
            store.put_records(records.clone()).await?;
        }
        for record in records {
            collection.upsert_knowledge(record);
        }

        tracing::info!(count = ids.len(), "Documents ingested");
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

        let count = {
            let collection = self.collection.read().await;
            collection
                .records
                .iter()
                .filter(|r| r.kind() == KIND_KNOWLEDGE)
                .count()
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embed_one(query).await?;
        let collection = self.collection.read().await;
        let mut scored: Vec<(f32, &Document)> = collection
            .records
            .iter()
            .filter_map(|r| match &r.payload {
                Payload::Knowledge(doc) if options.matches(doc) => {
                    Some((cosine_similarity(&query_embedding, &r.embedding), doc))
                }
                _ => None,
            })
            .filter(|(score, _)| *score >= threshold)
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit.min(count))
            .map(|(score, doc)| KnowledgeResult::from_document(doc, score))
            .collect())
    }

    async fn clear_session(&self, ctx: &MemoryContext) -> Result<()> {
        self.ensure_open()?;
        let session_id = ctx.session_id();
        let mut collection = self.collection.write().await;
        if let Some(store) = &self.store {
            store.delete_session(session_id).await?;
        }
        collection
            .records
            .retain(|r| r.session_id() != Some(session_id));
        collection.facts.remove(session_id);
        collection.messages.remove(session_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        *self.collection.write().await = Collection::default();
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match &self.store {
            Some(store) => store.ping().await,
            None => true,
        }
    }
}

// ── On-disk persistence ──────────────────────────────────────────

fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Row shape shared by writes and loads.
struct RecordRow {
    kind: String,
    id: String,
    session_id: Option<String>,
    content: String,
    embedding: Vec<u8>,
    payload: String,
    created_at: String,
}

impl RecordRow {
    fn from_record(record: &VectorRecord) -> Result<Self> {
        let (session_id, payload) = match &record.payload {
            Payload::Personal { session_id, tags } => {
                (Some(session_id.clone()), serde_json::to_string(tags)?)
            }
            Payload::Knowledge(doc) => (None, serde_json::to_string(doc)?),
        };
        Ok(Self {
            kind: record.kind().to_string(),
            id: record.id.clone(),
            session_id,
            content: record.content.clone(),
            embedding: vec_to_bytes(&record.embedding),
            payload,
            created_at: record.created_at.to_rfc3339(),
        })
    }

    fn into_record(self) -> Result<VectorRecord> {
        let payload = match (self.kind.as_str(), self.session_id) {
            (KIND_KNOWLEDGE, _) => Payload::Knowledge(serde_json::from_str(&self.payload)?),
            (_, Some(session_id)) => Payload::Personal {
                session_id,
                tags: serde_json::from_str(&self.payload)?,
            },
            (kind, None) => {
                return Err(MemoryError::backend(
                    "load embedded memory",
                    format!("{kind} record {} has no session", self.id),
                ))
            }
        };
        Ok(VectorRecord {
            id: self.id,
            content: self.content,
            embedding: bytes_to_vec(&self.embedding),
            payload,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

struct LoadedRows {
    records: Vec<RecordRow>,
    facts: Vec<(String, String, String)>,
    messages: Vec<(String, String, String, String)>,
}

/// Write-through SQLite file behind an embedded collection.
struct SqliteStore {
    path: PathBuf,
}

async fn blocking<T, F>(operation: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::backend(operation, e))?
        .map_err(|e| MemoryError::backend(operation, e))
}

impl SqliteStore {
    async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::Config(format!("{}: {e}", parent.display())))?;
        }

        let db_path = path.clone();
        blocking("open embedded memory", move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    session_id TEXT,
                    content TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                );

                CREATE INDEX IF NOT EXISTS idx_records_session ON records(session_id);

                CREATE TABLE IF NOT EXISTS facts (
                    session_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, key)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq);
                "#,
            )
        })
        .await?;

        Ok(Self { path })
    }

    fn db_path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn load(&self) -> Result<Collection> {
        let db_path = self.db_path();
        let rows = blocking("load embedded memory", move || {
            let conn = Connection::open(&db_path)?;

            let mut stmt = conn.prepare(
                "SELECT kind, id, session_id, content, embedding, payload, created_at \
                 FROM records ORDER BY rowid",
            )?;
            let records = stmt
                .query_map([], |row| {
                    Ok(RecordRow {
                        kind: row.get(0)?,
                        id: row.get(1)?,
                        session_id: row.get(2)?,
                        content: row.get(3)?,
                        embedding: row.get(4)?,
                        payload: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare("SELECT session_id, key, value FROM facts")?;
            let facts = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT session_id, role, content, created_at FROM messages ORDER BY seq",
            )?;
            let messages = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(LoadedRows {
                records,
                facts,
                messages,
            })
        })
        .await?;

        let mut collection = Collection::default();
        for row in rows.records {
            collection.records.push(row.into_record()?);
        }
        for (session_id, key, value) in rows.facts {
            collection
                .facts
                .entry(session_id)
                .or_default()
                .insert(key, serde_json::from_str(&value)?);
        }
        for (session_id, role, content, created_at) in rows.messages {
            collection.messages.entry(session_id).or_default().push(Message {
                role,
                content,
                created_at: parse_timestamp(&created_at),
            });
        }
        Ok(collection)
    }

    /// Upsert records in one transaction.
    async fn put_records(&self, records: Vec<VectorRecord>) -> Result<()> {
        let rows = records
            .iter()
            .map(RecordRow::from_record)
            .collect::<Result<Vec<_>>>()?;

        let db_path = self.db_path();
        blocking("persist records", move || {
            let mut conn = Connection::open(&db_path)?;
            let tx = conn.transaction()?;
            for row in &rows {
                tx.execute(
                    r#"
                    INSERT INTO records (kind, id, session_id, content, embedding, payload, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(kind, id) DO UPDATE SET
                        content = excluded.content,
                        embedding = excluded.embedding,
                        payload = excluded.payload
                    "#,
                    params![
                        row.kind,
                        row.id,
                        row.session_id,
                        row.content,
                        row.embedding,
                        row.payload,
                        row.created_at
                    ],
                )?;
            }
            tx.commit()
        })
        .await
    }

    async fn put_fact(&self, session_id: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let db_path = self.db_path();
        let session_id = session_id.to_string();
        let key = key.to_string();
        let value = serde_json::to_string(value)?;

        blocking("persist fact", move || {
            let conn = Connection::open(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO facts (session_id, key, value, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![session_id, key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let db_path = self.db_path();
        let session_id = session_id.to_string();
        let role = message.role.clone();
        let content = message.content.clone();
        let created_at = message.created_at.to_rfc3339();

        blocking("persist message", move || {
            let conn = Connection::open(&db_path)?;
            conn.execute(
                "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, role, content, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let db_path = self.db_path();
        let session_id = session_id.to_string();

        blocking("clear session", move || {
            let mut conn = Connection::open(&db_path)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM records WHERE kind = ?1 AND session_id = ?2",
                params![KIND_PERSONAL, session_id],
            )?;
            tx.execute("DELETE FROM facts WHERE session_id = ?1", params![session_id])?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
            tx.commit()
        })
        .await
    }

    async fn ping(&self) -> bool {
        let db_path = self.db_path();
        tokio::task::spawn_blocking(move || {
            Connection::open(&db_path)
                .and_then(|conn| conn.execute_batch("SELECT 1"))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentType;
    use serde_json::json;
    use tempfile::TempDir;

    /// Maps each known keyword to one axis so related texts share direction.
    struct KeywordEmbedding;

    const AXES: &[&str] = &["sky", "blue", "grass", "green", "go", "performance", "rust"];

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedding {
        fn name(&self) -> &str {
            "keyword"
        }

        fn dimensions(&self) -> usize {
            AXES.len() + 1
        }

        async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    let mut v = vec![0.0; AXES.len() + 1];
                    for word in lower.split(|c: char| !c.is_alphanumeric()) {
                        match AXES.iter().position(|a| *a == word) {
                            Some(i) => v[i] += 1.0,
                            None if !word.is_empty() => v[AXES.len()] += 0.1,
                            None => {}
                        }
                    }
                    v
                })
                .collect())
        }
    }

    struct FailingEmbedding;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedding {
        fn name(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            AXES.len() + 1
        }

        async fn embed(&self, _texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding service unavailable")
        }
    }

    async fn setup() -> (EmbeddedMemory, MemoryContext) {
        let mem = EmbeddedMemory::in_memory(Some(Arc::new(KeywordEmbedding)))
            .await
            .unwrap();
        (mem, MemoryContext::for_session("s1"))
    }

    fn disk_config(dir: &TempDir) -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.provider = "chromem".into();
        config.connection = dir.path().join("memory.db").to_string_lossy().into_owned();
        config.dimensions = AXES.len() + 1;
        config
    }

    #[tokio::test]
    async fn query_ranks_by_cosine_similarity() {
        let (mem, ctx) = setup().await;
        mem.store(&ctx, "Grass is green", &[]).await.unwrap();
        mem.store(&ctx, "The sky is blue", &["nature"]).await.unwrap();

        let results = mem.query(&ctx, "sky", None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "The sky is blue");
        assert_eq!(results[0].tags, vec!["nature".to_string()]);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn limit_is_capped_by_collection_count() {
        let (mem, ctx) = setup().await;
        mem.store(&ctx, "only memory", &[]).await.unwrap();
        assert_eq!(mem.query(&ctx, "memory", Some(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_session_returns_empty_without_embedding() {
        let mem = EmbeddedMemory::in_memory(Some(Arc::new(FailingEmbedding)))
            .await
            .unwrap();
        let ctx = MemoryContext::for_session("empty");
        assert!(mem.query(&ctx, "anything", None).await.unwrap().is_empty());
        assert!(mem
            .search_knowledge(&ctx, "anything", &SearchOptions::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_leaves_no_record() {
        let mem = EmbeddedMemory::in_memory(Some(Arc::new(FailingEmbedding)))
            .await
            .unwrap();
        let ctx = MemoryContext::for_session("s1");

        let err = mem.store(&ctx, "The sky is blue", &[]).await.unwrap_err();
        assert!(matches!(err, MemoryError::Embedding(_)));
        assert!(mem.collection.read().await.records.is_empty());
    }

    #[tokio::test]
    async fn works_without_embedder() {
        let mem = EmbeddedMemory::in_memory(None).await.unwrap();
        let ctx = MemoryContext::for_session("s1");
        mem.store(&ctx, "first", &[]).await.unwrap();
        mem.store(&ctx, "second", &[]).await.unwrap();

        let results = mem.query(&ctx, "anything", None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].score, 0.0);
    }

    #[tokio::test]
    async fn mismatched_dimensions_fail_at_open() {
        let mut config = MemoryConfig::default();
        config.dimensions = 3;
        let result = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding))).await;
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn knowledge_is_filtered_and_upserted() {
        let (mem, ctx) = setup().await;
        mem.ingest_document(
            &ctx,
            Document::new("wiki-1", "Go performance tuning")
                .with_source("wiki")
                .with_type(DocumentType::Web),
        )
        .await
        .unwrap();
        mem.ingest_document(&ctx, Document::new("blog-1", "Go performance").with_source("blog"))
            .await
            .unwrap();
        mem.ingest_document(&ctx, Document::new("wiki-1", "Go performance profiling").with_source("wiki"))
            .await
            .unwrap();

        let opts = SearchOptions::new().source("wiki").score_threshold(0.0);
        let results = mem.search_knowledge(&ctx, "go performance", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "wiki-1");
        assert_eq!(results[0].content, "Go performance profiling");
    }

    #[tokio::test]
    async fn batch_ingest_returns_ids_in_order() {
        let (mem, ctx) = setup().await;
        let ids = mem
            .ingest_documents(
                &ctx,
                vec![Document::new("a", "rust"), Document::new("", "go"), Document::new("c", "sky")],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "a");
        assert!(!ids[1].is_empty());
        assert_eq!(ids[2], "c");
    }

    #[tokio::test]
    async fn clear_session_keeps_knowledge_and_other_sessions() {
        let (mem, s1) = setup().await;
        let s2 = MemoryContext::for_session("s2");
        mem.store(&s1, "sky", &[]).await.unwrap();
        mem.store(&s2, "sky", &[]).await.unwrap();
        mem.remember(&s1, "k", json!(1)).await.unwrap();
        mem.ingest_document(&s1, Document::new("d", "sky facts")).await.unwrap();

        mem.clear_session(&s1).await.unwrap();

        assert!(mem.query(&s1, "sky", None).await.unwrap().is_empty());
        assert_eq!(mem.recall(&s1, "k").await.unwrap(), None);
        assert_eq!(mem.query(&s2, "sky", None).await.unwrap().len(), 1);
        let opts = SearchOptions::new().score_threshold(0.0);
        assert_eq!(mem.search_knowledge(&s2, "sky", &opts).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = disk_config(&tmp);
        let ctx = MemoryContext::for_session("s1");

        {
            let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
                .await
                .unwrap();
            mem.store(&ctx, "The sky is blue", &["nature"]).await.unwrap();
            mem.remember(&ctx, "user_name", json!("Alice")).await.unwrap();
            mem.add_message(&ctx, "user", "hello").await.unwrap();
            mem.add_message(&ctx, "assistant", "hi").await.unwrap();
            mem.ingest_document(&ctx, Document::new("doc1", "Go performance").with_tags(["go"]))
                .await
                .unwrap();
            mem.close().await.unwrap();
        }

        assert!(tmp.path().join("memory.db").is_file());
        let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
            .await
            .unwrap();

        let results = mem.query(&ctx, "sky", None).await.unwrap();
        assert_eq!(results[0].content, "The sky is blue");
        assert_eq!(results[0].tags, vec!["nature".to_string()]);
        assert_eq!(mem.recall(&ctx, "user_name").await.unwrap(), Some(json!("Alice")));

        let history = mem.get_history(&ctx, None).await.unwrap();
        let roles: Vec<_> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);

        let opts = SearchOptions::new().tag("go").score_threshold(0.0);
        let knowledge = mem.search_knowledge(&ctx, "go", &opts).await.unwrap();
        assert_eq!(knowledge.len(), 1);
        assert_eq!(knowledge[0].document_id, "doc1");
    }

    #[tokio::test]
    async fn reingested_document_keeps_created_at_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = disk_config(&tmp);
        let ctx = MemoryContext::new();
        let now = Utc::now();
        let opts = SearchOptions::new()
            .score_threshold(0.0)
            .date_range(now - chrono::Duration::days(40), now - chrono::Duration::days(20));

        let before = {
            let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
                .await
                .unwrap();
            let mut doc = Document::new("doc1", "rust v1");
            doc.created_at = now - chrono::Duration::days(30);
            mem.ingest_document(&ctx, doc).await.unwrap();
            mem.ingest_document(&ctx, Document::new("doc1", "rust v2"))
                .await
                .unwrap();
            mem.ingest_documents(&ctx, vec![Document::new("doc1", "rust v3")])
                .await
                .unwrap();

            let results = mem.search_knowledge(&ctx, "rust", &opts).await.unwrap();
            assert_eq!(results.len(), 1);
            mem.close().await.unwrap();
            results[0].created_at
        };

        let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
            .await
            .unwrap();
        let results = mem.search_knowledge(&ctx, "rust", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "rust v3");
        assert_eq!(results[0].created_at, before);
    }

    #[tokio::test]
    async fn repeated_id_in_one_batch_keeps_first_created_at() {
        let (mem, ctx) = setup().await;
        let mut first = Document::new("doc1", "rust v1");
        first.created_at = Utc::now() - chrono::Duration::days(30);
        let first_created = first.created_at;

        mem.ingest_documents(&ctx, vec![first, Document::new("doc1", "rust v2")])
            .await
            .unwrap();

        let opts = SearchOptions::new().score_threshold(0.0);
        let results = mem.search_knowledge(&ctx, "rust", &opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "rust v2");
        assert_eq!(results[0].created_at, first_created);
    }

    #[tokio::test]
    async fn cleared_session_stays_cleared_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = disk_config(&tmp);
        let ctx = MemoryContext::for_session("s1");

        let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
            .await
            .unwrap();
        mem.store(&ctx, "sky", &[]).await.unwrap();
        mem.add_message(&ctx, "user", "hello").await.unwrap();
        mem.clear_session(&ctx).await.unwrap();
        mem.close().await.unwrap();

        let mem = EmbeddedMemory::open(&config, Some(Arc::new(KeywordEmbedding)))
            .await
            .unwrap();
        assert!(mem.query(&ctx, "sky", None).await.unwrap().is_empty());
        assert!(mem.get_history(&ctx, None).await.unwrap().is_empty());
        assert!(mem.health_check().await);
    }

    #[tokio::test]
    async fn closed_backend_rejects_calls() {
        let (mem, ctx) = setup().await;
        mem.close().await.unwrap();
        assert!(!mem.health_check().await);
        assert!(mem.query(&ctx, "sky", None).await.unwrap_err().is_closed());
    }

    #[test]
    fn vector_bytes_round_trip() {
        let v = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(bytes_to_vec(&vec_to_bytes(&v)), v);
    }

    #[test]
    fn memory_connections_skip_disk() {
        assert!(is_in_memory("memory"));
        assert!(is_in_memory(""));
        assert!(is_in_memory(":memory:"));
        assert!(!is_in_memory("/tmp/agentkit/memory.db"));
    }
}
