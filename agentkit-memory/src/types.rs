//! Data types shared by every memory backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Kind of document held in the knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DocumentType {
    Pdf,
    Txt,
    Markdown,
    Web,
    Code,
    Json,
    /// Any other caller-defined type
    Custom(String),
}

impl Default for DocumentType {
    fn default() -> Self {
        Self::Txt
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pdf => write!(f, "pdf"),
            Self::Txt => write!(f, "txt"),
            Self::Markdown => write!(f, "md"),
            Self::Web => write!(f, "web"),
            Self::Code => write!(f, "code"),
            Self::Json => write!(f, "json"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for DocumentType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "txt" | "text" => Self::Txt,
            "md" | "markdown" => Self::Markdown,
            "web" => Self::Web,
            "code" => Self::Code,
            "json" => Self::Json,
            _ => Self::Custom(s.to_string()),
        }
    }
}

impl From<String> for DocumentType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<DocumentType> for String {
    fn from(t: DocumentType) -> Self {
        t.to_string()
    }
}

/// A document in the global knowledge base.
///
/// Chunking is the caller's job: each chunk is ingested as its own document
/// with `chunk_index`/`chunk_total` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned id; generated on ingest when empty
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub chunk_index: i32,
    #[serde(default = "default_chunk_total")]
    pub chunk_total: i32,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "chrono::Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_chunk_total() -> i32 {
    1
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            content: content.into(),
            source: String::new(),
            doc_type: DocumentType::default(),
            metadata: HashMap::new(),
            tags: Vec::new(),
            chunk_index: 0,
            chunk_total: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_type(mut self, doc_type: impl Into<DocumentType>) -> Self {
        self.doc_type = doc_type.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_chunk(mut self, index: i32, total: i32) -> Self {
        self.chunk_index = index;
        self.chunk_total = total;
        self
    }

    /// Assign an id if missing and stamp `updated_at`.
    pub(crate) fn prepare_for_ingest(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        self.updated_at = Utc::now();
    }
}

/// A personal memory returned by `query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryResult {
    pub content: String,
    /// Relevance, higher is better
    pub score: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A knowledge-base hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub document_id: String,
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub chunk_index: i32,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeResult {
    pub(crate) fn from_document(doc: &Document, score: f32) -> Self {
        Self {
            document_id: doc.id.clone(),
            content: doc.content.clone(),
            score,
            title: doc.title.clone(),
            source: doc.source.clone(),
            doc_type: doc.doc_type.clone(),
            tags: doc.tags.clone(),
            metadata: doc.metadata.clone(),
            chunk_index: doc.chunk_index,
            created_at: doc.created_at,
        }
    }
}

/// A chat message in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Options for `search_knowledge` and `search_all`.
///
/// Filters are conjunctive across kinds. Within a kind a document matches
/// when its source (or type) is any of the listed values, or when it shares
/// at least one tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum results; backend default when unset
    pub limit: Option<usize>,
    /// Minimum score; backend default when unset
    pub score_threshold: Option<f32>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub document_types: Vec<DocumentType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default = "default_true")]
    pub include_personal: bool,
    #[serde(default = "default_true")]
    pub include_knowledge: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            score_threshold: None,
            sources: Vec::new(),
            document_types: Vec::new(),
            tags: Vec::new(),
            date_range: None,
            include_personal: true,
            include_knowledge: true,
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn document_type(mut self, doc_type: impl Into<DocumentType>) -> Self {
        self.document_types.push(doc_type.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn date_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_range = Some(DateRange::new(start, end));
        self
    }

    pub fn include_personal(mut self, include: bool) -> Self {
        self.include_personal = include;
        self
    }

    pub fn include_knowledge(mut self, include: bool) -> Self {
        self.include_knowledge = include;
        self
    }

    /// Whether a document passes the source, type, tag and date filters.
    pub fn matches(&self, doc: &Document) -> bool {
        if !self.sources.is_empty() && !self.sources.iter().any(|s| *s == doc.source) {
            return false;
        }
        if !self.document_types.is_empty() && !self.document_types.contains(&doc.doc_type) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| doc.tags.contains(t)) {
            return false;
        }
        if let Some(range) = &self.date_range {
            if !range.contains(doc.created_at) {
                return false;
            }
        }
        true
    }
}

/// Options for `build_context`. Unset fields fall back to the backend's
/// configured RAG defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_tokens: Option<usize>,
    pub personal_weight: Option<f32>,
    pub knowledge_weight: Option<f32>,
    pub history_limit: Option<usize>,
    pub include_sources: Option<bool>,
    /// Template with `{query}`, `{personal_memory}`, `{knowledge}`,
    /// `{history}` and `{sources}` placeholders
    pub format_template: Option<String>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn personal_weight(mut self, weight: f32) -> Self {
        self.personal_weight = Some(weight);
        self
    }

    pub fn knowledge_weight(mut self, weight: f32) -> Self {
        self.knowledge_weight = Some(weight);
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn include_sources(mut self, include: bool) -> Self {
        self.include_sources = Some(include);
        self
    }

    pub fn format_template(mut self, template: impl Into<String>) -> Self {
        self.format_template = Some(template.into());
        self
    }
}

/// Combined personal and knowledge results for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridResult {
    pub query: String,
    pub personal_memory: Vec<MemoryResult>,
    pub knowledge: Vec<KnowledgeResult>,
    pub total_results: usize,
    pub search_time: Duration,
}

/// Assembled retrieval context ready for a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagContext {
    pub query: String,
    pub personal_memory: Vec<MemoryResult>,
    pub knowledge: Vec<KnowledgeResult>,
    pub chat_history: Vec<Message>,
    pub context_text: String,
    /// Distinct knowledge sources, in first-seen order
    pub sources: Vec<String>,
    /// Estimated tokens in `context_text`
    pub token_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-backend defaults derived from configuration.
#[derive(Debug, Clone)]
pub struct MemoryDefaults {
    pub max_results: usize,
    pub knowledge_max_results: usize,
    pub knowledge_score_threshold: f32,
    pub max_context_tokens: usize,
    pub personal_weight: f32,
    pub knowledge_weight: f32,
    pub include_sources: bool,
    pub history_limit: usize,
}

impl MemoryDefaults {
    pub fn from_config(config: &agentkit_common::MemoryConfig) -> Self {
        Self {
            max_results: config.max_results,
            knowledge_max_results: config.knowledge_max_results,
            knowledge_score_threshold: config.effective_knowledge_score_threshold(),
            max_context_tokens: config.rag_max_context_tokens,
            personal_weight: config.rag_personal_weight,
            knowledge_weight: config.rag_knowledge_weight,
            include_sources: config.rag_include_sources,
            history_limit: config.rag_history_limit,
        }
    }
}

impl Default for MemoryDefaults {
    fn default() -> Self {
        Self::from_config(&agentkit_common::MemoryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_type_display_and_parse() {
        assert_eq!(DocumentType::Markdown.to_string(), "md");
        assert_eq!(DocumentType::from("MARKDOWN"), DocumentType::Markdown);
        assert_eq!(DocumentType::from("web"), DocumentType::Web);
        assert_eq!(
            DocumentType::from("wiki"),
            DocumentType::Custom("wiki".into())
        );
    }

    #[test]
    fn custom_document_type_keeps_its_case() {
        assert_eq!(DocumentType::from("FAQ"), DocumentType::Custom("FAQ".into()));
        assert_eq!(DocumentType::from("FAQ").to_string(), "FAQ");
        assert_eq!(DocumentType::from("Pdf"), DocumentType::Pdf);
    }

    #[test]
    fn document_type_serializes_as_string() {
        let json = serde_json::to_string(&DocumentType::Pdf).unwrap();
        assert_eq!(json, "\"pdf\"");
        let parsed: DocumentType = serde_json::from_str("\"ticket\"").unwrap();
        assert_eq!(parsed, DocumentType::Custom("ticket".into()));
    }

    #[test]
    fn document_deserializes_with_defaults() {
        let doc: Document = serde_json::from_str(r#"{"content": "hello"}"#).unwrap();
        assert!(doc.id.is_empty());
        assert_eq!(doc.chunk_index, 0);
        assert_eq!(doc.chunk_total, 1);
        assert_eq!(doc.doc_type, DocumentType::Txt);
    }

    #[test]
    fn prepare_for_ingest_assigns_missing_id() {
        let mut doc = Document::new("", "content");
        doc.prepare_for_ingest();
        assert!(!doc.id.is_empty());

        let mut doc = Document::new("doc1", "content");
        doc.prepare_for_ingest();
        assert_eq!(doc.id, "doc1");
    }

    #[test]
    fn filters_combine_across_kinds() {
        let doc = Document::new("d", "c")
            .with_source("wiki")
            .with_type("md")
            .with_tags(["go", "perf"]);

        assert!(SearchOptions::new().matches(&doc));
        assert!(SearchOptions::new().source("blog").source("wiki").matches(&doc));
        assert!(!SearchOptions::new().source("blog").matches(&doc));
        assert!(SearchOptions::new().tag("rust").tag("go").matches(&doc));
        assert!(!SearchOptions::new().tag("rust").matches(&doc));
        assert!(!SearchOptions::new()
            .source("wiki")
            .document_type(DocumentType::Pdf)
            .matches(&doc));
    }

    #[test]
    fn date_range_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let mut doc = Document::new("d", "c");

        doc.created_at = end;
        assert!(SearchOptions::new().date_range(start, end).matches(&doc));

        doc.created_at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(!SearchOptions::new().date_range(start, end).matches(&doc));
    }

    #[test]
    fn search_options_include_both_by_default() {
        let opts = SearchOptions::default();
        assert!(opts.include_personal);
        assert!(opts.include_knowledge);
        assert!(opts.limit.is_none());
    }
}
