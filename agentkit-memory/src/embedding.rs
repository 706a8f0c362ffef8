//! Embedding providers.
//!
//! Backends receive an `Arc<dyn EmbeddingProvider>` at construction and never
//! construct one themselves. [`create_embedding_provider`] builds one from
//! configuration.

use agentkit_common::EmbeddingConfig;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Text → vector capability.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g., "openai", "ollama")
    fn name(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one vector per text in input order.
    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("{} returned no embedding", self.name()))
    }
}

// ============================================================================
// Dummy
// ============================================================================

/// Zero vectors of a fixed dimension. Similarity against them is always 0.
pub struct DummyEmbedding {
    dims: usize,
}

impl DummyEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for DummyEmbedding {
    fn name(&self) -> &str {
        "dummy"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0; self.dims]).collect())
    }
}

// ============================================================================
// OpenAI
// ============================================================================

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";

/// OpenAI `/v1/embeddings` client.
pub struct OpenAiEmbedding {
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_batch_size: usize,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl OpenAiEmbedding {
    /// Create a client for `model` (default `text-embedding-3-small`).
    pub fn new(api_key: &str, model: Option<&str>) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            bail!("OpenAI API key is required");
        }
        let model = model.unwrap_or(OPENAI_DEFAULT_MODEL).to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            dims: openai_dimensions(&model),
            model,
            max_batch_size: 100,
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(self)
    }

    async fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .context("OpenAI embeddings request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("OpenAI embeddings returned {status}: {body}");
        }

        let mut parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI embeddings response")?;

        if parsed.data.len() != texts.len() {
            bail!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            );
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Vector length for an OpenAI embedding model.
pub fn openai_dimensions(model: &str) -> usize {
    if model == "text-embedding-3-large" {
        3072
    } else {
        1536
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size) {
            tracing::debug!(count = batch.len(), model = %self.model, "Requesting OpenAI embeddings");
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

// ============================================================================
// Ollama
// ============================================================================

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const OLLAMA_DEFAULT_MODEL: &str = "mxbai-embed-large";

/// Ollama `/api/embeddings` client. One request per text.
pub struct OllamaEmbedding {
    base_url: String,
    model: String,
    dims: usize,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    /// Create a client. Defaults to `http://localhost:11434` and
    /// `mxbai-embed-large`.
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> anyhow::Result<Self> {
        let model = model.unwrap_or(OLLAMA_DEFAULT_MODEL).to_string();
        let client = Client::builder()
            // Local models can be slow to load
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url
                .unwrap_or(OLLAMA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            dims: ollama_dimensions(&model),
            model,
            client,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(self)
    }
}

/// Vector length for an Ollama embedding model.
pub fn ollama_dimensions(model: &str) -> usize {
    if model.contains("nomic-embed") {
        768
    } else {
        1024
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let mut out = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            let response = self
                .client
                .post(&url)
                .json(&OllamaEmbeddingRequest {
                    model: &self.model,
                    prompt: text,
                })
                .send()
                .await
                .with_context(|| format!("Ollama embeddings request failed for text {i}"))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                bail!("Ollama embeddings returned {status} for text {i}: {body}");
            }

            let parsed: OllamaEmbeddingResponse = response
                .json()
                .await
                .context("Failed to parse Ollama embeddings response")?;
            if parsed.embedding.is_empty() {
                bail!("Ollama returned no embedding for text {i}");
            }
            out.push(parsed.embedding);
        }

        Ok(out)
    }
}

// ============================================================================
// Cache
// ============================================================================

/// LRU cache in front of another provider, keyed by exact text.
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbedding {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedding {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<&str> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for text in texts {
                let hit = cache.get(*text).cloned();
                if hit.is_none() && !misses.contains(text) {
                    misses.push(*text);
                }
                out.push(hit);
            }
        }

        if !misses.is_empty() {
            let fresh = self.inner.embed(&misses).await?;
            if fresh.len() != misses.len() {
                bail!(
                    "{} returned {} embeddings for {} inputs",
                    self.inner.name(),
                    fresh.len(),
                    misses.len()
                );
            }

            let mut cache = self.cache.lock().await;
            for (text, vector) in misses.iter().zip(fresh) {
                for (slot, original) in out.iter_mut().zip(texts) {
                    if slot.is_none() && original == text {
                        *slot = Some(vector.clone());
                    }
                }
                cache.put((*text).to_string(), vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| anyhow!("embedding cache lost an entry")))
            .collect()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build an embedding provider from configuration.
///
/// `dimensions` sizes the dummy provider; real providers report their own.
/// Non-dummy providers are wrapped in [`CachedEmbedding`] when
/// `cache_embeddings` is set.
pub fn create_embedding_provider(
    config: &EmbeddingConfig,
    dimensions: usize,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let name = config.provider.trim().to_lowercase();
    let provider: Arc<dyn EmbeddingProvider> = match name.as_str() {
        "dummy" | "" => return Ok(Arc::new(DummyEmbedding::new(dimensions))),
        "openai" => {
            let key = config
                .api_key
                .as_deref()
                .context("OpenAI embedding provider requires an API key")?;
            let mut provider = OpenAiEmbedding::new(key, config.model.as_deref())?
                .with_max_batch_size(config.max_batch_size)
                .with_timeout(timeout)?;
            if let Some(url) = config.base_url.as_deref() {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
        "ollama" => Arc::new(
            OllamaEmbedding::new(config.base_url.as_deref(), config.model.as_deref())?
                .with_timeout(timeout)?,
        ),
        other => bail!("Unknown embedding provider: {other}"),
    };

    if config.cache_embeddings {
        Ok(Arc::new(CachedEmbedding::new(provider, config.cache_size)))
    } else {
        Ok(provider)
    }
}
