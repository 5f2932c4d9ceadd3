//! Embedding service and backends.
//!
//! [`EmbeddingService`] is the only way the rest of the crate turns text into
//! vectors. It wraps one [`EmbeddingBackend`] and adds the policy every
//! backend shares:
//!
//! - inputs longer than `max_input_chars` are truncated and the truncation is
//!   recorded on the result;
//! - batches are sent in `batch_size` groups and results come back in input
//!   order;
//! - a batch that fails is retried item by item so one bad input only fails
//!   itself.
//!
//! # Backends
//!
//! | Provider | Backend | Notes |
//! |----------|---------|-------|
//! | `"hash"` | [`HashEmbedder`] | Deterministic feature hashing, offline |
//! | `"openai"` | [`OpenAIEmbedder`] | `POST /v1/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`] | `POST /api/embed` |
//! | `"local"` | `LocalEmbedder` | fastembed, `local-embeddings-fastembed` feature |
//!
//! # Retry Strategy
//!
//! The HTTP backends retry transient failures with exponential backoff:
//! HTTP 429 and 5xx and network errors retry; other 4xx fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// A text-to-vector model.
///
/// `model_id` must change whenever the vectors would change; it is recorded
/// in every persisted index and compared at query time.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model_id(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed a batch, returning one vector per input in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub vector: Vec<f32>,
    /// The input was cut to `max_input_chars` before embedding.
    pub truncated: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbedError {
    #[error("input is empty")]
    EmptyInput,
    #[error("embedding backend failed: {0}")]
    Backend(String),
    #[error("backend returned {actual} dimensions, expected {expected}")]
    Dimensions { expected: usize, actual: usize },
}

pub struct EmbeddingService {
    backend: Box<dyn EmbeddingBackend>,
    max_input_chars: usize,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(backend: Box<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        Self {
            backend,
            max_input_chars: config.max_input_chars.max(1),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub async fn embed(&self, text: &str) -> Result<Embedded, EmbedError> {
        self.embed_batch(&[text.to_string()])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(EmbedError::Backend("empty embedding response".to_string())))
    }

    /// Embed many texts. The output has exactly one entry per input, in the
    /// same order; failures are reported per item.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Embedded, EmbedError>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            results.extend(self.embed_group(batch).await);
        }
        results
    }

    async fn embed_group(&self, texts: &[String]) -> Vec<Result<Embedded, EmbedError>> {
        let mut slots: Vec<Option<Result<Embedded, EmbedError>>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String, bool)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                slots[i] = Some(Err(EmbedError::EmptyInput));
                continue;
            }
            let (input, truncated) = truncate_input(text, self.max_input_chars);
            if truncated {
                tracing::warn!(
                    original_len = text.len(),
                    max_input_chars = self.max_input_chars,
                    "Truncated oversized embedding input"
                );
            }
            pending.push((i, input.to_string(), truncated));
        }

        if !pending.is_empty() {
            let inputs: Vec<String> = pending.iter().map(|(_, t, _)| t.clone()).collect();
            match self.backend.embed_texts(&inputs).await {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    for ((i, _, truncated), vector) in pending.iter().zip(vectors) {
                        slots[*i] = Some(self.check_dims(vector, *truncated));
                    }
                }
                outcome => {
                    match outcome {
                        Ok(vectors) => tracing::warn!(
                            expected = inputs.len(),
                            got = vectors.len(),
                            "Embedding batch returned wrong count, retrying per item"
                        ),
                        Err(e) => tracing::warn!(
                            error = %e,
                            size = inputs.len(),
                            "Embedding batch failed, retrying per item"
                        ),
                    }
                    for (i, input, truncated) in &pending {
                        slots[*i] = Some(self.embed_single(input, *truncated).await);
                    }
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(EmbedError::EmptyInput)))
            .collect()
    }

    async fn embed_single(&self, input: &str, truncated: bool) -> Result<Embedded, EmbedError> {
        let vectors = self
            .backend
            .embed_texts(&[input.to_string()])
            .await
            .map_err(|e| EmbedError::Backend(e.to_string()))?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Backend("empty embedding response".to_string()))?;
        self.check_dims(vector, truncated)
    }

    fn check_dims(&self, vector: Vec<f32>, truncated: bool) -> Result<Embedded, EmbedError> {
        let expected = self.dims();
        if vector.len() != expected {
            return Err(EmbedError::Dimensions {
                expected,
                actual: vector.len(),
            });
        }
        Ok(Embedded { vector, truncated })
    }
}

/// Cut `text` to at most `max_chars` bytes on a char boundary.
fn truncate_input(text: &str, max_chars: usize) -> (&str, bool) {
    if text.len() <= max_chars {
        return (text, false);
    }
    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

// ============ Hash Embedder ============

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a ±1 sign; the sum is L2-normalized. Texts that share
/// words land close together, which is enough for offline use and tests.
pub struct HashEmbedder {
    id: String,
    dims: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIMS: usize = 384;

    pub fn new(dims: usize) -> Self {
        Self {
            id: format!("hash:feature-hash-v1-{}", dims),
            dims,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket =
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % self.dims;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI Embedder ============

/// Calls `POST {url}/v1/embeddings` (default `https://api.openai.com`).
pub struct OpenAIEmbedder {
    id: String,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        if api_key.is_empty() {
            bail!("OpenAI embedding provider requires an API key");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            id: format!("openai:{}", model),
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = send_with_retry(request, self.max_retries, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_floats(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Embedder ============

/// Calls `POST {url}/api/embed` on a local Ollama (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    id: String,
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            id: format!("ollama:{}", model),
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);
        let json = send_with_retry(request, self.max_retries, "Ollama").await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
        embeddings
            .iter()
            .map(|e| {
                let values = e.as_array().ok_or_else(|| {
                    anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
                })?;
                json_floats(values)
            })
            .collect()
    }
}

fn json_floats(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding value: {}", v))
        })
        .collect()
}

/// Send a JSON request, retrying 429/5xx and network errors with
/// exponential backoff (1s, 2s, 4s, … capped at 32s).
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let request = request
            .try_clone()
            .ok_or_else(|| anyhow::anyhow!("{} request body is not cloneable", label))?;

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(attempt, %status, "{} embedding request failed, retrying", label);
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "{} embedding request failed, retrying", label);
                last_err = Some(e.into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

// ============ Local Embedder (fastembed) ============

/// Runs an ONNX sentence-embedding model in process via fastembed.
///
/// The model is downloaded from Hugging Face on first use and cached.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    id: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (which, dims) = match name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(which).with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
        Ok(Self {
            id: format!("local:{}", name),
            dims,
            batch_size: config.batch_size,
            model: std::sync::Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.id
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the backend named by `config.provider`.
///
/// `api_key` is only consulted by providers that need one.
pub fn create_backend(
    config: &EmbeddingConfig,
    api_key: Option<String>,
) -> Result<Box<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(
            config.dims.unwrap_or(HashEmbedder::DEFAULT_DIMS),
        ))),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(
            config,
            api_key.unwrap_or_default(),
        )?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(backend: Box<dyn EmbeddingBackend>, max_input_chars: usize) -> EmbeddingService {
        let config = EmbeddingConfig {
            max_input_chars,
            batch_size: 2,
            ..EmbeddingConfig::default()
        };
        EmbeddingService::new(backend, &config)
    }

    /// Fails any batch that contains the word "poison".
    struct PickyBackend {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingBackend for PickyBackend {
        fn model_id(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                bail!("model rejected input");
            }
            self.inner.embed_texts(texts).await
        }
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_one("Paris is the capital of France.");
        let b = e.embed_one("Paris is the capital of France.");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_ignores_case_and_punctuation() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.embed_one("Hello, World!"), e.embed_one("hello world"));
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let svc = service(Box::new(HashEmbedder::new(32)), 1000);
        let texts: Vec<String> = ["one", "two", "three", "four", "five"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let batch = svc.embed_batch(&texts).await;
        assert_eq!(batch.len(), texts.len());
        for (text, result) in texts.iter().zip(batch) {
            let single = svc.embed(text).await.unwrap();
            assert_eq!(result.unwrap(), single);
        }
    }

    #[tokio::test]
    async fn test_oversized_input_is_truncated_and_flagged() {
        let svc = service(Box::new(HashEmbedder::new(32)), 10);
        let out = svc.embed("alpha beta gamma delta").await.unwrap();
        assert!(out.truncated);
        let short = svc.embed("alpha beta").await.unwrap();
        assert!(!short.truncated);
        assert_eq!(out.vector, short.vector);
    }

    #[tokio::test]
    async fn test_failures_are_per_item() {
        let backend = PickyBackend {
            inner: HashEmbedder::new(16),
            calls: AtomicUsize::new(0),
        };
        let svc = service(Box::new(backend), 1000);
        let texts = vec![
            "fine text".to_string(),
            "poison pill".to_string(),
            "".to_string(),
            "also fine".to_string(),
        ];
        let results = svc.embed_batch(&texts).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EmbedError::Backend(_))));
        assert_eq!(results[2], Err(EmbedError::EmptyInput));
        assert!(results[3].is_ok());
    }

    #[tokio::test]
    async fn test_wrong_dimensions_are_reported() {
        struct Short;
        #[async_trait]
        impl EmbeddingBackend for Short {
            fn model_id(&self) -> &str {
                "short"
            }
            fn dims(&self) -> usize {
                4
            }
            async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
            }
        }
        let svc = service(Box::new(Short), 1000);
        let err = svc.embed("anything").await.unwrap_err();
        assert_eq!(
            err,
            EmbedError::Dimensions {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_openai_response_sorted_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_create_backend_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "telepathy".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_backend(&config, None).is_err());
    }
}
