//! Embedding client: batched, concurrent embedding with an in-process cache.
//!
//! The external provider sits behind a trait so tests can substitute a
//! deterministic stub. The shipped implementation talks to a hosted
//! embedding API over JSON. Missing embeddings are a degrade, never an
//! error: callers receive `None` slots and fall back to keyword retrieval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

/// Texts per provider call.
const BATCH_SIZE: usize = 50;
/// Concurrent provider calls per `embed` invocation.
const MAX_WORKERS: usize = 4;
/// Backoff before the single retry of a failed batch.
const RETRY_BACKOFF: Duration = Duration::from_millis(1500);

/// Query-embedding cache sizing.
const QUERY_CACHE_MAX: usize = 100;
const QUERY_CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, order-preserving. One vector per input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimensionality.
    fn dim(&self) -> usize;
}

/// Hosted embedding API client (Gemini-style batch contract).
pub struct RemoteEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dim: usize,
}

impl RemoteEmbedder {
    pub fn new(endpoint: String, api_key: String, model: String, dim: usize) -> Self {
        Self { http: reqwest::Client::new(), endpoint, api_key, model, dim }
    }

    /// Build from environment: `MIDOS_EMBED_ENDPOINT`, `MIDOS_EMBED_API_KEY`,
    /// `MIDOS_EMBED_MODEL`, `MIDOS_EMBED_DIM`. Returns `None` without a key —
    /// the server then runs keyword-only.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("MIDOS_EMBED_API_KEY").ok()?;
        let endpoint = std::env::var("MIDOS_EMBED_ENDPOINT").unwrap_or_else(|_| {
            "https://generativelanguage.googleapis.com/v1beta/models".to_string()
        });
        let model = std::env::var("MIDOS_EMBED_MODEL")
            .unwrap_or_else(|_| "gemini-embedding-001".to_string());
        let dim = std::env::var("MIDOS_EMBED_DIM")
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(3072);
        Some(Self::new(endpoint, api_key, model, dim))
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/{}:batchEmbedContents?key={}",
            self.endpoint, self.model, self.api_key
        );
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": t }] }
                })
            })
            .collect();

        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| ServerError::internal(format!("embed request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ServerError::internal(format!(
                "embed provider returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ServerError::internal(format!("embed response parse: {e}")))?;

        let embeddings = body["embeddings"]
            .as_array()
            .ok_or_else(|| ServerError::internal("embed response missing 'embeddings'"))?;

        let mut out = Vec::with_capacity(texts.len());
        for emb in embeddings {
            let values = emb["values"]
                .as_array()
                .ok_or_else(|| ServerError::internal("embedding entry missing 'values'"))?;
            out.push(values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect());
        }
        if out.len() != texts.len() {
            return Err(ServerError::internal(format!(
                "embed count mismatch: {} in, {} out",
                texts.len(),
                out.len()
            )));
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Query expansion
// ---------------------------------------------------------------------------

/// Short term → richer synonym block. Keys are checked as substrings of the
/// lowercased query.
static EXPANSIONS: &[(&str, &str)] = &[
    ("caching", "caching response cache semantic cache performance"),
    ("testing", "testing unit test integration test e2e coverage"),
    ("deployment", "deployment deploy production CI/CD docker kubernetes"),
    ("security", "security authentication authorization OWASP vulnerability"),
    ("performance", "performance optimization speed latency throughput"),
    ("migration", "migration upgrade breaking changes version update"),
    ("api", "API REST GraphQL endpoint request response"),
    ("database", "database SQL ORM query schema migration"),
    ("auth", "authentication authorization JWT OAuth session tokens"),
    ("docker", "Docker container image compose kubernetes deployment"),
    ("react", "React hooks components state management JSX"),
    ("typescript", "TypeScript types generics interfaces type safety"),
    ("fastapi", "FastAPI Python web framework async Pydantic"),
    ("mcp", "MCP Model Context Protocol tools server integration"),
    ("rag", "RAG retrieval augmented generation vector embeddings search"),
    ("chunking", "chunking text splitting segmentation embedding retrieval"),
    ("monitoring", "monitoring logging metrics observability health check"),
];

/// Enrich short queries with one domain synonym block so they embed closer
/// to stored chunks. Long queries are already descriptive and pass through.
pub fn expand_query(query: &str) -> String {
    if query.len() > 60 {
        return query.to_string();
    }
    let q_lower = query.to_lowercase();
    for (term, expansion) in EXPANSIONS {
        if q_lower.contains(term) {
            return format!("{query} — {expansion}");
        }
    }
    query.to_string()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// 16-hex-char content fingerprint for cache lookup.
pub fn cache_key(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

pub struct EmbeddingClient {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    /// Content fingerprint → vector. Process lifetime, never persisted.
    cache: Mutex<HashMap<String, Vec<f32>>>,
    /// Expanded query text → (inserted-at, vector). LRU by oldest timestamp.
    query_cache: Mutex<HashMap<String, (Instant, Vec<f32>)>>,
}

impl EmbeddingClient {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
            query_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Embed many texts, order-preserving. Cached slots are served from
    /// memory; the rest are batched (50 per call) and fanned out across at
    /// most 4 concurrent provider calls. A batch that fails twice yields
    /// `None` for its slots.
    pub async fn embed(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut uncached: Vec<(usize, String)> = Vec::new();

        {
            let cache = match self.cache.lock() {
                Ok(c) => c,
                Err(_) => return results,
            };
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&cache_key(text)) {
                    Some(v) => results[i] = Some(v.clone()),
                    None => uncached.push((i, text.clone())),
                }
            }
        }

        let hits = texts.len() - uncached.len();
        if hits > 0 {
            debug!(hits, total = texts.len(), "embedding cache hits");
        }
        if uncached.is_empty() {
            return results;
        }

        let provider = match &self.provider {
            Some(p) => Arc::clone(p),
            None => return results,
        };

        // Fan the uncached batches out, bounded by the worker cap. Each task
        // reports (start index within `uncached`, per-slot vectors).
        let semaphore = Arc::new(Semaphore::new(MAX_WORKERS));
        let mut handles = Vec::new();
        let batch_inputs: Vec<(usize, Vec<String>)> = uncached
            .chunks(BATCH_SIZE)
            .enumerate()
            .map(|(bi, chunk)| (bi * BATCH_SIZE, chunk.iter().map(|(_, t)| t.clone()).collect()))
            .collect();

        for (start, batch) in batch_inputs {
            let provider = Arc::clone(&provider);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match provider.embed_batch(&batch).await {
                    Ok(vecs) => (start, vecs.into_iter().map(Some).collect::<Vec<_>>()),
                    Err(e) => {
                        warn!(start, error = %e, "batch embed failed, retrying once");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        match provider.embed_batch(&batch).await {
                            Ok(vecs) => (start, vecs.into_iter().map(Some).collect()),
                            Err(e2) => {
                                warn!(start, error = %e2, "batch embed retry failed");
                                (start, vec![None; batch.len()])
                            }
                        }
                    }
                }
            }));
        }

        let mut batch_results: Vec<(usize, Vec<Option<Vec<f32>>>)> = Vec::new();
        for handle in handles {
            if let Ok(r) = handle.await {
                batch_results.push(r);
            }
        }

        let mut new_cached = 0usize;
        if let Ok(mut cache) = self.cache.lock() {
            for (start, vecs) in batch_results {
                for (j, vec) in vecs.into_iter().enumerate() {
                    let Some((orig_idx, text)) = uncached.get(start + j) else { continue };
                    if let Some(v) = vec {
                        cache.insert(cache_key(text), v.clone());
                        results[*orig_idx] = Some(v);
                        new_cached += 1;
                    }
                }
            }
        }
        if new_cached > 0 {
            debug!(new_entries = new_cached, "embedding cache updated");
        }

        results
    }

    /// Embed a search query: expansion, then the dedicated TTL/LRU cache,
    /// then a single-shot embed.
    pub async fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        let expanded = expand_query(text);
        let now = Instant::now();

        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some((ts, emb)) = cache.get(&expanded) {
                if now.duration_since(*ts) < QUERY_CACHE_TTL {
                    return Some(emb.clone());
                }
                cache.remove(&expanded);
            }
        }

        let embedding = self.embed(std::slice::from_ref(&expanded)).await.pop().flatten()?;

        if let Ok(mut cache) = self.query_cache.lock() {
            if cache.len() >= QUERY_CACHE_MAX {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, (ts, _))| *ts)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest);
                }
            }
            cache.insert(expanded, (now, embedding.clone()));
        }

        Some(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let digest = Sha256::digest(t.as_bytes());
                    (0..self.dim).map(|i| digest[i % 32] as f32 / 255.0).collect()
                })
                .collect())
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }

    #[tokio::test]
    async fn embed_preserves_order_and_caches() {
        let client = EmbeddingClient::new(Some(Arc::new(StubEmbedder { dim: 8 })));
        let texts: Vec<String> = (0..120).map(|i| format!("text number {i}")).collect();

        let first = client.embed(&texts).await;
        assert!(first.iter().all(|v| v.is_some()));
        assert_eq!(client.cached_entries(), 120);

        // Same inputs come straight from cache, same values
        let second = client.embed(&texts).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn disabled_client_degrades_to_none() {
        let client = EmbeddingClient::disabled();
        let out = client.embed(&["hello".to_string()]).await;
        assert_eq!(out, vec![None]);
        assert!(client.embed_query("hello").await.is_none());
    }

    #[test]
    fn expansion_only_touches_short_queries() {
        assert!(expand_query("auth").contains("JWT"));
        let long = "a".repeat(80);
        assert_eq!(expand_query(&long), long);
    }

    #[test]
    fn cache_key_is_16_hex_chars() {
        let k = cache_key("anything");
        assert_eq!(k.len(), 16);
        assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
