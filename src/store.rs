//! Vector store: chunk table with hybrid retrieval and decay scoring.
//!
//! The table persists as one JSON line per chunk inside the table directory
//! and loads fully into memory at startup. The vector leg is an exact cosine
//! scan; the keyword leg is Okapi BM25 over a lazily built inverted index on
//! `text`. Hybrid mode fuses both with alpha-weighted Reciprocal Rank Fusion.
//!
//! Nothing in here raises out of a tool handler: a failed leg degrades the
//! mode, a total failure returns an empty list and logs.

use std::collections::HashMap;
use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{cache_key, EmbeddingClient};

/// Canonical table name. A `_rebuild`-suffixed table from the old migration
/// is adopted on open.
const TABLE_FILE: &str = "knowledge_chunks_cloud.jsonl";
const LEGACY_TABLE_FILE: &str = "knowledge_chunks_cloud_rebuild.jsonl";

/// Query-result cache TTL.
const RESULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// RRF rank constant.
const RRF_K: f64 = 60.0;

/// Chunks below this decay score count as stale in rescore stats.
pub const STALE_THRESHOLD: f64 = 0.05;

/// Decay score sentinel for archived chunks.
pub const ARCHIVED: f64 = -1.0;

/// Half-life (days) for the importance-weighted decay formula.
const DECAY_HALF_LIFE_DAYS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One retrieval unit. `vector` length equals the table dimension for every
/// chunk that carries one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    pub source: String,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub last_accessed: f64,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub decay_score: f64,
}

impl ChunkRecord {
    pub fn is_archived(&self) -> bool {
        self.decay_score == ARCHIVED
    }

    /// Quality/importance weights from the metadata blob, defaulting to 1.0.
    fn metadata_weight(&self, field: &str) -> f64 {
        serde_json::from_str::<serde_json::Value>(&self.metadata)
            .ok()
            .and_then(|m| m[field].as_f64())
            .unwrap_or(1.0)
    }
}

/// Input for a batch ingest. The caller supplies vectors (or not — text-only
/// chunks still serve the keyword leg).
pub struct ChunkInput {
    pub text: String,
    pub vector: Option<Vec<f32>>,
    pub source: String,
    pub metadata: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(SearchMode::Vector),
            "keyword" => Some(SearchMode::Keyword),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub mode: SearchMode,
    pub rerank: bool,
    pub alpha: f64,
}

impl SearchRequest {
    pub fn hybrid(query: impl Into<String>, top_k: usize) -> Self {
        Self { query: query.into(), top_k, mode: SearchMode::Hybrid, rerank: false, alpha: 0.5 }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub text: String,
    pub source: String,
    pub score: f64,
    pub timestamp: f64,
    pub metadata: String,
    pub search_mode: &'static str,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RescoreStats {
    pub total: usize,
    pub rescored: usize,
    pub stale: usize,
    pub archived: usize,
}

/// Cross-encoder hook. Left unset by default; the heuristic fallback always
/// works, so `rerank=true` never fails.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, text: &str) -> f64;
}

// ---------------------------------------------------------------------------
// BM25 inverted index
// ---------------------------------------------------------------------------

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct Bm25Index {
    /// term → (chunk index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    doc_len: Vec<u32>,
    avg_len: f64,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

impl Bm25Index {
    fn build(chunks: &[ChunkRecord]) -> Self {
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut doc_len = vec![0u32; chunks.len()];

        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.is_archived() {
                continue;
            }
            let mut tf: HashMap<String, u32> = HashMap::new();
            let tokens = tokenize(&chunk.text);
            doc_len[i] = tokens.len() as u32;
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((i, count));
            }
        }

        let live = doc_len.iter().filter(|&&l| l > 0).count().max(1);
        let avg_len = doc_len.iter().map(|&l| l as f64).sum::<f64>() / live as f64;
        Self { postings, doc_len, avg_len }
    }

    /// Okapi BM25 over the query terms. Returns (chunk index, score) ranked
    /// descending.
    fn search(&self, query: &str, limit: usize) -> Vec<(usize, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let n = self.doc_len.len() as f64;
        let mut scores: HashMap<usize, f64> = HashMap::new();

        for term in &terms {
            let Some(posting) = self.postings.get(term) else { continue };
            let df = posting.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for &(doc, tf) in posting {
                let tf = tf as f64;
                let len_norm =
                    1.0 - BM25_B + BM25_B * self.doc_len[doc] as f64 / self.avg_len.max(1.0);
                let contribution = idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * len_norm);
                *scores.entry(doc).or_default() += contribution;
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Decay scoring
// ---------------------------------------------------------------------------

pub fn epoch_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

fn days_since(chunk: &ChunkRecord, now: f64) -> f64 {
    let newest = chunk.last_accessed.max(chunk.timestamp);
    ((now - newest) / 86_400.0).max(0.0)
}

/// Default decay: quality-weighted exponential recency with a logarithmic
/// access bonus (floored so never-accessed chunks keep a nonzero score).
pub fn compute_decay_score(chunk: &ChunkRecord, now: f64) -> f64 {
    let base = chunk.metadata_weight("quality");
    let recency = 0.95_f64.powf(days_since(chunk, now));
    let access = ((chunk.access_count as f64 + 1.0).ln()).max(0.1);
    base * recency * access
}

/// Research-grade variant: importance-weighted exponential with an explicit
/// half-life.
pub fn compute_decay_score_v2(chunk: &ChunkRecord, now: f64) -> f64 {
    let base = chunk.metadata_weight("quality");
    let importance = chunk.metadata_weight("importance");
    let lambda = std::f64::consts::LN_2 / DECAY_HALF_LIFE_DAYS;
    let recency = (-lambda * days_since(chunk, now)).exp();
    let access = 1.0 + 0.1 * (1.0 + chunk.access_count as f64).ln();
    base * importance * recency * access
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct TableInner {
    chunks: Vec<ChunkRecord>,
    dim: Option<usize>,
    fts: Option<Bm25Index>,
}

pub struct VectorStore {
    table_path: PathBuf,
    archive_log: PathBuf,
    inner: RwLock<TableInner>,
    reranker: Option<Box<dyn Reranker>>,
    result_cache: Mutex<HashMap<String, (Instant, Vec<SearchResult>)>>,
}

/// Document identity for fusion and dedup: first 200 chars of text.
fn doc_key(text: &str) -> String {
    let mut end = text.len().min(200);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl VectorStore {
    /// Open (or create) the table under `table_dir`. A legacy `_rebuild`
    /// table is renamed to the canonical name first.
    pub fn open(table_dir: &Path, archive_log: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(table_dir) {
            warn!(dir = %table_dir.display(), error = %e, "could not create table directory");
        }
        let table_path = table_dir.join(TABLE_FILE);
        let legacy = table_dir.join(LEGACY_TABLE_FILE);
        if legacy.exists() && !table_path.exists() {
            if let Err(e) = fs::rename(&legacy, &table_path) {
                warn!(error = %e, "could not adopt legacy table, starting empty");
            }
        }

        let mut chunks = Vec::new();
        let mut dim = None;
        if let Ok(raw) = fs::read_to_string(&table_path) {
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChunkRecord>(line) {
                    Ok(chunk) => {
                        if dim.is_none() {
                            dim = chunk.vector.as_ref().map(|v| v.len());
                        }
                        chunks.push(chunk);
                    }
                    Err(e) => warn!(error = %e, "skipping malformed chunk line"),
                }
            }
        }
        debug!(chunks = chunks.len(), "vector table loaded");

        Self {
            table_path,
            archive_log: archive_log.to_path_buf(),
            inner: RwLock::new(TableInner { chunks, dim, fts: None }),
            reranker: None,
            result_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reranker(mut self, reranker: Box<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn count(&self) -> usize {
        self.inner.read().map(|t| t.chunks.len()).unwrap_or(0)
    }

    pub fn archived_count(&self) -> usize {
        self.inner
            .read()
            .map(|t| t.chunks.iter().filter(|c| c.is_archived()).count())
            .unwrap_or(0)
    }

    pub fn dim(&self) -> Option<usize> {
        self.inner.read().ok().and_then(|t| t.dim)
    }

    /// Append a batch. The table dimension is inferred from the first vector
    /// ever stored; later vectors with a different length are dropped (the
    /// chunk itself is kept for keyword retrieval). Returns stored count.
    pub fn add(&self, items: Vec<ChunkInput>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let now = epoch_now();
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return 0,
        };

        let mut appended = Vec::new();
        for item in items {
            if item.text.len() < 10 {
                continue;
            }
            let mut vector = item.vector;
            if let Some(ref v) = vector {
                match inner.dim {
                    None => inner.dim = Some(v.len()),
                    Some(d) if d != v.len() => {
                        warn!(expected = d, got = v.len(), "vector dimension mismatch, dropped");
                        vector = None;
                    }
                    _ => {}
                }
            }
            let chunk = ChunkRecord {
                text: item.text,
                vector,
                source: item.source.replace('\\', "/"),
                timestamp: now,
                metadata: item.metadata.to_string(),
                last_accessed: now,
                access_count: 0,
                decay_score: 0.0,
            };
            appended.push(chunk);
        }

        if appended.is_empty() {
            return 0;
        }

        if let Err(e) = self.append_lines(&appended) {
            warn!(error = %e, "chunk append failed, keeping in-memory copy only");
        }
        let stored = appended.len();
        inner.chunks.extend(appended);
        inner.fts = None; // keyword index rebuilds lazily on next search
        self.invalidate_result_cache();
        stored
    }

    fn append_lines(&self, chunks: &[ChunkRecord]) -> std::io::Result<()> {
        if let Some(parent) = self.table_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.table_path)?;
        for chunk in chunks {
            let line = serde_json::to_string(chunk).map_err(std::io::Error::other)?;
            writeln!(file, "{line}")?;
        }
        file.flush()
    }

    /// Rewrite the whole table file from memory (temp file + atomic rename).
    fn rewrite(&self, chunks: &[ChunkRecord]) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.table_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = self.table_path.with_extension("jsonl.tmp");
            let mut buf = String::new();
            for chunk in chunks {
                buf.push_str(&serde_json::to_string(chunk).map_err(std::io::Error::other)?);
                buf.push('\n');
            }
            fs::write(&tmp, buf)?;
            fs::rename(&tmp, &self.table_path)
        };
        if let Err(e) = write() {
            warn!(error = %e, "table rewrite failed");
        }
    }

    fn invalidate_result_cache(&self) {
        if let Ok(mut cache) = self.result_cache.lock() {
            cache.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub async fn search(
        &self,
        embedder: &EmbeddingClient,
        req: &SearchRequest,
    ) -> Vec<SearchResult> {
        let alpha = req.alpha.clamp(0.0, 1.0);
        let top_k = req.top_k.max(1);
        let fingerprint = cache_key(&format!(
            "{}|{}|{}|{}|{alpha}",
            req.query,
            top_k,
            req.mode.as_str(),
            req.rerank
        ));

        if let Ok(cache) = self.result_cache.lock() {
            if let Some((ts, cached)) = cache.get(&fingerprint) {
                if ts.elapsed() < RESULT_CACHE_TTL {
                    return cached.clone();
                }
            }
        }

        // Embedding happens before any table lock is taken.
        let query_vec = if req.mode != SearchMode::Keyword {
            embedder.embed_query(&req.query).await
        } else {
            None
        };

        let results = self.search_inner(req, top_k, alpha, query_vec);

        if let Ok(mut cache) = self.result_cache.lock() {
            cache.retain(|_, (ts, _)| ts.elapsed() < RESULT_CACHE_TTL);
            cache.insert(fingerprint, (Instant::now(), results.clone()));
        }
        results
    }

    fn search_inner(
        &self,
        req: &SearchRequest,
        top_k: usize,
        alpha: f64,
        query_vec: Option<Vec<f32>>,
    ) -> Vec<SearchResult> {
        let fetch = (3 * top_k).min(30).max(top_k);

        // Lazy keyword index (create-if-missing, idempotent).
        if req.mode != SearchMode::Vector {
            let needs_build = self.inner.read().map(|t| t.fts.is_none()).unwrap_or(false);
            if needs_build {
                if let Ok(mut inner) = self.inner.write() {
                    if inner.fts.is_none() {
                        let built = Bm25Index::build(&inner.chunks);
                        inner.fts = Some(built);
                    }
                }
            }
        }

        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "table lock poisoned, returning empty result");
                return Vec::new();
            }
        };

        let vector_leg: Vec<usize> = match (&query_vec, req.mode) {
            (_, SearchMode::Keyword) => Vec::new(),
            (None, SearchMode::Vector | SearchMode::Hybrid) => {
                debug!("vector leg unavailable (no query embedding)");
                Vec::new()
            }
            (Some(qv), _) => {
                let mut scored: Vec<(usize, f64)> = inner
                    .chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.is_archived())
                    .filter_map(|(i, c)| c.vector.as_ref().map(|v| (i, cosine(qv, v))))
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(fetch);
                scored.into_iter().map(|(i, _)| i).collect()
            }
        };

        let keyword_leg: Vec<usize> = if req.mode == SearchMode::Vector {
            Vec::new()
        } else {
            inner
                .fts
                .as_ref()
                .map(|fts| fts.search(&req.query, fetch).into_iter().map(|(i, _)| i).collect())
                .unwrap_or_default()
        };

        // Fuse. A hybrid request with one failed leg degrades to the other.
        let fused: Vec<usize> = match req.mode {
            SearchMode::Vector => vector_leg,
            SearchMode::Keyword => keyword_leg,
            SearchMode::Hybrid => {
                if vector_leg.is_empty() {
                    keyword_leg
                } else if keyword_leg.is_empty() {
                    vector_leg
                } else {
                    fuse_rrf(&inner.chunks, &vector_leg, &keyword_leg, alpha)
                }
            }
        };

        let mut ranked: Vec<(usize, f64)> = fused
            .iter()
            .enumerate()
            .map(|(rank, &idx)| (idx, 1.0 / (rank as f64 + 1.0)))
            .collect();

        if req.rerank {
            let query_tokens = tokenize(&req.query);
            let mut rescored: Vec<(usize, f64)> = ranked
                .iter()
                .enumerate()
                .map(|(rank, &(idx, _))| {
                    let text = &inner.chunks[idx].text;
                    let score = match &self.reranker {
                        Some(model) => {
                            let mut end = text.len().min(512);
                            while end > 0 && !text.is_char_boundary(end) {
                                end -= 1;
                            }
                            model.score(&req.query, &text[..end])
                        }
                        None => heuristic_rerank(rank, &query_tokens, text),
                    };
                    (idx, score)
                })
                .collect();
            rescored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            ranked = rescored;
        }

        ranked
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| {
                let chunk = &inner.chunks[idx];
                SearchResult {
                    text: chunk.text.clone(),
                    source: chunk.source.clone(),
                    score,
                    timestamp: chunk.timestamp,
                    metadata: chunk.metadata.clone(),
                    search_mode: req.mode.as_str(),
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Decay lifecycle
    // -----------------------------------------------------------------------

    /// Stalest chunks first (archived chunks excluded — they already left the
    /// hot set). Scores are computed fresh with the default formula.
    pub fn get_decay_report(&self, limit: usize) -> Vec<ChunkRecord> {
        let now = epoch_now();
        let inner = match self.inner.read() {
            Ok(i) => i,
            Err(_) => return Vec::new(),
        };
        let mut scored: Vec<ChunkRecord> = inner
            .chunks
            .iter()
            .filter(|c| !c.is_archived())
            .map(|c| {
                let mut chunk = c.clone();
                chunk.decay_score = compute_decay_score(c, now);
                chunk
            })
            .collect();
        scored.sort_by(|a, b| {
            a.decay_score.partial_cmp(&b.decay_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        scored
    }

    /// Mark the first chunk whose source matches `prefix` as freshly
    /// accessed. Returns whether a chunk matched.
    pub fn refresh_chunk(&self, prefix: &str) -> bool {
        let now = epoch_now();
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return false,
        };
        let found = inner
            .chunks
            .iter_mut()
            .find(|c| !c.is_archived() && (c.source.starts_with(prefix) || c.text.starts_with(prefix)));
        match found {
            Some(chunk) => {
                chunk.last_accessed = now;
                chunk.access_count += 1;
                self.rewrite(&inner.chunks);
                self.invalidate_result_cache();
                true
            }
            None => false,
        }
    }

    /// Archive the first matching chunk: decay sentinel plus one line in the
    /// archive log. The record itself is retained.
    pub fn archive_chunk(&self, prefix: &str) -> bool {
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return false,
        };
        let found = inner
            .chunks
            .iter_mut()
            .find(|c| !c.is_archived() && (c.source.starts_with(prefix) || c.text.starts_with(prefix)));
        let Some(chunk) = found else { return false };

        chunk.decay_score = ARCHIVED;
        let entry = serde_json::json!({
            "source": chunk.source,
            "preview": doc_key(&chunk.text),
            "archived_at": epoch_now(),
        });

        let append = || -> std::io::Result<()> {
            if let Some(parent) = self.archive_log.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file =
                fs::OpenOptions::new().create(true).append(true).open(&self.archive_log)?;
            writeln!(file, "{entry}")
        };
        if let Err(e) = append() {
            warn!(error = %e, "archive log append failed");
        }

        inner.fts = None; // archived chunks leave the keyword index
        self.rewrite(&inner.chunks);
        self.invalidate_result_cache();
        true
    }

    /// Recompute every live chunk's decay score and rewrite the table.
    pub fn batch_rescore_decay(&self) -> RescoreStats {
        let now = epoch_now();
        let mut inner = match self.inner.write() {
            Ok(i) => i,
            Err(_) => return RescoreStats::default(),
        };
        let mut stats = RescoreStats { total: inner.chunks.len(), ..Default::default() };
        for chunk in inner.chunks.iter_mut() {
            if chunk.is_archived() {
                stats.archived += 1;
                continue;
            }
            chunk.decay_score = compute_decay_score(chunk, now);
            stats.rescored += 1;
            if chunk.decay_score < STALE_THRESHOLD {
                stats.stale += 1;
            }
        }
        self.rewrite(&inner.chunks);
        stats
    }
}

// ---------------------------------------------------------------------------
// Fusion & rerank helpers
// ---------------------------------------------------------------------------

/// Alpha-weighted RRF: `alpha/(vec_rank + K) + (1-alpha)/(fts_rank + K)` with
/// 1-indexed ranks, summed per document identity (first 200 chars of text).
fn fuse_rrf(
    chunks: &[ChunkRecord],
    vector_leg: &[usize],
    keyword_leg: &[usize],
    alpha: f64,
) -> Vec<usize> {
    let mut fused: HashMap<String, (usize, f64)> = HashMap::new();

    for (rank, &idx) in vector_leg.iter().enumerate() {
        let key = doc_key(&chunks[idx].text);
        let score = alpha / ((rank + 1) as f64 + RRF_K);
        let entry = fused.entry(key).or_insert((idx, 0.0));
        entry.1 += score;
    }
    for (rank, &idx) in keyword_leg.iter().enumerate() {
        let key = doc_key(&chunks[idx].text);
        let score = (1.0 - alpha) / ((rank + 1) as f64 + RRF_K);
        let entry = fused.entry(key).or_insert((idx, 0.0));
        entry.1 += score;
    }

    let mut ranked: Vec<(usize, f64)> = fused.into_values().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().map(|(idx, _)| idx).collect()
}

/// Rerank fallback when no cross-encoder is configured: blend the fused rank
/// with keyword overlap against the head of the document.
fn heuristic_rerank(rank: usize, query_tokens: &[String], text: &str) -> f64 {
    let doc_tokens: Vec<String> = tokenize(text).into_iter().take(200).collect();
    let overlap = query_tokens.iter().filter(|t| doc_tokens.contains(t)).count() as f64;
    let overlap_ratio = overlap / (query_tokens.len().max(1) as f64);
    0.6 * (1.0 / (rank as f64 + 1.0)) + 0.4 * overlap_ratio
}
