//! API key storage and monthly quota accounting.
//!
//! Two JSON files under `config/`: `api_keys.json` (key → record) and
//! `api_usage.json` (identifier → {month, count}). Every write goes through
//! a temp file + atomic rename. The usage ledger counts in memory and
//! flushes at most once every 30 seconds; the keys file is re-read at most
//! once every 60 seconds.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ServerError};
use crate::types::KeyTier;

pub const KEY_PREFIX: &str = "midos_sk_";
/// Random bytes per key → 48 hex chars after the prefix.
const KEY_BYTES: usize = 24;

const KEYS_CACHE_TTL: Duration = Duration::from_secs(60);
const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Queries per month by key tier.
pub fn tier_limit(tier: KeyTier) -> u64 {
    match tier {
        KeyTier::Free => 100,
        KeyTier::Dev => 5_000,
        KeyTier::Pro => 25_000,
        KeyTier::Team => 100_000,
    }
}

/// Current UTC month, `YYYY-MM`.
pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    pub name: String,
    pub tier: KeyTier,
    pub created: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEntry {
    pub month: String,
    pub count: u64,
}

/// Masked key view for listings.
#[derive(Clone, Debug, Serialize)]
pub struct MaskedKey {
    pub prefix: String,
    pub name: String,
    pub tier: KeyTier,
    pub active: bool,
    pub created: String,
}

// ---------------------------------------------------------------------------
// Atomic JSON files
// ---------------------------------------------------------------------------

fn load_json_map<T: for<'de> Deserialize<'de>>(path: &Path) -> HashMap<String, T> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(file = %path.display(), error = %e, "malformed JSON map, starting empty");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

fn save_json_map<T: Serialize>(path: &Path, map: &HashMap<String, T>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(map).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

struct KeysCache {
    keys: HashMap<String, KeyRecord>,
    loaded_at: Option<Instant>,
}

pub struct KeyStore {
    path: PathBuf,
    cache: Mutex<KeysCache>,
}

impl KeyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, cache: Mutex::new(KeysCache { keys: HashMap::new(), loaded_at: None }) }
    }

    /// Generate a `midos_sk_` + 48 hex key from the OS CSPRNG and persist it
    /// active.
    pub fn generate(&self, name: &str, tier: KeyTier) -> Result<String> {
        let mut bytes = [0u8; KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        let key = format!("{KEY_PREFIX}{hex}");

        let mut keys = load_json_map::<KeyRecord>(&self.path);
        keys.insert(
            key.clone(),
            KeyRecord {
                name: name.to_string(),
                tier,
                created: Utc::now().to_rfc3339(),
                active: true,
                revoked_at: None,
            },
        );
        save_json_map(&self.path, &keys)
            .map_err(|e| ServerError::internal(format!("could not save keys file: {e}")))?;
        self.invalidate();
        Ok(key)
    }

    /// Flip a key inactive. The record is retained. Returns whether the key
    /// existed.
    pub fn revoke(&self, key: &str) -> Result<bool> {
        let mut keys = load_json_map::<KeyRecord>(&self.path);
        let Some(record) = keys.get_mut(key) else { return Ok(false) };
        record.active = false;
        record.revoked_at = Some(Utc::now().to_rfc3339());
        save_json_map(&self.path, &keys)
            .map_err(|e| ServerError::internal(format!("could not save keys file: {e}")))?;
        self.invalidate();
        Ok(true)
    }

    /// Masked listing: 16-char prefixes only.
    pub fn list(&self) -> Vec<MaskedKey> {
        let keys = load_json_map::<KeyRecord>(&self.path);
        let mut out: Vec<MaskedKey> = keys
            .into_iter()
            .map(|(k, v)| MaskedKey {
                prefix: format!("{}...", &k[..k.len().min(16)]),
                name: v.name,
                tier: v.tier,
                active: v.active,
                created: v.created,
            })
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created));
        out
    }

    /// Look up a key record, serving from the 60-second cache.
    pub fn lookup(&self, key: &str) -> Option<KeyRecord> {
        let mut cache = self.cache.lock().ok()?;
        let expired = cache.loaded_at.map_or(true, |t| t.elapsed() > KEYS_CACHE_TTL);
        if expired {
            cache.keys = load_json_map(&self.path);
            cache.loaded_at = Some(Instant::now());
        }
        cache.keys.get(key).cloned()
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.loaded_at = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Quota ledger
// ---------------------------------------------------------------------------

struct LedgerInner {
    counts: HashMap<String, u64>,
    month: String,
    last_flush: Instant,
}

pub struct QuotaLedger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

impl QuotaLedger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(LedgerInner {
                counts: HashMap::new(),
                month: current_month(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Check the caller's monthly quota and, if allowed, count this call.
    /// Returns `(allowed, count, limit)` where `count` is the value after a
    /// successful increment, or the unchanged value at the limit.
    pub fn check_and_increment(&self, identifier: &str, tier: KeyTier) -> (bool, u64, u64) {
        let limit = tier_limit(tier);
        let month = current_month();

        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return (true, 0, limit),
        };

        if inner.month != month {
            inner.counts.clear();
            inner.month = month.clone();
        }

        if !inner.counts.contains_key(identifier) {
            let disk = load_json_map::<UsageEntry>(&self.path);
            let count = disk
                .get(identifier)
                .filter(|e| e.month == month)
                .map(|e| e.count)
                .unwrap_or(0);
            inner.counts.insert(identifier.to_string(), count);
        }

        let count = inner.counts[identifier];
        if count >= limit {
            return (false, count, limit);
        }

        inner.counts.insert(identifier.to_string(), count + 1);

        if inner.last_flush.elapsed() > USAGE_FLUSH_INTERVAL {
            inner.last_flush = Instant::now();
            let counts = inner.counts.clone();
            let month = inner.month.clone();
            drop(inner);
            self.flush_map(&counts, &month);
        }

        (true, count + 1, limit)
    }

    /// Persist everything counted so far. Used by the CLI and shutdown path.
    pub fn flush(&self) {
        let (counts, month) = match self.inner.lock() {
            Ok(inner) => (inner.counts.clone(), inner.month.clone()),
            Err(_) => return,
        };
        self.flush_map(&counts, &month);
    }

    /// Last-writer-wins merge into the usage file. Never fails the request.
    fn flush_map(&self, counts: &HashMap<String, u64>, month: &str) {
        let mut disk = load_json_map::<UsageEntry>(&self.path);
        for (identifier, count) in counts {
            disk.insert(
                identifier.clone(),
                UsageEntry { month: month.to_string(), count: *count },
            );
        }
        if let Err(e) = save_json_map(&self.path, &disk) {
            warn!(error = %e, "usage flush failed");
        }
    }

    /// Current-month counters (masked identifiers), for the CLI.
    pub fn usage_stats(&self) -> Vec<(String, u64)> {
        self.flush();
        let month = current_month();
        let disk = load_json_map::<UsageEntry>(&self.path);
        let mut out: Vec<(String, u64)> = disk
            .into_iter()
            .filter(|(_, e)| e.month == month)
            .map(|(k, e)| (format!("{}...", &k[..k.len().min(16)]), e.count))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }
}
