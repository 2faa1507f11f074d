//! Disk-backed memoization for model invocations.
//!
//! Two caches share the same file-per-key JSON layout:
//!
//! - **[`QueryCache`]** — general invocation cache keyed by
//!   `SHA-256(prompt|context|model)`, 24-hour default TTL.
//! - **[`SecurityPatternCache`]** — IOC/MITRE analysis cache keyed by
//!   `SHA-256(ioc_type:ioc:analysis_type)`, 7-day default TTL (security
//!   patterns are stable over longer horizons).
//!
//! Expired entries are treated as absent and lazily deleted on read.
//! Corrupt or unparsable files are deleted silently and treated as absent.
//! Hit/miss/tokens-saved statistics accumulate in memory for the life of
//! the process; counters are atomic because fan-out workers probe the
//! cache concurrently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One cached invocation result, stored as a single JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: String,
    /// ISO-8601 creation time.
    pub created_at: DateTime<Utc>,
    /// Tokens the original call consumed; credited to `tokens_saved` on hit.
    pub tokens_saved: u64,
    pub model: String,
    /// First 16 hex chars of the key, for debugging.
    pub prompt_hash: String,
}

/// In-memory cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub tokens_saved: u64,
}

/// Content-addressed, TTL-bounded cache of model invocation results.
pub struct QueryCache {
    cache_dir: PathBuf,
    ttl_hours: i64,
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
}

impl QueryCache {
    /// Open (creating if needed) a cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>, ttl_hours: i64) -> std::io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(QueryCache {
            cache_dir,
            ttl_hours,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        })
    }

    /// Default location under the system temp directory.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("rlm_cache")
    }

    /// Cache key for an invocation: `SHA-256(prompt|context|model)`.
    pub fn key(prompt: &str, context: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update(b"|");
        hasher.update(context.as_bytes());
        hasher.update(b"|");
        hasher.update(model.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key))
    }

    fn expired(&self, created_at: DateTime<Utc>) -> bool {
        Utc::now() - created_at > Duration::hours(self.ttl_hours)
    }

    /// Return the stored result iff present and unexpired; records a hit
    /// or miss either way. Expired and corrupt files are deleted.
    pub fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if !self.expired(entry.created_at) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.tokens_saved
                    .fetch_add(entry.tokens_saved, Ordering::Relaxed);
                Some(entry.result)
            }
            Ok(_) => {
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result, overwriting any existing entry. Write failures are
    /// swallowed: a missing cache entry only costs a future re-invocation.
    pub fn set(&self, key: &str, result: &str, tokens: u64, model: &str) {
        let entry = CacheEntry {
            result: result.to_string(),
            created_at: Utc::now(),
            tokens_saved: tokens,
            model: model.to_string(),
            prompt_hash: key.chars().take(16).collect(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&entry) {
            let _ = std::fs::write(self.path_for(key), json);
        }
    }

    /// Process-lifetime statistics.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
        }
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        remove_matching(&self.cache_dir, |_| true)
    }

    /// Remove entries older than the TTL (and any unreadable files).
    /// Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        remove_matching(&self.cache_dir, |raw| {
            match serde_json::from_str::<CacheEntry>(raw) {
                Ok(entry) => self.expired(entry.created_at),
                Err(_) => true,
            }
        })
    }
}

/// Delete `.json` files in `dir` for which `should_remove(content)` holds.
fn remove_matching(dir: &Path, should_remove: impl Fn(&str) -> bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path).unwrap_or_default();
        if should_remove(&raw) && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

// ═══════════════════════════════════════════════════════════════════════
// Security pattern cache
// ═══════════════════════════════════════════════════════════════════════

/// One cached security analysis, stored as `sec_<key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityCacheEntry {
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ioc: String,
    pub ioc_type: String,
}

/// Long-lived cache for IOC- and MITRE-keyed analyses.
///
/// The same malware hash or attack signature recurs across many alerts;
/// memoizing per-IOC analysis avoids re-paying for identical sub-queries.
pub struct SecurityPatternCache {
    cache_dir: PathBuf,
    ttl_hours: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SecurityPatternCache {
    pub const DEFAULT_TTL_HOURS: i64 = 168;

    pub fn new(cache_dir: impl Into<PathBuf>, ttl_hours: i64) -> std::io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(SecurityPatternCache {
            cache_dir,
            ttl_hours,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("rlm_security_cache")
    }

    fn key(ioc: &str, ioc_type: &str, analysis_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", ioc_type, ioc, analysis_type));
        format!("{:x}", hasher.finalize())
    }

    fn path_for(key: &str, dir: &Path) -> PathBuf {
        dir.join(format!("sec_{}.json", key))
    }

    fn read(&self, key: &str) -> Option<SecurityCacheEntry> {
        let path = Self::path_for(key, &self.cache_dir);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match serde_json::from_str::<SecurityCacheEntry>(&raw) {
            Ok(entry) if Utc::now() - entry.created_at <= Duration::hours(self.ttl_hours) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            _ => {
                let _ = std::fs::remove_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn write(&self, key: &str, ioc: &str, ioc_type: &str, result: serde_json::Value) {
        let entry = SecurityCacheEntry {
            result,
            created_at: Utc::now(),
            ioc: ioc.to_string(),
            ioc_type: ioc_type.to_string(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&entry) {
            let _ = std::fs::write(Self::path_for(key, &self.cache_dir), json);
        }
    }

    /// Cached general analysis for an IOC value.
    pub fn get_ioc_analysis(&self, ioc: &str, ioc_type: &str) -> Option<serde_json::Value> {
        self.read(&Self::key(ioc, ioc_type, "general"))
            .map(|e| e.result)
    }

    /// Store a general analysis for an IOC value.
    pub fn cache_ioc_analysis(&self, ioc: &str, ioc_type: &str, analysis: serde_json::Value) {
        self.write(&Self::key(ioc, ioc_type, "general"), ioc, ioc_type, analysis);
    }

    /// Cached MITRE technique mapping for an alert signature.
    pub fn get_mitre_mapping(&self, alert_signature: &str) -> Option<Vec<String>> {
        self.read(&Self::key(alert_signature, "mitre", "mapping"))
            .and_then(|e| serde_json::from_value(e.result).ok())
    }

    /// Store a MITRE technique mapping for an alert signature.
    pub fn cache_mitre_mapping(&self, alert_signature: &str, techniques: &[String]) {
        self.write(
            &Self::key(alert_signature, "mitre", "mapping"),
            alert_signature,
            "mitre",
            serde_json::json!(techniques),
        );
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            tokens_saved: 0,
        }
    }

    /// Remove every `sec_` entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("sec_")
                && name.ends_with(".json")
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = QueryCache::new(tmp.path(), 24).unwrap();
        let key = QueryCache::key("summarize", "ctx", "model-a");
        assert!(cache.get(&key).is_none());
        cache.set(&key, "the summary", 42, "model-a");
        assert_eq!(cache.get(&key).as_deref(), Some("the summary"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.tokens_saved, 42);
    }

    #[test]
    fn test_key_depends_on_all_parts() {
        let base = QueryCache::key("p", "c", "m");
        assert_ne!(base, QueryCache::key("p2", "c", "m"));
        assert_ne!(base, QueryCache::key("p", "c2", "m"));
        assert_ne!(base, QueryCache::key("p", "c", "m2"));
    }

    #[test]
    fn test_expired_entry_treated_absent_and_deleted() {
        let tmp = TempDir::new().unwrap();
        let cache = QueryCache::new(tmp.path(), 0).unwrap();
        let key = QueryCache::key("p", "c", "m");
        // With a zero-hour TTL any entry older than "now" is expired; write
        // one backdated entry directly.
        let entry = CacheEntry {
            result: "stale".into(),
            created_at: Utc::now() - Duration::hours(1),
            tokens_saved: 1,
            model: "m".into(),
            prompt_hash: key.chars().take(16).collect(),
        };
        let path = tmp.path().join(format!("{}.json", key));
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

        assert!(cache.get(&key).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_deleted_silently() {
        let tmp = TempDir::new().unwrap();
        let cache = QueryCache::new(tmp.path(), 24).unwrap();
        let key = QueryCache::key("p", "c", "m");
        let path = tmp.path().join(format!("{}.json", key));
        std::fs::write(&path, "{not json").unwrap();

        assert!(cache.get(&key).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_expired() {
        let tmp = TempDir::new().unwrap();
        let cache = QueryCache::new(tmp.path(), 24).unwrap();
        cache.set(&QueryCache::key("fresh", "", "m"), "ok", 1, "m");

        let old = CacheEntry {
            result: "old".into(),
            created_at: Utc::now() - Duration::hours(48),
            tokens_saved: 1,
            model: "m".into(),
            prompt_hash: "x".into(),
        };
        std::fs::write(
            tmp.path().join("deadbeef.json"),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.clear(), 1);
    }

    #[test]
    fn test_security_cache_mitre_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = SecurityPatternCache::new(tmp.path(), 168).unwrap();
        assert!(cache.get_mitre_mapping("sig").is_none());
        cache.cache_mitre_mapping("sig", &["T1566".into(), "T1059".into()]);
        assert_eq!(
            cache.get_mitre_mapping("sig").unwrap(),
            vec!["T1566".to_string(), "T1059".to_string()]
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_security_cache_ioc_analysis() {
        let tmp = TempDir::new().unwrap();
        let cache = SecurityPatternCache::new(tmp.path(), 168).unwrap();
        cache.cache_ioc_analysis(
            "10.0.0.1",
            "ip",
            serde_json::json!({"attack_type": "Brute Force"}),
        );
        let hit = cache.get_ioc_analysis("10.0.0.1", "ip").unwrap();
        assert_eq!(hit["attack_type"], "Brute Force");
        // Different type is a different key.
        assert!(cache.get_ioc_analysis("10.0.0.1", "domain").is_none());
    }
}
