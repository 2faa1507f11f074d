//! Persistent threat pattern store.
//!
//! Tracks IOC observations and detected attack patterns across runs so
//! recurring threats can be recognized. Two file namespaces live in one
//! directory:
//!
//! - `ioc_<hash>.json` — per-IOC observation history
//! - `attack_patterns.json` — single append-only patterns log
//!
//! Writes are read-modify-write and assume a single writer; concurrent
//! writers to the same IOC file may lose an observation (documented
//! limitation). Records older than the retention window are pruned on the
//! next write to that file — retention is lazy, no background task.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::security::Severity;

/// A single sighting of an IOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatObservation {
    pub timestamp: DateTime<Utc>,
    pub ioc: String,
    pub ioc_type: String,
    /// Free-form context (alert type, counts, source workflow).
    pub context: BTreeMap<String, serde_json::Value>,
    pub severity: String,
}

/// On-disk history for one IOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocHistory {
    pub ioc: String,
    pub ioc_type: String,
    pub observations: Vec<ThreatObservation>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub observation_count: usize,
}

/// A detected attack pattern appended to the patterns log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackPattern {
    pub pattern_type: String,
    pub description: String,
    pub mitre_techniques: Vec<String>,
    pub severity: Severity,
    pub indicators: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Populated by [`ThreatPatternStore::search_similar_patterns`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
}

/// Append-only persistent log of IOC observations and attack patterns
/// with retention-based compaction and similarity search.
pub struct ThreatPatternStore {
    store_dir: PathBuf,
    retention_days: i64,
}

impl ThreatPatternStore {
    pub const DEFAULT_RETENTION_DAYS: i64 = 30;

    pub fn new(store_dir: impl Into<PathBuf>, retention_days: i64) -> std::io::Result<Self> {
        let store_dir = store_dir.into();
        std::fs::create_dir_all(&store_dir)?;
        Ok(ThreatPatternStore {
            store_dir,
            retention_days,
        })
    }

    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("rlm_threat_store")
    }

    /// IOC values can contain arbitrary characters; hash them for the
    /// filename.
    fn ioc_path(&self, ioc: &str, ioc_type: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", ioc_type, ioc));
        let digest = format!("{:x}", hasher.finalize());
        self.store_dir.join(format!("ioc_{}.json", &digest[..16]))
    }

    fn patterns_path(&self) -> PathBuf {
        self.store_dir.join("attack_patterns.json")
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.retention_days)
    }

    /// Record an observation of an IOC, pruning expired history.
    pub fn add_observed_ioc(
        &self,
        ioc: &str,
        ioc_type: &str,
        context: BTreeMap<String, serde_json::Value>,
    ) -> std::io::Result<()> {
        let path = self.ioc_path(ioc, ioc_type);

        let mut observations = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<IocHistory>(&raw)
                .map(|h| h.observations)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let severity = context
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        observations.push(ThreatObservation {
            timestamp: Utc::now(),
            ioc: ioc.to_string(),
            ioc_type: ioc_type.to_string(),
            context,
            severity,
        });

        let cutoff = self.retention_cutoff();
        observations.retain(|obs| obs.timestamp > cutoff);

        let history = IocHistory {
            ioc: ioc.to_string(),
            ioc_type: ioc_type.to_string(),
            first_seen: observations.first().map(|o| o.timestamp),
            last_seen: observations.last().map(|o| o.timestamp),
            observation_count: observations.len(),
            observations,
        };

        std::fs::write(&path, serde_json::to_string_pretty(&history)?)
    }

    /// All observations of an IOC. When the type is unknown, every common
    /// type namespace is checked.
    pub fn get_ioc_history(&self, ioc: &str, ioc_type: Option<&str>) -> Vec<ThreatObservation> {
        let types: Vec<&str> = match ioc_type {
            Some(t) => vec![t],
            None => vec!["ip", "domain", "hash", "email", "url"],
        };

        let mut all = Vec::new();
        for t in types {
            let path = self.ioc_path(ioc, t);
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(history) = serde_json::from_str::<IocHistory>(&raw) {
                    all.extend(history.observations);
                }
            }
        }
        all
    }

    fn load_patterns(&self) -> Vec<AttackPattern> {
        match std::fs::read_to_string(self.patterns_path()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Append a detected attack pattern, pruning expired entries.
    pub fn add_attack_pattern(&self, mut pattern: AttackPattern) -> std::io::Result<()> {
        pattern.timestamp = Utc::now();
        pattern.similarity_score = None;

        let mut patterns = self.load_patterns();
        patterns.push(pattern);

        let cutoff = self.retention_cutoff();
        patterns.retain(|p| p.timestamp > cutoff);

        std::fs::write(
            self.patterns_path(),
            serde_json::to_string_pretty(&patterns)?,
        )
    }

    /// Historical patterns similar to `current`, ranked descending.
    ///
    /// Similarity is the Jaccard overlap of MITRE technique sets, with a
    /// +0.2 bonus (capped at 1.0) when the pattern types match; results
    /// below `min_similarity` are dropped.
    pub fn search_similar_patterns(
        &self,
        current: &AttackPattern,
        min_similarity: f64,
    ) -> Vec<AttackPattern> {
        let current_techniques: std::collections::BTreeSet<&String> =
            current.mitre_techniques.iter().collect();

        let mut similar: Vec<AttackPattern> = self
            .load_patterns()
            .into_iter()
            .filter_map(|mut hist| {
                let hist_techniques: std::collections::BTreeSet<&String> =
                    hist.mitre_techniques.iter().collect();

                let mut similarity = if current_techniques.is_empty() || hist_techniques.is_empty()
                {
                    0.0
                } else {
                    let intersection = current_techniques.intersection(&hist_techniques).count();
                    let union = current_techniques.union(&hist_techniques).count();
                    intersection as f64 / union as f64
                };

                if hist.pattern_type == current.pattern_type {
                    similarity = (similarity + 0.2).min(1.0);
                }

                if similarity >= min_similarity {
                    hist.similarity_score = Some((similarity * 1000.0).round() / 1000.0);
                    Some(hist)
                } else {
                    None
                }
            })
            .collect();

        similar.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        similar
    }

    /// Aggregate store statistics.
    pub fn stats(&self) -> ThreatStoreStats {
        let mut unique_iocs = 0usize;
        let mut total_observations = 0usize;

        if let Ok(entries) = std::fs::read_dir(&self.store_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if name.starts_with("ioc_") && name.ends_with(".json") {
                    unique_iocs += 1;
                    if let Ok(raw) = std::fs::read_to_string(entry.path()) {
                        if let Ok(history) = serde_json::from_str::<IocHistory>(&raw) {
                            total_observations += history.observation_count;
                        }
                    }
                }
            }
        }

        ThreatStoreStats {
            unique_iocs,
            total_observations,
            attack_patterns: self.load_patterns().len(),
            retention_days: self.retention_days,
        }
    }

    /// Remove every stored file. Returns the number removed.
    pub fn clear(&self) -> usize {
        clear_json_files(&self.store_dir)
    }
}

fn clear_json_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json")
            && std::fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }
    removed
}

/// Summary counts for the store.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatStoreStats {
    pub unique_iocs: usize,
    pub total_observations: usize,
    pub attack_patterns: usize,
    pub retention_days: i64,
}
