//! Checkpointed fan-out.
//!
//! Same semantics as [`crate::fanout::parallel_llm_query`] plus crash
//! recovery: progress snapshots are written every `interval` completions
//! and at termination, and a run that finds a matching snapshot on disk
//! skips the chunks it already completed.
//!
//! Resumption requires byte-identical chunk boundaries: the snapshot only
//! records indices, so callers must supply the same input list in the
//! same order across runs. A snapshot whose `chunk_count` differs from
//! the current input length is ignored. A corrupt snapshot is deleted
//! silently and the run starts fresh.
//!
//! Snapshot writes are atomic (temp file + rename). Results that already
//! arrived are flushed to the snapshot before a budget/depth abort
//! propagates, so they are never recomputed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RlmError;
use crate::invoker::{InvokeOptions, Invoker};
use crate::session::SessionStats;

/// On-disk progress snapshot for one fan-out.
///
/// Invariant: `completed_indices` contains exactly the indices `i` for
/// which `partial_results[i]` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub chunk_count: usize,
    pub completed_indices: Vec<usize>,
    pub partial_results: Vec<Option<String>>,
    pub session_snapshot: SessionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Load a snapshot if one exists and matches `chunk_count`; delete it when
/// corrupt or mismatched.
fn load_checkpoint(path: &Path, chunk_count: usize) -> Option<CheckpointRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<CheckpointRecord>(&raw) {
        Ok(record) if record.chunk_count == chunk_count => Some(record),
        Ok(_) => None,
        Err(_) => {
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

/// Atomic write: temp file in the same directory, then rename over.
fn write_checkpoint(path: &Path, record: &CheckpointRecord) -> Result<(), RlmError> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| RlmError::Storage(format!("checkpoint serialize: {}", e)))?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| RlmError::Storage(format!("checkpoint write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| RlmError::Storage(format!("checkpoint rename {}: {}", path.display(), e)))
}

/// Fan out over `pairs` with bounded concurrency and periodic snapshots.
///
/// Without a checkpoint path this degrades to plain ordered fan-out. With
/// one, a prior snapshot's completed slots are reused verbatim and the
/// snapshot file is deleted once every chunk has completed.
pub async fn checkpointed_llm_query(
    invoker: &Invoker,
    pairs: Vec<(String, String)>,
    max_workers: usize,
    checkpoint_path: Option<&Path>,
    interval: usize,
) -> Result<Vec<String>, RlmError> {
    let chunk_count = pairs.len();
    let interval = interval.max(1);
    let workers = max_workers.max(1);

    let mut slots: Vec<Option<String>> = vec![None; chunk_count];
    let mut checkpoint_id = Uuid::new_v4().to_string();
    let mut created_at = Utc::now();

    if let Some(path) = checkpoint_path {
        if let Some(prior) = load_checkpoint(path, chunk_count) {
            eprintln!(
                "[rlm] resuming checkpoint {} ({}/{} chunks done)",
                prior.checkpoint_id,
                prior.completed_indices.len(),
                chunk_count
            );
            checkpoint_id = prior.checkpoint_id;
            created_at = prior.created_at;
            for index in prior.completed_indices {
                if let Some(result) = prior.partial_results.get(index).cloned().flatten() {
                    slots[index] = Some(result);
                }
            }
        }
    }

    let pending: Vec<(usize, String, String)> = pairs
        .into_iter()
        .enumerate()
        .filter(|(i, _)| slots[*i].is_none())
        .map(|(i, (prompt, context))| (i, prompt, context))
        .collect();

    let snapshot = |slots: &[Option<String>]| CheckpointRecord {
        checkpoint_id: checkpoint_id.clone(),
        chunk_count,
        completed_indices: slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect(),
        partial_results: slots.to_vec(),
        session_snapshot: invoker.session().stats(),
        created_at,
        updated_at: Utc::now(),
    };

    // buffer_unordered rather than buffered: completions feed the snapshot
    // as they arrive, and the index carried with each result restores
    // input order in the slot vector.
    let mut in_flight = stream::iter(pending.into_iter().map(|(index, prompt, context)| {
        async move {
            let result = invoker
                .invoke_with(
                    &prompt,
                    InvokeOptions {
                        context: Some(context),
                        ..Default::default()
                    },
                )
                .await;
            (index, result)
        }
    }))
    .buffer_unordered(workers);

    let mut since_snapshot = 0usize;
    while let Some((index, result)) = in_flight.next().await {
        match result {
            Ok(text) => {
                slots[index] = Some(text);
                since_snapshot += 1;
                if since_snapshot >= interval {
                    if let Some(path) = checkpoint_path {
                        write_checkpoint(path, &snapshot(&slots))?;
                    }
                    since_snapshot = 0;
                }
            }
            Err(err) => {
                // Abort outstanding work but keep what already returned.
                drop(in_flight);
                if let Some(path) = checkpoint_path {
                    write_checkpoint(path, &snapshot(&slots))?;
                }
                return Err(err);
            }
        }
    }

    if let Some(path) = checkpoint_path {
        let _ = std::fs::remove_file(path);
    }

    Ok(slots.into_iter().map(|s| s.unwrap_or_default()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_record_roundtrip() {
        let session = crate::session::RlmSession::new(crate::session::DEFAULT_MODEL, 5.0, 100, 3);
        let record = CheckpointRecord {
            checkpoint_id: "cp-1".to_string(),
            chunk_count: 3,
            completed_indices: vec![0, 2],
            partial_results: vec![Some("a".into()), None, Some("c".into())],
            session_snapshot: session.stats(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: CheckpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.completed_indices, vec![0, 2]);
        assert_eq!(parsed.partial_results[1], None);
        // Invariant: completed indices are exactly the set slots.
        for (i, slot) in parsed.partial_results.iter().enumerate() {
            assert_eq!(slot.is_some(), parsed.completed_indices.contains(&i));
        }
    }

    #[test]
    fn test_load_checkpoint_rejects_mismatched_count() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cp.json");
        let session = crate::session::RlmSession::new(crate::session::DEFAULT_MODEL, 5.0, 100, 3);
        let record = CheckpointRecord {
            checkpoint_id: "cp-1".to_string(),
            chunk_count: 3,
            completed_indices: vec![],
            partial_results: vec![None, None, None],
            session_snapshot: session.stats(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        write_checkpoint(&path, &record).unwrap();

        assert!(load_checkpoint(&path, 3).is_some());
        assert!(load_checkpoint(&path, 4).is_none());
        // Mismatch does not delete the file; only corruption does.
        assert!(path.exists());

        std::fs::write(&path, "{broken").unwrap();
        assert!(load_checkpoint(&path, 3).is_none());
        assert!(!path.exists());
    }
}
