//! Persistence: periodic snapshots of the pool state for crash recovery.
//! Snapshot writes go to a temporary file in the same directory, then an atomic rename swaps it
//! into place — never a partially written file observable under the final name. Older snapshots
//! are retained (default last 10) for manual rollback; on load, corrupt snapshots fall back to
//! the next-older retained one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::model::ProxyNode;

const SNAPSHOT_VERSION: u32 = 1;

/// Header preceding the node records in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
	pub version: u32,
	pub taken_at: DateTime<Utc>,
	pub node_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
	pub header: SnapshotHeader,
	pub records: Vec<ProxyNode>,
}

impl Snapshot {
	fn new(records: Vec<ProxyNode>, taken_at: DateTime<Utc>) -> Self {
		Self {
			header: SnapshotHeader {
				version: SNAPSHOT_VERSION,
				taken_at,
				node_count: records.len(),
			},
			records,
		}
	}
}

/// Owns the on-disk snapshot history for one pool. `snapshot_path` names the logical target
/// (e.g. `./snapshots/pool.json`); actual files are written alongside it as
/// `pool-<unix_millis>.json` so multiple generations can coexist for retention and manual
/// rollback.
pub struct Persistence {
	dir: PathBuf,
	stem: String,
	extension: String,
	retention: usize,
}

impl Persistence {
	pub fn new(snapshot_path: &Path, retention: usize) -> Self {
		let dir = snapshot_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
		let stem = snapshot_path.file_stem().and_then(|s| s.to_str()).unwrap_or("snapshot").to_string();
		let extension = snapshot_path.extension().and_then(|s| s.to_str()).unwrap_or("json").to_string();
		Self { dir, stem, extension, retention: retention.max(1) }
	}

	fn file_name(&self, taken_at: DateTime<Utc>) -> PathBuf {
		self.dir.join(format!("{}-{}.{}", self.stem, taken_at.timestamp_millis(), self.extension))
	}

	/// Writes a new snapshot atomically (temp file + rename), then prunes generations beyond
	/// `retention`. Write failures are the caller's to retry next tick — this just reports them.
	pub async fn save(&self, nodes: Vec<ProxyNode>, taken_at: DateTime<Utc>) -> Result<PathBuf, PersistenceError> {
		tokio::fs::create_dir_all(&self.dir)
			.await
			.map_err(|e| PersistenceError::WriteFailed(format!("create snapshot dir: {e}")))?;

		let snapshot = Snapshot::new(nodes, taken_at);
		let body = serde_json::to_vec_pretty(&snapshot)
			.map_err(|e| PersistenceError::WriteFailed(format!("encode snapshot: {e}")))?;

		let final_path = self.file_name(taken_at);
		let tmp_path = self.dir.join(format!(".{}.tmp", self.stem));
		tokio::fs::write(&tmp_path, &body)
			.await
			.map_err(|e| PersistenceError::WriteFailed(format!("write temp snapshot: {e}")))?;
		tokio::fs::rename(&tmp_path, &final_path)
			.await
			.map_err(|e| PersistenceError::WriteFailed(format!("swap snapshot into place: {e}")))?;

		debug!(path = %final_path.display(), node_count = snapshot.header.node_count, "wrote snapshot");
		self.prune_old_generations().await;
		Ok(final_path)
	}

	/// Lists retained snapshot generations, newest first, by the millisecond timestamp embedded in
	/// the file name (not mtime, so this is deterministic under test).
	async fn list_generations(&self) -> Vec<(i64, PathBuf)> {
		let mut out = Vec::new();
		let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
			return out;
		};
		let prefix = format!("{}-", self.stem);
		let suffix = format!(".{}", self.extension);
		while let Ok(Some(entry)) = entries.next_entry().await {
			let name = entry.file_name();
			let Some(name) = name.to_str() else { continue };
			let Some(mid) = name.strip_prefix(&prefix).and_then(|s| s.strip_suffix(&suffix)) else {
				continue;
			};
			if let Ok(ts) = mid.parse::<i64>() {
				out.push((ts, entry.path()));
			}
		}
		out.sort_by_key(|(ts, _)| std::cmp::Reverse(*ts));
		out
	}

	async fn prune_old_generations(&self) {
		let generations = self.list_generations().await;
		for (_, path) in generations.into_iter().skip(self.retention) {
			if let Err(e) = tokio::fs::remove_file(&path).await {
				warn!(path = %path.display(), error = %e, "failed to prune old snapshot generation");
			}
		}
	}

	/// Loads the most recent valid snapshot generation, falling back to progressively older ones
	/// if a generation is corrupt, falling back to the previous retained snapshot. Returns
	/// `Ok(None)` if no generation exists or all are corrupt — the caller starts empty and logs
	/// loudly.
	pub async fn load_latest(&self) -> Result<Option<Snapshot>, PersistenceError> {
		let generations = self.list_generations().await;
		let mut last_error = None;
		for (_, path) in &generations {
			match self.try_load(path).await {
				Ok(snapshot) => return Ok(Some(snapshot)),
				Err(e) => {
					warn!(path = %path.display(), error = %e, "snapshot generation is corrupt, trying next-older");
					last_error = Some(e);
				},
			}
		}
		match last_error {
			Some(e) if !generations.is_empty() => Err(e),
			_ => Ok(None),
		}
	}

	async fn try_load(&self, path: &Path) -> Result<Snapshot, PersistenceError> {
		let body = tokio::fs::read(path)
			.await
			.map_err(|e| PersistenceError::LoadCorrupt(format!("read {}: {e}", path.display())))?;
		serde_json::from_slice(&body).map_err(|e| PersistenceError::LoadCorrupt(format!("parse {}: {e}", path.display())))
	}
}
