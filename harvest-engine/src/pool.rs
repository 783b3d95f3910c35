//! Pool Manager: owns the Pending staging set and the four tiered pools, enforces at-most-one-
//! tier membership, and applies hysteresis on every transition. Deliberately hand-sharded
//! (`Vec<Mutex<HashMap<..>>>`) rather than a `dashmap`/global-singleton map, so shards are
//! constructor-injected and owned by one `PoolManager` per process instead of living behind a
//! global.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::TierThresholds;
use crate::error::{PoolError, ValidationError};
use crate::model::{ProxyKey, ProxyNode, Tier, ValidationOutcome};
use crate::scorer::{self, ScorerParams};

const SHARD_COUNT: usize = 16;

/// Emitted on every tier transition; Persistence (or a test observer) consumes these to decide
/// whether a snapshot tick has anything new to write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
	pub key: ProxyKey,
	pub from: Tier,
	pub to: Tier,
	pub at: DateTime<Utc>,
}

struct Shard {
	nodes: HashMap<ProxyKey, ProxyNode>,
}

pub struct PoolManager {
	shards: Vec<Mutex<Shard>>,
	thresholds: TierThresholds,
	scorer_params: ScorerParams,
	change_tx: tokio::sync::mpsc::UnboundedSender<ChangeEvent>,
	dirty: AtomicBool,
}

fn shard_index(key: &ProxyKey) -> usize {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	key.hash(&mut hasher);
	(hasher.finish() as usize) % SHARD_COUNT
}

impl PoolManager {
	pub fn new(
		thresholds: TierThresholds,
		scorer_params: ScorerParams,
	) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>) {
		let (change_tx, change_rx) = tokio::sync::mpsc::unbounded_channel();
		let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard { nodes: HashMap::new() })).collect();
		(
			Self {
				shards,
				thresholds,
				scorer_params,
				change_tx,
				dirty: AtomicBool::new(false),
			},
			change_rx,
		)
	}

	/// Inserts a deduplicated candidate if its key is unseen; otherwise unions `source` into the
	/// existing record without touching measurement or score. A blacklisted node rediscovered by
	/// an adapter stays blacklisted.
	pub async fn upsert_candidate(&self, candidate: ProxyNode) {
		let idx = shard_index(&candidate.key);
		let mut shard = self.shards[idx].lock().await;
		match shard.nodes.get_mut(&candidate.key) {
			None => {
				shard.nodes.insert(candidate.key.clone(), candidate);
			},
			Some(existing) => {
				for s in &candidate.source {
					if !existing.source.contains(s) {
						existing.source.push(s.clone());
					}
				}
			},
		}
	}

	pub async fn get(&self, key: &ProxyKey) -> Option<ProxyNode> {
		let idx = shard_index(key);
		self.shards[idx].lock().await.nodes.get(key).cloned()
	}

	/// Applies a validation outcome for `key`: recomputes score via the Scorer, then determines
	/// the next tier with hysteresis. All mutation happens under one shard lock, so the score
	/// index and the tier field move atomically from a reader's perspective.
	pub async fn record_outcome(
		&self,
		key: &ProxyKey,
		outcome: ValidationOutcome,
		now: DateTime<Utc>,
	) -> Result<Option<ChangeEvent>, PoolError> {
		let idx = shard_index(key);
		let mut shard = self.shards[idx].lock().await;
		let node = shard
			.nodes
			.get_mut(key)
			.ok_or_else(|| PoolError::InvariantViolated(format!("{key} not found for outcome")))?;

		let banned = matches!(outcome.error, Some(ValidationError::BannedSignal(_)));
		let last_ok = outcome.ok;
		scorer::apply_outcome(node, &outcome, &self.scorer_params, now);

		let from = node.pool;
		let to = next_tier(from, node.score, node.consecutive_failures, banned, last_ok, &self.thresholds);
		if to != from {
			node.pool = to;
			if to == Tier::Blacklist {
				node.score = 0.0;
				node.blacklisted_at = Some(now);
			}
			self.dirty.store(true, Ordering::Relaxed);
			let event = ChangeEvent { key: key.clone(), from, to, at: now };
			let _ = self.change_tx.send(event.clone());
			return Ok(Some(event));
		}
		Ok(None)
	}

	/// All nodes currently in `tier`, across shards — used by the Selector and by `stats()`.
	pub async fn nodes_in_tier(&self, tier: Tier) -> Vec<ProxyNode> {
		let mut out = Vec::new();
		for shard in &self.shards {
			let shard = shard.lock().await;
			out.extend(shard.nodes.values().filter(|n| n.pool == tier).cloned());
		}
		out
	}

	pub async fn all_nodes(&self) -> Vec<ProxyNode> {
		let mut out = Vec::new();
		for shard in &self.shards {
			out.extend(shard.lock().await.nodes.values().cloned());
		}
		out
	}

	/// Restores nodes from a loaded snapshot: prior tiers and scores are preserved
	/// verbatim, nothing is re-validated.
	pub async fn load_nodes(&self, nodes: Vec<ProxyNode>) {
		for node in nodes {
			let idx = shard_index(&node.key);
			self.shards[idx].lock().await.nodes.insert(node.key.clone(), node);
		}
	}

	/// Drops Blacklist entries blacklisted beyond `horizon` ago.
	pub async fn retention_sweep(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> usize {
		let mut dropped = 0;
		for shard in &self.shards {
			let mut shard = shard.lock().await;
			let before = shard.nodes.len();
			shard.nodes.retain(|_, node| {
				!(node.pool == Tier::Blacklist && node.blacklisted_at.is_some_and(|t| now - t > horizon))
			});
			dropped += before - shard.nodes.len();
		}
		if dropped > 0 {
			self.dirty.store(true, Ordering::Relaxed);
		}
		dropped
	}

	/// Whether any tier transition or retention drop has happened since the last call, resetting
	/// the flag. Persistence's periodic tick uses this to skip writing an unchanged snapshot.
	pub fn take_dirty(&self) -> bool {
		self.dirty.swap(false, Ordering::Relaxed)
	}

	pub async fn tier_counts(&self) -> std::collections::BTreeMap<String, usize> {
		let mut counts = std::collections::BTreeMap::new();
		for tier in [Tier::Pending, Tier::Cold, Tier::Warm, Tier::Hot, Tier::Blacklist] {
			counts.insert(format!("{tier:?}").to_lowercase(), self.nodes_in_tier(tier).await.len());
		}
		counts
	}
}

/// Determines the next tier for a node given its freshly scored state. Hysteresis:
/// the table's entry/exit asymmetry lives entirely in `hot_exit` vs `hot_entry` — Warm/Cold use
/// the same boundary for entry and exit since no separate exit value is defined for them.
fn next_tier(
	current: Tier,
	score: f64,
	consecutive_failures: u32,
	banned: bool,
	last_outcome_ok: bool,
	thresholds: &TierThresholds,
) -> Tier {
	if current == Tier::Blacklist {
		// No automatic rehabilitation: exit only via retention sweep.
		return Tier::Blacklist;
	}
	// Blacklist entry condition is "10 consecutive failures" generically, but the Cold row's own
	// exit condition lowers that bar to 5 for a node already sitting in Cold — see DESIGN.md.
	let blacklist_threshold = if current == Tier::Cold { 5 } else { 10 };
	if banned || consecutive_failures >= blacklist_threshold {
		return Tier::Blacklist;
	}

	match current {
		Tier::Pending => {
			if last_outcome_ok {
				Tier::Cold
			} else {
				Tier::Pending
			}
		},
		Tier::Hot => {
			if score < thresholds.hot_exit {
				if score < thresholds.warm_entry { Tier::Cold } else { Tier::Warm }
			} else {
				Tier::Hot
			}
		},
		Tier::Warm => {
			if score >= thresholds.hot_entry {
				Tier::Hot
			} else if score < thresholds.warm_entry {
				Tier::Cold
			} else {
				Tier::Warm
			}
		},
		Tier::Cold => {
			if score >= thresholds.hot_entry {
				Tier::Hot
			} else if score >= thresholds.warm_entry {
				Tier::Warm
			} else {
				Tier::Cold
			}
		},
		Tier::Blacklist => unreachable!("handled above"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Anonymity, Protocol};

	fn key() -> ProxyKey {
		ProxyKey::new("1.2.3.4", 8080, Protocol::Http)
	}

	fn candidate() -> ProxyNode {
		ProxyNode::new_candidate(key(), "test", None, Utc::now())
	}

	#[tokio::test]
	async fn promotes_to_cold_on_first_success() {
		let (pool, _rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
		pool.upsert_candidate(candidate()).await;
		let now = Utc::now();
		let outcome = ValidationOutcome::success(200, Anonymity::Elite, true, now);
		let event = pool.record_outcome(&key(), outcome, now).await.unwrap().unwrap();
		assert_eq!(event.from, Tier::Pending);
		assert_eq!(event.to, Tier::Cold);
	}

	#[tokio::test]
	async fn stays_pending_on_first_failure() {
		let (pool, _rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
		pool.upsert_candidate(candidate()).await;
		let now = Utc::now();
		let outcome = ValidationOutcome::failure(ValidationError::Timeout, now);
		let event = pool.record_outcome(&key(), outcome, now).await.unwrap();
		assert!(event.is_none());
		assert_eq!(pool.get(&key()).await.unwrap().pool, Tier::Pending);
	}

	#[tokio::test]
	async fn banned_signal_blacklists_immediately() {
		let (pool, _rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
		let mut c = candidate();
		c.pool = Tier::Hot;
		c.score = 0.9;
		let key = c.key.clone();
		let idx = shard_index(&key);
		pool.shards[idx].lock().await.nodes.insert(key.clone(), c);

		let now = Utc::now();
		let outcome = ValidationOutcome::failure(ValidationError::BannedSignal("captive portal".into()), now);
		let event = pool.record_outcome(&key, outcome, now).await.unwrap().unwrap();
		assert_eq!(event.to, Tier::Blacklist);
		assert_eq!(pool.get(&key).await.unwrap().score, 0.0);
	}

	#[tokio::test]
	async fn rediscovered_blacklisted_node_stays_blacklisted() {
		let (pool, _rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
		let mut c = candidate();
		c.pool = Tier::Blacklist;
		c.source = vec!["adapter-a".into()];
		pool.upsert_candidate(c).await;

		let mut rediscovered = candidate();
		rediscovered.source = vec!["adapter-b".into()];
		pool.upsert_candidate(rediscovered).await;

		let node = pool.get(&key()).await.unwrap();
		assert_eq!(node.pool, Tier::Blacklist);
		assert_eq!(node.source.len(), 2);
	}

	#[tokio::test]
	async fn retention_sweep_drops_expired_blacklist_entries() {
		let (pool, _rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
		let mut c = candidate();
		c.pool = Tier::Blacklist;
		let now = Utc::now();
		c.blacklisted_at = Some(now - chrono::Duration::days(10));
		pool.upsert_candidate(c).await;

		let dropped = pool.retention_sweep(now, chrono::Duration::days(7)).await;
		assert_eq!(dropped, 1);
		assert!(pool.get(&key()).await.is_none());
	}

	#[test]
	fn hysteresis_keeps_node_in_hot_until_exit_threshold() {
		let thresholds = TierThresholds::default();
		// Drops below hot_entry (0.8) but still above hot_exit (0.7): stays Hot.
		let tier = next_tier(Tier::Hot, 0.75, 0, false, true, &thresholds);
		assert_eq!(tier, Tier::Hot);
		// Drops below hot_exit: leaves Hot.
		let tier = next_tier(Tier::Hot, 0.65, 0, false, true, &thresholds);
		assert_eq!(tier, Tier::Warm);
	}

	#[test]
	fn cold_node_blacklists_at_five_consecutive_failures_not_ten() {
		let thresholds = TierThresholds::default();
		// Score alone would keep it in Cold, but the Cold row's own exit condition blacklists at 5.
		let tier = next_tier(Tier::Cold, 0.2, 5, false, false, &thresholds);
		assert_eq!(tier, Tier::Blacklist);
		let tier = next_tier(Tier::Cold, 0.2, 4, false, false, &thresholds);
		assert_eq!(tier, Tier::Cold);
	}

	#[test]
	fn warm_node_only_blacklists_at_the_generic_ten_failure_threshold() {
		let thresholds = TierThresholds::default();
		// Warm has no per-tier override: 5 consecutive failures alone isn't enough to blacklist,
		// only the score-band exit to Cold (or, separately, reaching the generic 10-failure count).
		let tier = next_tier(Tier::Warm, 0.6, 5, false, false, &thresholds);
		assert_eq!(tier, Tier::Warm);
		let tier = next_tier(Tier::Warm, 0.6, 10, false, false, &thresholds);
		assert_eq!(tier, Tier::Blacklist);
	}
}
