//! Selector: serves `get(filter)` against the Pool Manager's current view. Pure in-memory read,
//! no I/O — tier fallback Hot→Warm→Cold, then the Scorer's
//! tie-break ordering within the chosen tier.

use std::sync::Arc;

use crate::model::{ProxyNode, SelectorFilter, Tier};
use crate::pool::PoolManager;
use crate::scorer::tie_break_key;

pub struct Selector {
	pool: Arc<PoolManager>,
}

impl Selector {
	pub fn new(pool: Arc<PoolManager>) -> Self {
		Self { pool }
	}

	/// Restricts to Hot, falling back to Warm then Cold if the filtered tier is empty.
	/// Never considers Pending or Blacklist — those are not yet, or no longer, servable.
	pub async fn get(&self, filter: &SelectorFilter) -> Option<ProxyNode> {
		for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
			let mut candidates: Vec<ProxyNode> =
				self.pool.nodes_in_tier(tier).await.into_iter().filter(|n| filter.matches(n)).collect();
			if candidates.is_empty() {
				continue;
			}
			candidates.sort_by_key(tie_break_key);
			return candidates.into_iter().next();
		}
		None
	}
}
