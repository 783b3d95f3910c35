//! Candidate Deduplicator: canonicalizes and merges this cycle's adapter output by
//! `(host, port, protocol)`. Reconciliation against candidates the Pool Manager already knows
//! about happens in `PoolManager::upsert_candidate`, which unions `source` in place without
//! touching measurement state — this module only merges within one cycle's batch.

use std::collections::HashMap;

use chrono::Utc;

use crate::model::ProxyNode;

/// Merges a batch of freshly fetched candidates into one record per key: source sets are unioned
/// and the earliest `first_seen` wins. Idempotent: running it twice on the same input yields the
/// same output, since the merge is associative and order-independent over a `HashMap`.
pub fn dedup_candidates(candidates: Vec<ProxyNode>) -> Vec<ProxyNode> {
	let mut merged: HashMap<crate::model::ProxyKey, ProxyNode> = HashMap::new();
	for candidate in candidates {
		merged
			.entry(candidate.key.clone())
			.and_modify(|existing| merge_sources(existing, &candidate))
			.or_insert(candidate);
	}
	merged.into_values().collect()
}

fn merge_sources(existing: &mut ProxyNode, incoming: &ProxyNode) {
	for s in &incoming.source {
		if !existing.source.contains(s) {
			existing.source.push(s.clone());
		}
	}
	if incoming.first_seen < existing.first_seen {
		existing.first_seen = incoming.first_seen;
	}
}
