//! Scorer: folds a validation outcome into a single time-decayed EMA score.
//! Pure functions over `ProxyNode` fields — no I/O, no shared state — so the Pool Manager can
//! call this inline inside its per-key serialization without any additional locking.

use chrono::{DateTime, Utc};

use crate::model::{Anonymity, ProxyKey, ProxyNode, ValidationOutcome};

const DEFAULT_LATENCY_CEILING_MS: f64 = 5000.0;

#[derive(Debug, Clone, Copy)]
pub struct ScorerParams {
	pub alpha: f64,
	pub half_life: std::time::Duration,
	pub latency_ceiling_ms: f64,
}

impl Default for ScorerParams {
	fn default() -> Self {
		Self {
			alpha: 0.3,
			half_life: std::time::Duration::from_secs(6 * 3600),
			latency_ceiling_ms: DEFAULT_LATENCY_CEILING_MS,
		}
	}
}

impl ScorerParams {
	/// `τ = half_life / ln 2`.
	fn tau_secs(&self) -> f64 {
		self.half_life.as_secs_f64() / std::f64::consts::LN_2
	}
}

fn reward(outcome: &ValidationOutcome, params: &ScorerParams) -> f64 {
	if !outcome.ok {
		return 0.0;
	}
	let latency_ms = outcome.latency_ms.unwrap_or(0) as f64;
	(1.0 - latency_ms / params.latency_ceiling_ms).clamp(0.1, 1.0)
}

/// Applies one outcome to `node`'s score in place, mutating the measurement counters alongside it
/// (`checks_ok ≤ checks_total`, `consecutive_failures` resets on success).
/// `now` drives both time decay and the measurement timestamps, passed in rather than read from
/// the clock so time-decay behavior can be reproduced deterministically in tests.
pub fn apply_outcome(node: &mut ProxyNode, outcome: &ValidationOutcome, params: &ScorerParams, now: DateTime<Utc>) {
	let decayed_prev = decay(node.score, node.last_checked, now, params);
	let r = reward(outcome, params);
	node.score = (params.alpha * r + (1.0 - params.alpha) * decayed_prev).clamp(0.0, 1.0);

	node.checks_total += 1;
	node.last_checked = Some(now);
	if outcome.ok {
		node.checks_ok += 1;
		node.consecutive_failures = 0;
		node.last_successful = Some(now);
		if let Some(latency) = outcome.latency_ms {
			node.response_time_ms = Some(latency);
			node.push_latency_sample(latency);
		}
		if let Some(anon) = outcome.anonymity {
			node.anonymity = anon;
		}
		if let Some(https) = outcome.https_capable {
			node.https_capable = https;
		}
	} else {
		node.consecutive_failures += 1;
	}
}

/// Applies exponential time decay to a previous score before folding in the new reward:
/// `s_prev ← s_prev · exp(-Δt / τ)`. A node with no prior check has nothing to decay.
fn decay(prev_score: f64, last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>, params: &ScorerParams) -> f64 {
	let Some(last_checked) = last_checked else {
		return 0.5; // first measurement: undecayed prior is undefined, treated as neutral
	};
	let dt_secs = (now - last_checked).num_milliseconds().max(0) as f64 / 1000.0;
	prev_score * (-dt_secs / params.tau_secs()).exp()
}

/// Deterministic tie-break ordering used by the Selector: score desc, latency asc,
/// `last_successful` desc, then lexicographic key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TieBreakKey {
	neg_score_bits: std::cmp::Reverse<u64>,
	latency: u32,
	neg_last_successful: std::cmp::Reverse<i64>,
	key: ProxyKey,
}

pub fn tie_break_key(node: &ProxyNode) -> TieBreakKey {
	use std::cmp::Reverse;

	TieBreakKey {
		neg_score_bits: Reverse((node.score.clamp(0.0, 1.0) * 1_000_000.0).round() as u64),
		latency: node.response_time_ms.unwrap_or(u32::MAX),
		neg_last_successful: Reverse(node.last_successful.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN)),
		key: node.key.clone(),
	}
}

pub fn anonymity_satisfies(have: Anonymity, want: Option<Anonymity>) -> bool {
	match want {
		None => true,
		Some(min) => have >= min,
	}
}
