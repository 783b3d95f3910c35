//! Scheduler: the single cooperative driver owning the fetch cycle, revalidation sweep, and
//! retention sweep timers. Dispatches into the bounded worker pools owned by the Prescanner and
//! Validator; never does I/O itself. Adapters are stateless — the per-source rate-limit/refetch
//! bookkeeping lives here, not in the adapters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::SourceAdapter;
use crate::config::Config;
use crate::dedup::dedup_candidates;
use crate::error::SourceErrorKind;
use crate::metrics::Metrics;
use crate::model::{ProxyNode, Tier, ValidationOutcome};
use crate::pool::PoolManager;
use crate::prescan::Prescanner;
use crate::validator::Validator;

/// How long a validation-outcome timestamp is retained for `validation_success_rate_1h`.
const VALIDATION_HISTORY_WINDOW: chrono::Duration = chrono::Duration::hours(1);

/// Bound on how many freshly deduplicated candidates are admitted to one fetch cycle's
/// validation pass. Beyond this, the oldest `first_seen` candidates are evicted first, never the
/// newly arrived.
const CANDIDATE_QUEUE_CAP: usize = 5000;
/// Rolling window (in cycles) over which per-adapter success rate is tracked.
const ADAPTER_HISTORY_LEN: usize = 20;

struct SourceRuntime {
	adapter: Box<dyn SourceAdapter>,
	min_refetch_interval: std::time::Duration,
	rate_limit_per_min: u32,
	last_fetch: Mutex<Option<std::time::Instant>>,
	/// Start times of recent fetch attempts, pruned to the trailing 60s. A second, independent
	/// throttle from `min_refetch_interval`/`last_fetch`: this bounds burst rate (e.g. repeated
	/// manual `trigger_fetch` calls), not steady-state cadence.
	recent_attempts: Mutex<VecDeque<std::time::Instant>>,
}

impl SourceRuntime {
	async fn due_for_refetch(&self) -> bool {
		match *self.last_fetch.lock().await {
			None => true,
			Some(last) => last.elapsed() >= self.min_refetch_interval,
		}
	}

	/// Prunes attempts older than 60s, then admits this one only if it keeps the trailing window
	/// at or under `rate_limit_per_min`. Recorded on every attempt, successful or not — a source
	/// that keeps timing out still counts against its own rate limit.
	async fn within_rate_limit(&self) -> bool {
		let window = std::time::Duration::from_secs(60);
		let mut attempts = self.recent_attempts.lock().await;
		let now = std::time::Instant::now();
		while attempts.front().is_some_and(|t| now.duration_since(*t) > window) {
			attempts.pop_front();
		}
		if attempts.len() as u32 >= self.rate_limit_per_min.max(1) {
			return false;
		}
		attempts.push_back(now);
		true
	}
}

pub struct FetchHandle {
	rx: tokio::sync::watch::Receiver<bool>,
}

impl FetchHandle {
	pub async fn wait(mut self) {
		// A watch starts at `false`; wait until the fetch marks it `true`, or the sender drops.
		while !*self.rx.borrow() {
			if self.rx.changed().await.is_err() {
				break;
			}
		}
	}
}

pub struct Scheduler {
	config: Config,
	pool: Arc<PoolManager>,
	sources: Vec<SourceRuntime>,
	client: reqwest::Client,
	prescanner: Option<Prescanner>,
	validator: Validator,
	fetch_in_flight: Mutex<Option<tokio::sync::watch::Receiver<bool>>>,
	fetch_cycles_completed: AtomicU64,
	adapter_history: Mutex<HashMap<String, VecDeque<bool>>>,
	validation_history: Mutex<VecDeque<(chrono::DateTime<Utc>, bool)>>,
	metrics: Arc<Metrics>,
	cancel: CancellationToken,
}

impl Scheduler {
	pub fn new(
		config: Config,
		pool: Arc<PoolManager>,
		metrics: Arc<Metrics>,
	) -> Result<Arc<Self>, crate::error::ConfigError> {
		if config.test_endpoints.is_empty() {
			return Err(crate::error::ConfigError::Invalid(
				"validator has zero test endpoints configured".into(),
			));
		}

		// Spec: adapters follow at most 1 redirect, then treat anything further as an
		// adapter-level error rather than silently chasing a redirect chain.
		let client = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::limited(1))
			.build()
			.map_err(|e| crate::error::ConfigError::Invalid(format!("failed to build http client: {e}")))?;

		let mut sources = Vec::with_capacity(config.sources.len());
		for source_cfg in &config.sources {
			let adapter = crate::adapters::build_adapter(source_cfg)?;
			sources.push(SourceRuntime {
				adapter,
				min_refetch_interval: source_cfg.min_refetch_interval,
				rate_limit_per_min: source_cfg.rate_limit_per_min,
				last_fetch: Mutex::new(None),
				recent_attempts: Mutex::new(VecDeque::new()),
			});
		}

		let prescanner = config
			.prescan_enabled
			.then(|| Prescanner::new(config.prescan_concurrency, config.prescan_timeout));
		let validator = Validator::new(config.validator_concurrency, config.validator_timeout, config.test_endpoints.clone());

		Ok(Arc::new(Self {
			config,
			pool,
			sources,
			client,
			prescanner,
			validator,
			fetch_in_flight: Mutex::new(None),
			fetch_cycles_completed: AtomicU64::new(0),
			adapter_history: Mutex::new(HashMap::new()),
			validation_history: Mutex::new(VecDeque::new()),
			metrics,
			cancel: CancellationToken::new(),
		}))
	}

	/// The token external callers (`harvest-app`'s shutdown handler) cancel to stop the
	/// scheduler; cooperative cancellation then propagates to the Prescanner/Validator's current
	/// I/O boundary.
	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Runs the three periodic activities until the scheduler's cancellation token fires, then
	/// returns once any in-flight fetch observes the cancellation at its next I/O boundary.
	pub async fn run(self: Arc<Self>) {
		let cancel = self.cancel.clone();
		let mut fetch_timer = tokio::time::interval(self.config.fetch_interval);
		let mut reval_timer = tokio::time::interval(self.config.reval_interval);
		let mut retain_timer = tokio::time::interval(self.config.retain_interval);
		fetch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		reval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		retain_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					info!("scheduler stopping: shutdown signaled");
					break;
				}
				_ = fetch_timer.tick() => {
					self.trigger_fetch().await.wait().await;
				}
				_ = reval_timer.tick() => {
					self.run_revalidation_sweep().await;
				}
				_ = retain_timer.tick() => {
					let dropped = self.pool.retention_sweep(Utc::now(), self.config.retention_horizon_chrono()).await;
					if dropped > 0 {
						info!(dropped, "retention sweep dropped expired blacklist entries");
					}
				}
			}
		}
	}

	/// Triggers a fetch cycle, merging with any already in flight so concurrent callers never
	/// cause two overlapping fetches.
	pub async fn trigger_fetch(self: &Arc<Self>) -> FetchHandle {
		let mut guard = self.fetch_in_flight.lock().await;
		if let Some(rx) = guard.as_ref() {
			if !*rx.borrow() {
				return FetchHandle { rx: rx.clone() };
			}
		}
		let (tx, rx) = tokio::sync::watch::channel(false);
		*guard = Some(rx.clone());
		drop(guard);

		let this = Arc::clone(self);
		tokio::spawn(async move {
			this.run_fetch_cycle().await;
			let _ = tx.send(true);
		});
		FetchHandle { rx }
	}

	/// Cooperative cancellation: checked before dispatch, between the fetch and validate stages,
	/// and between candidates, so a shutdown signaled mid-cycle stops dispatching new I/O at the
	/// next boundary rather than only once the whole cycle (or the engine's drain deadline)
	/// elapses.
	async fn run_fetch_cycle(self: &Arc<Self>) {
		if self.cancel.is_cancelled() {
			return;
		}

		// Spec: invoke all source adapters in parallel, one task per source (small, <=16), each
		// racing its own per-source timeout against cancellation independently rather than paying
		// for N sources sequentially.
		let mut tasks = Vec::with_capacity(self.sources.len());
		for idx in 0..self.sources.len() {
			let this = Arc::clone(self);
			tasks.push(tokio::spawn(async move { this.fetch_one_source(idx).await }));
		}
		let mut all_candidates = Vec::new();
		for task in tasks {
			if let Ok(Some(nodes)) = task.await {
				all_candidates.extend(nodes);
			}
		}
		if self.cancel.is_cancelled() {
			return;
		}

		let deduped = dedup_candidates(all_candidates);
		let admitted = evict_oldest_if_over_capacity(deduped, CANDIDATE_QUEUE_CAP);

		let candidates = match &self.prescanner {
			Some(p) => p.filter(admitted, &self.cancel).await,
			None => admitted,
		};
		if self.cancel.is_cancelled() {
			return;
		}

		// Spec §4.4/§5: the Validator gates actual concurrency via its own semaphore (default 50);
		// dispatching every candidate as its own task lets that semaphore do its job instead of
		// serializing validations one at a time.
		let mut validations = Vec::with_capacity(candidates.len());
		for candidate in candidates {
			if self.cancel.is_cancelled() {
				break;
			}
			let this = Arc::clone(self);
			validations.push(tokio::spawn(async move { this.validate_and_record(candidate).await }));
		}
		for task in validations {
			let _ = task.await;
		}

		self.fetch_cycles_completed.fetch_add(1, Ordering::Relaxed);
		self.metrics.record_fetch_cycle();
	}

	/// Fetches one source, honoring both the refetch cadence and the independent per-minute rate
	/// limit. Returns `None` (no candidates, no adapter invoked at all) when skipped, cancelled, or
	/// failed.
	async fn fetch_one_source(&self, idx: usize) -> Option<Vec<ProxyNode>> {
		let source = &self.sources[idx];
		if self.cancel.is_cancelled() {
			return None;
		}
		if !source.due_for_refetch().await || !source.within_rate_limit().await {
			return None;
		}

		let result = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return None,
			r = tokio::time::timeout(
				self.config.adapter_timeout,
				source.adapter.fetch(&self.client, self.config.adapter_timeout),
			) => r,
		};

		let name = source.adapter.name().to_string();
		let nodes = match result {
			Ok(Ok(nodes)) => {
				self.record_adapter_outcome(&name, true).await;
				self.metrics.record_adapter_fetch(&name, true);
				Some(nodes)
			},
			Ok(Err(e)) => {
				warn!(source = %name, kind = ?e.kind, "adapter fetch failed");
				self.record_adapter_outcome(&name, false).await;
				self.metrics.record_adapter_fetch(&name, false);
				None
			},
			Err(_) => {
				warn!(source = %name, kind = ?SourceErrorKind::Unreachable, "adapter fetch timed out");
				self.record_adapter_outcome(&name, false).await;
				self.metrics.record_adapter_fetch(&name, false);
				None
			},
		};
		*source.last_fetch.lock().await = Some(std::time::Instant::now());
		nodes
	}

	async fn record_adapter_outcome(&self, source: &str, produced_results: bool) {
		let mut history = self.adapter_history.lock().await;
		let entry = history.entry(source.to_string()).or_default();
		if entry.len() == ADAPTER_HISTORY_LEN {
			entry.pop_front();
		}
		entry.push_back(produced_results);
	}

	pub async fn adapter_success_rate(&self) -> std::collections::BTreeMap<String, f64> {
		let history = self.adapter_history.lock().await;
		history
			.iter()
			.map(|(name, outcomes)| {
				let ok = outcomes.iter().filter(|o| **o).count();
				(name.clone(), ok as f64 / outcomes.len().max(1) as f64)
			})
			.collect()
	}

	async fn validate_and_record(&self, candidate: ProxyNode) {
		let key = candidate.key.clone();
		self.pool.upsert_candidate(candidate).await;
		let Some(node) = self.pool.get(&key).await else { return };
		let outcome = self.validator.validate(&node).await;
		self.record_validation_event(outcome.ok).await;
		if let Err(e) = self.pool.record_outcome(&key, outcome, Utc::now()).await {
			warn!(%key, error = %e, "pool invariant violated recording validation outcome");
		}
	}

	/// Revalidates nodes whose `last_checked` is overdue for their tier's cadence.
	async fn run_revalidation_sweep(&self) {
		let now = Utc::now();
		for tier in [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Blacklist] {
			if self.cancel.is_cancelled() {
				return;
			}
			let interval = revalidation_interval(tier);
			let nodes = self.pool.nodes_in_tier(tier).await;
			for node in nodes {
				if self.cancel.is_cancelled() {
					return;
				}
				let overdue = node.last_checked.is_none_or(|t| now - t >= interval);
				if !overdue {
					continue;
				}
				let outcome = self.validator.validate(&node).await;
				self.record_validation_event(outcome.ok).await;
				if let Err(e) = self.pool.record_outcome(&node.key, outcome, Utc::now()).await {
					warn!(key = %node.key, error = %e, "pool invariant violated during revalidation");
				}
			}
		}
	}

	/// Records one validation outcome (internal or externally reported; `report_outcome` affects
	/// history symmetrically) for the rolling hour used by `validation_success_rate_1h`.
	async fn record_validation_event(&self, ok: bool) {
		self.metrics.record_validation(ok);
		let now = Utc::now();
		let mut history = self.validation_history.lock().await;
		history.push_back((now, ok));
		while history.front().is_some_and(|(t, _)| now - *t > VALIDATION_HISTORY_WINDOW) {
			history.pop_front();
		}
	}

	pub async fn validation_success_rate_1h(&self) -> f64 {
		let now = Utc::now();
		let mut history = self.validation_history.lock().await;
		while history.front().is_some_and(|(t, _)| now - *t > VALIDATION_HISTORY_WINDOW) {
			history.pop_front();
		}
		if history.is_empty() {
			return 0.0;
		}
		let ok = history.iter().filter(|(_, ok)| *ok).count();
		ok as f64 / history.len() as f64
	}

	pub fn fetch_cycles_completed(&self) -> u64 {
		self.fetch_cycles_completed.load(Ordering::Relaxed)
	}

	pub async fn report_outcome(&self, key: crate::model::ProxyKey, outcome: ValidationOutcome) {
		self.record_validation_event(outcome.ok).await;
		if let Err(e) = self.pool.record_outcome(&key, outcome, Utc::now()).await {
			warn!(%key, error = %e, "pool invariant violated recording external outcome");
		}
	}
}

fn revalidation_interval(tier: Tier) -> chrono::Duration {
	match tier {
		Tier::Hot => chrono::Duration::minutes(2),
		Tier::Warm => chrono::Duration::minutes(10),
		Tier::Cold | Tier::Pending => chrono::Duration::hours(1),
		Tier::Blacklist => chrono::Duration::hours(24),
	}
}

/// Keeps the newest `cap` candidates by `first_seen`, dropping the oldest first. A no-op when
/// under capacity.
fn evict_oldest_if_over_capacity(mut candidates: Vec<ProxyNode>, cap: usize) -> Vec<ProxyNode> {
	if candidates.len() <= cap {
		return candidates;
	}
	candidates.sort_by_key(|n| std::cmp::Reverse(n.first_seen));
	candidates.truncate(cap);
	candidates
}

impl Config {
	fn retention_horizon_chrono(&self) -> chrono::Duration {
		chrono::Duration::from_std(self.retention_horizon).unwrap_or(chrono::Duration::days(7))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Protocol, ProxyKey};

	fn node(host: &str, seen_secs_ago: i64) -> ProxyNode {
		let mut n = ProxyNode::new_candidate(
			ProxyKey::new(host, 8080, Protocol::Http),
			"test",
			None,
			Utc::now() - chrono::Duration::seconds(seen_secs_ago),
		);
		n.first_seen = Utc::now() - chrono::Duration::seconds(seen_secs_ago);
		n
	}

	#[test]
	fn eviction_keeps_newest_under_capacity() {
		let candidates = vec![node("1.1.1.1", 100), node("2.2.2.2", 1), node("3.3.3.3", 50)];
		let kept = evict_oldest_if_over_capacity(candidates, 2);
		assert_eq!(kept.len(), 2);
		assert!(kept.iter().any(|n| n.key.host == "2.2.2.2"));
		assert!(kept.iter().any(|n| n.key.host == "3.3.3.3"));
		assert!(!kept.iter().any(|n| n.key.host == "1.1.1.1"));
	}

	#[test]
	fn eviction_is_noop_under_capacity() {
		let candidates = vec![node("1.1.1.1", 10)];
		let kept = evict_oldest_if_over_capacity(candidates, 5);
		assert_eq!(kept.len(), 1);
	}

	#[test]
	fn revalidation_intervals_match_spec_table() {
		assert_eq!(revalidation_interval(Tier::Hot), chrono::Duration::minutes(2));
		assert_eq!(revalidation_interval(Tier::Warm), chrono::Duration::minutes(10));
		assert_eq!(revalidation_interval(Tier::Cold), chrono::Duration::hours(1));
		assert_eq!(revalidation_interval(Tier::Blacklist), chrono::Duration::hours(24));
	}

	struct NullAdapter;

	#[async_trait::async_trait]
	impl SourceAdapter for NullAdapter {
		fn name(&self) -> &str {
			"null"
		}

		async fn fetch(&self, _client: &reqwest::Client, _timeout: std::time::Duration) -> crate::adapters::FetchResult {
			Ok(Vec::new())
		}
	}

	fn source_runtime(rate_limit_per_min: u32) -> SourceRuntime {
		SourceRuntime {
			adapter: Box::new(NullAdapter),
			min_refetch_interval: std::time::Duration::from_secs(0),
			rate_limit_per_min,
			last_fetch: Mutex::new(None),
			recent_attempts: Mutex::new(VecDeque::new()),
		}
	}

	#[tokio::test]
	async fn rate_limit_admits_up_to_the_configured_burst_then_blocks() {
		let source = source_runtime(2);
		assert!(source.within_rate_limit().await, "first attempt within the window must be admitted");
		assert!(source.within_rate_limit().await, "second attempt within the limit must be admitted");
		assert!(!source.within_rate_limit().await, "third attempt within the same 60s window must be rate-limited");
	}

	#[tokio::test]
	async fn rate_limit_is_independent_of_min_refetch_interval() {
		// min_refetch_interval is 0 (always due), but the rate limit still caps attempts: the two
		// throttles are enforced separately, not as one merged check.
		let source = source_runtime(1);
		assert!(source.due_for_refetch().await);
		assert!(source.within_rate_limit().await);
		assert!(source.due_for_refetch().await, "refetch cadence alone would allow another attempt immediately");
		assert!(!source.within_rate_limit().await, "but the rate limit still blocks it");
	}
}
