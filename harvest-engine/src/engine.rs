//! Public engine API: wires the Pool Manager, Scheduler, Selector, and Persistence into one
//! `Engine`, consumed by `harvest-app` and (eventually) an HTTP front door outside this crate's
//! scope.

use std::sync::Arc;

use chrono::Utc;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::metrics::Metrics;
use crate::model::{EngineStats, ProxyKey, ProxyNode, SelectorFilter, ValidationOutcome};
use crate::persistence::Persistence;
use crate::pool::PoolManager;
use crate::scheduler::{FetchHandle, Scheduler};
use crate::selector::Selector;

pub struct Engine {
	pool: Arc<PoolManager>,
	scheduler: Arc<Scheduler>,
	selector: Selector,
	persistence: Persistence,
	metrics: Arc<Metrics>,
	config: Config,
}

impl Engine {
	/// Builds the engine, reloading the most recent snapshot if one exists: nodes resume in their
	/// prior tiers with their prior scores and `last_checked`, so the Scheduler can judge urgency
	/// correctly from the very first revalidation sweep.
	pub async fn new(config: Config, registry: &mut Registry) -> Result<Arc<Self>, ConfigError> {
		let metrics = Arc::new(Metrics::new(registry));
		let scorer_params = crate::scorer::ScorerParams {
			alpha: config.score_alpha,
			half_life: config.score_half_life,
			..crate::scorer::ScorerParams::default()
		};
		let (pool, change_rx) = PoolManager::new(config.tier_thresholds.clone(), scorer_params);
		let pool = Arc::new(pool);
		// Change events are consumed opportunistically by the persistence loop via `take_dirty`;
		// the receiver itself only exists to keep the sender side alive without backpressure.
		drop(change_rx);

		let persistence = Persistence::new(&config.snapshot_path, config.snapshot_retention);
		match persistence.load_latest().await {
			Ok(Some(snapshot)) => {
				info!(node_count = snapshot.header.node_count, taken_at = %snapshot.header.taken_at, "restored snapshot");
				pool.load_nodes(snapshot.records).await;
			},
			Ok(None) => info!("no prior snapshot found, starting with empty pools"),
			Err(e) => error!(error = %e, "failed to load any snapshot generation, starting empty"),
		}

		let scheduler = Scheduler::new(config.clone(), Arc::clone(&pool), Arc::clone(&metrics))?;
		let selector = Selector::new(Arc::clone(&pool));

		Ok(Arc::new(Self {
			pool,
			scheduler,
			selector,
			persistence,
			metrics,
			config,
		}))
	}

	/// Runs the scheduler's timers and the periodic persistence loop until `cancel` fires, then
	/// drains in-flight work up to `drain_deadline`.
	pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
		let scheduler_cancel = self.scheduler.cancel_token();
		let forward = {
			let scheduler_cancel = scheduler_cancel.clone();
			let cancel = cancel.clone();
			async move {
				cancel.cancelled().await;
				scheduler_cancel.cancel();
			}
		};

		let scheduler = Arc::clone(&self.scheduler);
		let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });
		let persistence_task = {
			let this = Arc::clone(self);
			let cancel = cancel.clone();
			tokio::spawn(async move { this.run_persistence_loop(cancel).await })
		};

		tokio::select! {
			_ = forward => {},
			_ = scheduler_cancel.cancelled() => {},
		}

		let drain_deadline = self.config.drain_deadline;
		if tokio::time::timeout(drain_deadline, &mut scheduler_task).await.is_err() {
			warn!("scheduler did not stop within drain deadline; aborting remaining in-flight work");
			scheduler_task.abort();
			let _ = scheduler_task.await;
		}
		let _ = persistence_task.await;

		// Final snapshot on the way out so a clean shutdown never loses the last cycle's work.
		self.write_snapshot().await;
	}

	async fn run_persistence_loop(&self, cancel: CancellationToken) {
		let mut timer = tokio::time::interval(self.config.persist_interval);
		timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return,
				_ = timer.tick() => {
					if self.pool.take_dirty() {
						self.write_snapshot().await;
					}
				}
			}
		}
	}

	async fn write_snapshot(&self) {
		let nodes = self.pool.all_nodes().await;
		match self.persistence.save(nodes, Utc::now()).await {
			Ok(path) => {
				self.metrics.record_snapshot_write(true);
				info!(path = %path.display(), "wrote snapshot");
			},
			Err(e) => {
				self.metrics.record_snapshot_write(false);
				// Persistence write failures retry next tick; the engine never blocks on them.
				warn!(error = %e, "snapshot write failed, will retry next tick");
			},
		}
	}

	/// Serves a selection request against the current pool view.
	pub async fn get_proxy(&self, filter: SelectorFilter) -> Option<ProxyNode> {
		self.selector.get(&filter).await
	}

	/// Feeds one externally observed outcome into the Scorer as though it were an internal
	/// validation, affecting `consecutive_failures` symmetrically with internal ones.
	pub async fn report_outcome(&self, key: ProxyKey, outcome: ValidationOutcome) {
		self.scheduler.report_outcome(key, outcome).await;
	}

	/// Requests a fetch cycle, merged with any already in flight.
	pub async fn trigger_fetch(self: &Arc<Self>) -> FetchHandle {
		self.scheduler.trigger_fetch().await
	}

	pub async fn stats(&self) -> EngineStats {
		let per_tier_count = self.pool.tier_counts().await;
		self.metrics.set_tier_sizes(&per_tier_count);

		let nodes = self.pool.all_nodes().await;
		let avg_score = if nodes.is_empty() { 0.0 } else { nodes.iter().map(|n| n.score).sum::<f64>() / nodes.len() as f64 };

		EngineStats {
			per_tier_count,
			avg_score,
			fetch_cycles_completed: self.scheduler.fetch_cycles_completed(),
			validation_success_rate_1h: self.scheduler.validation_success_rate_1h().await,
			adapter_success_rate: self.scheduler.adapter_success_rate().await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config(snapshot_dir: &std::path::Path) -> Config {
		crate::config::parse_config(&format!(
			"test_endpoints: [\"http://echo.example/ip\"]\nsnapshot_path: \"{}/pool.json\"\nfetch_interval_secs: 3600\nreval_interval_secs: 3600\nretain_interval_secs: 3600\npersist_interval_secs: 3600\n",
			snapshot_dir.display()
		))
		.unwrap()
	}

	#[tokio::test]
	async fn fresh_engine_has_empty_stats() {
		let dir = tempfile::tempdir().unwrap();
		let mut registry = Registry::default();
		let engine = Engine::new(test_config(dir.path()), &mut registry).await.unwrap();
		let stats = engine.stats().await;
		assert_eq!(stats.fetch_cycles_completed, 0);
		assert_eq!(stats.avg_score, 0.0);
		assert!(engine.get_proxy(SelectorFilter::default()).await.is_none());
	}

	#[tokio::test]
	async fn report_outcome_feeds_the_pool() {
		let dir = tempfile::tempdir().unwrap();
		let mut registry = Registry::default();
		let engine = Engine::new(test_config(dir.path()), &mut registry).await.unwrap();
		let key = ProxyKey::new("1.2.3.4", 8080, crate::model::Protocol::Http);
		engine.pool.upsert_candidate(ProxyNode::new_candidate(key.clone(), "test", None, Utc::now())).await;

		let outcome = ValidationOutcome::success(150, crate::model::Anonymity::Elite, true, Utc::now());
		engine.report_outcome(key.clone(), outcome).await;

		let node = engine.pool.get(&key).await.unwrap();
		assert_eq!(node.pool, crate::model::Tier::Cold);
		let stats = engine.stats().await;
		assert_eq!(stats.validation_success_rate_1h, 1.0);
	}

	#[tokio::test]
	async fn snapshot_round_trips_through_engine_restart() {
		let dir = tempfile::tempdir().unwrap();
		let mut registry = Registry::default();
		let engine = Engine::new(test_config(dir.path()), &mut registry).await.unwrap();
		let key = ProxyKey::new("9.9.9.9", 1080, crate::model::Protocol::Socks5);
		engine.pool.upsert_candidate(ProxyNode::new_candidate(key.clone(), "test", None, Utc::now())).await;
		engine
			.report_outcome(key.clone(), ValidationOutcome::success(90, crate::model::Anonymity::Anonymous, false, Utc::now()))
			.await;
		engine.write_snapshot().await;

		let mut registry2 = Registry::default();
		let restarted = Engine::new(test_config(dir.path()), &mut registry2).await.unwrap();
		let restored = restarted.pool.get(&key).await.unwrap();
		assert_eq!(restored.pool, crate::model::Tier::Cold);
	}
}
