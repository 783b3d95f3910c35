//! Ambient metrics: a small `prometheus-client` registry tracking fetch-cycle counters,
//! validation outcomes, and per-tier gauges (a `Family<Labels, Counter>` per event kind,
//! registered once at construction). This is infrastructure plumbing the admin listener in
//! `harvest-app` exposes at `/metrics` — it has no bearing on `get_proxy`/`report_outcome`
//! semantics, which stay out of scope of this registry.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::model::Tier;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ValidationLabel {
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdapterFetchLabel {
	pub source: String,
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabel {
	pub tier: String,
}

pub struct Metrics {
	fetch_cycles_total: Counter,
	validations_total: Family<ValidationLabel, Counter>,
	adapter_fetches_total: Family<AdapterFetchLabel, Counter>,
	tier_size: Family<TierLabel, Gauge>,
	snapshot_writes_total: Counter,
	snapshot_write_failures_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let fetch_cycles_total = Counter::default();
		registry.register("fetch_cycles_total", "Completed fetch cycles", fetch_cycles_total.clone());

		let validations_total = Family::default();
		registry.register("validations_total", "Validation outcomes by kind", validations_total.clone());

		let adapter_fetches_total = Family::default();
		registry.register("adapter_fetches_total", "Per-source fetch outcomes", adapter_fetches_total.clone());

		let tier_size = Family::default();
		registry.register("tier_size", "Current node count per tier", tier_size.clone());

		let snapshot_writes_total = Counter::default();
		registry.register("snapshot_writes_total", "Successful snapshot writes", snapshot_writes_total.clone());

		let snapshot_write_failures_total = Counter::default();
		registry.register(
			"snapshot_write_failures_total",
			"Failed snapshot writes",
			snapshot_write_failures_total.clone(),
		);

		Self {
			fetch_cycles_total,
			validations_total,
			adapter_fetches_total,
			tier_size,
			snapshot_writes_total,
			snapshot_write_failures_total,
		}
	}

	pub fn record_fetch_cycle(&self) {
		self.fetch_cycles_total.inc();
	}

	pub fn record_validation(&self, ok: bool) {
		let outcome = if ok { "ok" } else { "fail" }.to_string();
		self.validations_total.get_or_create(&ValidationLabel { outcome }).inc();
	}

	pub fn record_adapter_fetch(&self, source: &str, ok: bool) {
		let label = AdapterFetchLabel {
			source: source.to_string(),
			outcome: if ok { "ok" } else { "fail" }.to_string(),
		};
		self.adapter_fetches_total.get_or_create(&label).inc();
	}

	pub fn set_tier_sizes(&self, counts: &std::collections::BTreeMap<String, usize>) {
		for tier in [Tier::Pending, Tier::Cold, Tier::Warm, Tier::Hot, Tier::Blacklist] {
			let name = format!("{tier:?}").to_lowercase();
			let value = counts.get(&name).copied().unwrap_or(0) as i64;
			self.tier_size.get_or_create(&TierLabel { tier: name }).set(value);
		}
	}

	pub fn record_snapshot_write(&self, ok: bool) {
		if ok {
			self.snapshot_writes_total.inc();
		} else {
			self.snapshot_write_failures_total.inc();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_panicking() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics.record_fetch_cycle();
		metrics.record_validation(true);
		metrics.record_adapter_fetch("sslproxies", false);
		metrics.record_snapshot_write(true);
		let mut counts = std::collections::BTreeMap::new();
		counts.insert("hot".to_string(), 3usize);
		metrics.set_tier_sizes(&counts);

		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
		assert!(buf.contains("fetch_cycles_total"));
		assert!(buf.contains("tier_size"));
	}
}
