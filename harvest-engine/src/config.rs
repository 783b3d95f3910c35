//! Configuration: a `RawConfig` deserialized from YAML, overlaid with environment variable
//! overrides, following a `parse()`/`parse_duration()` env-parsing pattern. Configuration errors
//! are detected at startup only.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawSourceConfig {
	pub name: String,
	pub kind: String,
	pub url: String,
	pub rate_limit_per_min: Option<u32>,
	pub min_refetch_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RawTierThresholds {
	pub hot_entry: Option<f64>,
	pub hot_exit: Option<f64>,
	pub warm_entry: Option<f64>,
	pub cold_entry: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RawConfig {
	pub sources: Vec<RawSourceConfig>,
	pub fetch_interval_secs: Option<u64>,
	pub reval_interval_secs: Option<u64>,
	pub retain_interval_secs: Option<u64>,
	pub persist_interval_secs: Option<u64>,
	pub validator_concurrency: Option<usize>,
	pub prescan_concurrency: Option<usize>,
	pub validator_timeout_secs: Option<u64>,
	pub prescan_timeout_secs: Option<u64>,
	pub adapter_timeout_secs: Option<u64>,
	pub tier_thresholds: RawTierThresholds,
	pub score_alpha: Option<f64>,
	pub score_half_life_secs: Option<u64>,
	pub test_endpoints: Vec<String>,
	pub snapshot_path: Option<String>,
	pub snapshot_retention: Option<usize>,
	pub drain_deadline_secs: Option<u64>,
	pub retention_horizon_secs: Option<u64>,
	pub prescan_enabled: Option<bool>,
	pub admin_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TierThresholds {
	pub hot_entry: f64,
	pub hot_exit: f64,
	pub warm_entry: f64,
	pub cold_entry: f64,
}

impl Default for TierThresholds {
	fn default() -> Self {
		Self {
			hot_entry: 0.8,
			hot_exit: 0.7,
			warm_entry: 0.5,
			cold_entry: 0.0,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
	pub name: String,
	pub kind: String,
	pub url: String,
	/// Caps fetch *attempts* per rolling 60s window, independent of `min_refetch_interval`: the
	/// refetch interval says "don't bother checking again yet", the rate limit says "never hammer
	/// this source harder than this even if something (a manual `trigger_fetch`, a short interval)
	/// asks for it".
	pub rate_limit_per_min: u32,
	pub min_refetch_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub sources: Vec<SourceConfig>,
	pub fetch_interval: Duration,
	pub reval_interval: Duration,
	pub retain_interval: Duration,
	pub persist_interval: Duration,
	pub validator_concurrency: usize,
	pub prescan_concurrency: usize,
	pub validator_timeout: Duration,
	pub prescan_timeout: Duration,
	pub adapter_timeout: Duration,
	pub tier_thresholds: TierThresholds,
	pub score_alpha: f64,
	pub score_half_life: Duration,
	pub test_endpoints: Vec<url::Url>,
	pub snapshot_path: std::path::PathBuf,
	pub snapshot_retention: usize,
	pub drain_deadline: Duration,
	pub retention_horizon: Duration,
	pub prescan_enabled: bool,
	pub admin_addr: String,
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match env::var(name) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e| ConfigError::Invalid(format!("invalid env var {name}={val} ({e})"))),
		Err(_) => Ok(None),
	}
}

/// Parses a YAML config document overlaid with `HARVEST_*` environment overrides into a fully
/// resolved `Config`, applying documented defaults for anything unset. Fails closed: any
/// malformed field is a startup error, never a runtime one.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
	let raw: RawConfig =
		serde_yaml::from_str(contents).map_err(|e| ConfigError::Invalid(format!("invalid config: {e}")))?;

	let sources = raw
		.sources
		.into_iter()
		.map(|s| SourceConfig {
			rate_limit_per_min: s.rate_limit_per_min.unwrap_or(30),
			min_refetch_interval: Duration::from_secs(s.min_refetch_interval_secs.unwrap_or(300)),
			name: s.name,
			kind: s.kind,
			url: s.url,
		})
		.collect::<Vec<_>>();
	if sources.len() > 16 {
		return Err(ConfigError::Invalid(format!(
			"{} sources configured, adapter concurrency is capped at 16",
			sources.len()
		)));
	}

	let test_endpoints = raw
		.test_endpoints
		.iter()
		.map(|s| url::Url::parse(s).map_err(|e| ConfigError::Invalid(format!("invalid test endpoint {s}: {e}"))))
		.collect::<Result<Vec<_>, _>>()?;

	let tt = raw.tier_thresholds;
	let defaults = TierThresholds::default();
	let tier_thresholds = TierThresholds {
		hot_entry: tt.hot_entry.unwrap_or(defaults.hot_entry),
		hot_exit: tt.hot_exit.unwrap_or(defaults.hot_exit),
		warm_entry: tt.warm_entry.unwrap_or(defaults.warm_entry),
		cold_entry: tt.cold_entry.unwrap_or(defaults.cold_entry),
	};

	Ok(Config {
		fetch_interval: Duration::from_secs(
			parse_env("HARVEST_FETCH_INTERVAL_SECS")?
				.or(raw.fetch_interval_secs)
				.unwrap_or(1800),
		),
		reval_interval: Duration::from_secs(
			parse_env("HARVEST_REVAL_INTERVAL_SECS")?
				.or(raw.reval_interval_secs)
				.unwrap_or(300),
		),
		retain_interval: Duration::from_secs(
			parse_env("HARVEST_RETAIN_INTERVAL_SECS")?
				.or(raw.retain_interval_secs)
				.unwrap_or(6 * 3600),
		),
		persist_interval: Duration::from_secs(
			parse_env("HARVEST_PERSIST_INTERVAL_SECS")?
				.or(raw.persist_interval_secs)
				.unwrap_or(60),
		),
		validator_concurrency: parse_env("HARVEST_VALIDATOR_CONCURRENCY")?
			.or(raw.validator_concurrency)
			.unwrap_or(50),
		prescan_concurrency: parse_env("HARVEST_PRESCAN_CONCURRENCY")?
			.or(raw.prescan_concurrency)
			.unwrap_or(200),
		validator_timeout: Duration::from_secs(
			parse_env("HARVEST_VALIDATOR_TIMEOUT_SECS")?
				.or(raw.validator_timeout_secs)
				.unwrap_or(10),
		),
		prescan_timeout: Duration::from_secs(
			parse_env("HARVEST_PRESCAN_TIMEOUT_SECS")?
				.or(raw.prescan_timeout_secs)
				.unwrap_or(2),
		),
		adapter_timeout: Duration::from_secs(
			parse_env("HARVEST_ADAPTER_TIMEOUT_SECS")?
				.or(raw.adapter_timeout_secs)
				.unwrap_or(15),
		),
		tier_thresholds,
		score_alpha: parse_env("HARVEST_SCORE_ALPHA")?.or(raw.score_alpha).unwrap_or(0.3),
		score_half_life: Duration::from_secs(
			parse_env("HARVEST_SCORE_HALF_LIFE_SECS")?
				.or(raw.score_half_life_secs)
				.unwrap_or(6 * 3600),
		),
		snapshot_path: parse_env::<String>("HARVEST_SNAPSHOT_PATH")?
			.or(raw.snapshot_path)
			.unwrap_or_else(|| "./snapshots/pool.json".to_string())
			.into(),
		snapshot_retention: parse_env("HARVEST_SNAPSHOT_RETENTION")?
			.or(raw.snapshot_retention)
			.unwrap_or(10),
		drain_deadline: Duration::from_secs(
			parse_env("HARVEST_DRAIN_DEADLINE_SECS")?
				.or(raw.drain_deadline_secs)
				.unwrap_or(30),
		),
		retention_horizon: Duration::from_secs(
			parse_env("HARVEST_RETENTION_HORIZON_SECS")?
				.or(raw.retention_horizon_secs)
				.unwrap_or(7 * 24 * 3600),
		),
		prescan_enabled: parse_env("HARVEST_PRESCAN_ENABLED")?
			.or(raw.prescan_enabled)
			.unwrap_or(true),
		admin_addr: parse_env::<String>("HARVEST_ADMIN_ADDR")?
			.or(raw.admin_addr)
			.unwrap_or_else(|| "127.0.0.1:15020".to_string()),
		sources,
		test_endpoints,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let cfg = parse_config("test_endpoints: [\"http://echo.example/ip\"]").unwrap();
		assert_eq!(cfg.fetch_interval, Duration::from_secs(1800));
		assert_eq!(cfg.reval_interval, Duration::from_secs(300));
		assert_eq!(cfg.validator_concurrency, 50);
		assert_eq!(cfg.prescan_concurrency, 200);
		assert_eq!(cfg.tier_thresholds.hot_entry, 0.8);
		assert_eq!(cfg.tier_thresholds.hot_exit, 0.7);
		assert_eq!(cfg.score_alpha, 0.3);
		assert_eq!(cfg.score_half_life, Duration::from_secs(6 * 3600));
	}

	#[test]
	fn rejects_unknown_fields() {
		let err = parse_config("bogus_field: 1").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn rejects_invalid_test_endpoint() {
		let err = parse_config("test_endpoints: [\"not a url\"]").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn caps_source_count_at_sixteen() {
		let mut yaml = String::from("sources:\n");
		for i in 0..17 {
			yaml.push_str(&format!("  - name: s{i}\n    kind: github_list\n    url: \"http://x/{i}\"\n"));
		}
		let err = parse_config(&yaml).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}
}
