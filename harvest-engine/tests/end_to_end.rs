//! End-to-end scenarios exercising the fetch → dedup → validate path and cooperative shutdown
//! through the real `Scheduler`/`Engine` wiring, rather than the individual-module unit tests
//! colocated with `dedup.rs`/`pool.rs`.

use std::time::Duration;

use harvest_engine::config::{TierThresholds, parse_config};
use harvest_engine::metrics::Metrics;
use harvest_engine::model::SelectorFilter;
use harvest_engine::pool::PoolManager;
use harvest_engine::scheduler::Scheduler;
use harvest_engine::scorer::ScorerParams;
use harvest_engine::{Config, Engine};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dedup_config(source_a_uri: &str, source_b_uri: &str) -> Config {
	let yaml = [
		"sources:",
		&format!("  - name: source_a\n    kind: github_list\n    url: \"{source_a_uri}/\""),
		&format!("  - name: source_b\n    kind: github_list\n    url: \"{source_b_uri}/\""),
		"test_endpoints: [\"http://echo.invalid/ip\"]",
		"validator_timeout_secs: 1",
		"adapter_timeout_secs: 5",
	]
	.join("\n");
	parse_config(&yaml).unwrap()
}

/// Two adapters emit the same `(host, port, protocol)`. Dedup happens
/// before the scheduler ever hands candidates to the Validator, so exactly one node results with
/// both sources recorded and exactly one validation attempt against it — not two.
#[tokio::test]
async fn dedup_across_two_adapters_yields_one_node_and_one_validation() {
	let source_a = MockServer::start().await;
	let source_b = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("1.2.3.4:8080\n"))
		.mount(&source_a)
		.await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("1.2.3.4:8080\n"))
		.mount(&source_b)
		.await;

	let config = dedup_config(&source_a.uri(), &source_b.uri());
	let mut registry = Registry::default();
	let metrics = std::sync::Arc::new(Metrics::new(&mut registry));
	let (pool, _change_rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
	let pool = std::sync::Arc::new(pool);
	let scheduler = Scheduler::new(config, std::sync::Arc::clone(&pool), metrics).unwrap();

	scheduler.trigger_fetch().await.wait().await;

	let nodes = pool.all_nodes().await;
	assert_eq!(nodes.len(), 1, "duplicate candidates across sources must merge into one node");
	let node = &nodes[0];
	assert_eq!(node.source.len(), 2, "both source names should be recorded on the merged node");
	assert!(node.source.contains(&"source_a".to_string()));
	assert!(node.source.contains(&"source_b".to_string()));
	assert_eq!(node.checks_total, 1, "the merged node must be validated exactly once, not per-source");
}

/// Three sources each delay their response by 400ms; their candidates are loopback addresses with
/// nothing listening, so prescan/validation reject near-instantly and contribute negligible time
/// to the cycle. If `run_fetch_cycle` dispatched sources sequentially the cycle would take
/// >= 1200ms; dispatched in parallel it completes in roughly one source's delay.
#[tokio::test]
async fn fetch_cycle_dispatches_all_sources_in_parallel() {
	let sources: Vec<MockServer> = start_mock_servers(3).await;
	for (i, server) in sources.iter().enumerate() {
		Mock::given(method("GET"))
			.respond_with(ResponseTemplate::new(200).set_body_string(format!("127.0.0.1:{}\n", i + 1)).set_delay(Duration::from_millis(400)))
			.mount(server)
			.await;
	}

	let yaml = [
		"sources:".to_string(),
		format!("  - name: s0\n    kind: github_list\n    url: \"{}/\"", sources[0].uri()),
		format!("  - name: s1\n    kind: github_list\n    url: \"{}/\"", sources[1].uri()),
		format!("  - name: s2\n    kind: github_list\n    url: \"{}/\"", sources[2].uri()),
		"test_endpoints: [\"http://echo.invalid/ip\"]".to_string(),
		"validator_timeout_secs: 1".to_string(),
		"adapter_timeout_secs: 5".to_string(),
		// Nothing listens on these loopback ports, so a real TCP prescan would reject every
		// candidate before it ever reaches the Validator; disabled so the assertion below stays
		// about fetch-dispatch timing, not prescan behavior.
		"prescan_enabled: false".to_string(),
	]
	.join("\n");
	let config = parse_config(&yaml).unwrap();

	let mut registry = Registry::default();
	let metrics = std::sync::Arc::new(Metrics::new(&mut registry));
	let (pool, _change_rx) = PoolManager::new(TierThresholds::default(), ScorerParams::default());
	let pool = std::sync::Arc::new(pool);
	let scheduler = Scheduler::new(config, std::sync::Arc::clone(&pool), metrics).unwrap();

	let started = std::time::Instant::now();
	scheduler.trigger_fetch().await.wait().await;
	let elapsed = started.elapsed();

	assert!(
		elapsed < Duration::from_millis(1100),
		"three 400ms sources should overlap, not sum to >=1200ms; took {elapsed:?}"
	);
	assert_eq!(pool.all_nodes().await.len(), 3, "all three sources' candidates must still be admitted");
}

async fn start_mock_servers(n: usize) -> Vec<MockServer> {
	let mut servers = Vec::with_capacity(n);
	for _ in 0..n {
		servers.push(MockServer::start().await);
	}
	servers
}

fn cancellation_config(snapshot_dir: &std::path::Path, slow_source_uri: &str) -> Config {
	let yaml = [
		"sources:".to_string(),
		format!("  - name: slow_source\n    kind: github_list\n    url: \"{slow_source_uri}/\""),
		"test_endpoints: [\"http://echo.invalid/ip\"]".to_string(),
		format!("snapshot_path: \"{}/pool.json\"", snapshot_dir.display()),
		"fetch_interval_secs: 3600".to_string(),
		"reval_interval_secs: 3600".to_string(),
		"retain_interval_secs: 3600".to_string(),
		"persist_interval_secs: 3600".to_string(),
		"adapter_timeout_secs: 30".to_string(),
		"drain_deadline_secs: 1".to_string(),
	]
	.join("\n");
	parse_config(&yaml).unwrap()
}

/// Shutdown is triggered while one adapter is still reading. `run_fetch_cycle` dispatches each
/// source as its own task (`fetch_one_source`), and that task races its fetch against the
/// scheduler's cancellation token, so the in-flight adapter call is abandoned at that I/O boundary
/// rather than run to completion. `Engine::run` returns well inside the drain deadline without
/// the slow fetch ever contributing a candidate to the pool, and still writes a final snapshot.
#[tokio::test]
async fn cancellation_during_fetch_leaves_pool_untouched_and_writes_snapshot() {
	let slow_source = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("9.9.9.9:1080\n").set_delay(Duration::from_secs(30)))
		.mount(&slow_source)
		.await;

	let dir = tempfile::tempdir().unwrap();
	let config = cancellation_config(dir.path(), &slow_source.uri());
	let mut registry = Registry::default();
	let engine = Engine::new(config, &mut registry).await.unwrap();

	let cancel = CancellationToken::new();
	let run_handle = {
		let engine = std::sync::Arc::clone(&engine);
		let cancel = cancel.clone();
		tokio::spawn(async move { engine.run(cancel).await })
	};

	// Kick off a fetch against the slow source, then signal shutdown immediately without
	// waiting for that fetch to complete.
	let _fetch_handle = engine.trigger_fetch().await;
	cancel.cancel();

	tokio::time::timeout(Duration::from_secs(5), run_handle)
		.await
		.expect("engine.run must return well within the drain deadline")
		.expect("engine task must not panic");

	let stats = engine.stats().await;
	assert_eq!(stats.per_tier_count.values().sum::<usize>(), 0, "the slow fetch must not have admitted any node");
	assert!(engine.get_proxy(SelectorFilter::default()).await.is_none());

	let mut snapshot_files = tokio::fs::read_dir(dir.path()).await.unwrap();
	let mut found_snapshot = false;
	while let Some(entry) = snapshot_files.next_entry().await.unwrap() {
		if entry.file_name().to_string_lossy().starts_with("pool-") {
			found_snapshot = true;
		}
	}
	assert!(found_snapshot, "engine.run must write a final snapshot on the way out");
}
