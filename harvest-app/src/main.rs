//! The proxy harvesting engine binary: CLI parsing, config load, constructs the `Engine`, runs
//! until a shutdown signal, drains, and exits with one of the documented codes below.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use harvest_core::{readiness, signal, telemetry, version};
use harvest_engine::Engine;
use harvest_engine::config::parse_config;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod admin;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Inline config contents, as YAML.
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Config file path, as YAML.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit without starting the engine.
	#[arg(long)]
	validate_only: bool,

	/// Print version (as a simple version string).
	#[arg(short = 'V')]
	version_short: bool,

	/// Print version (as a struct dump).
	#[arg(long = "version")]
	version_long: bool,
}

/// Exit codes for the binary (0 is a plain successful exit, never constructed here).
enum ExitReason {
	ConfigError,
	SnapshotLoadFailure,
}

fn exit_code(reason: ExitReason) -> ExitCode {
	match reason {
		ExitReason::ConfigError => ExitCode::from(1),
		ExitReason::SnapshotLoadFailure => ExitCode::from(2),
	}
}

fn main() -> ExitCode {
	let _log_guard = telemetry::setup_logging();
	let args = Args::parse();

	if args.version_short {
		println!("{}", version::BuildInfo::new().version);
		return ExitCode::SUCCESS;
	}
	if args.version_long {
		println!("{}", version::BuildInfo::new());
		return ExitCode::SUCCESS;
	}

	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start tokio runtime: {e}");
			return exit_code(ExitReason::ConfigError);
		},
	};
	runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> ExitCode {
	let contents = match (args.config, args.file) {
		(Some(_), Some(_)) => {
			eprintln!("only one of --config or --file may be given");
			return exit_code(ExitReason::ConfigError);
		},
		(Some(inline), None) => inline,
		(None, Some(path)) => match std::fs::read_to_string(&path) {
			Ok(contents) => contents,
			Err(e) => {
				eprintln!("failed to read config file {}: {e}", path.display());
				return exit_code(ExitReason::ConfigError);
			},
		},
		(None, None) => String::new(),
	};

	let config = match parse_config(&contents) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("configuration error: {e}");
			return exit_code(ExitReason::ConfigError);
		},
	};

	if args.validate_only {
		println!("configuration is valid");
		return ExitCode::SUCCESS;
	}

	if let Err(e) = ensure_snapshot_dir_accessible(&config.snapshot_path) {
		eprintln!("snapshot directory is not accessible: {e}");
		return exit_code(ExitReason::SnapshotLoadFailure);
	}

	run(config).await
}

/// Verifies the snapshot directory can be created and written to before the engine starts. A
/// corrupt or missing *snapshot file* is recoverable (Persistence falls back to an older
/// generation, or starts empty and logs loudly) — this check instead guards against the snapshot
/// *directory itself* being unusable, which is what exit code 2 is reserved for.
fn ensure_snapshot_dir_accessible(snapshot_path: &std::path::Path) -> std::io::Result<()> {
	let dir = snapshot_path.parent().unwrap_or_else(|| std::path::Path::new("."));
	std::fs::create_dir_all(dir)?;
	let probe = dir.join(".harvest-app-writable-probe");
	std::fs::write(&probe, b"")?;
	std::fs::remove_file(&probe)
}

async fn run(config: harvest_engine::Config) -> ExitCode {
	let mut registry = Registry::default();
	let ready = readiness::Ready::new();
	let engine_task = ready.register_task("engine");
	let admin_addr = config.admin_addr.clone();

	let engine = match Engine::new(config, &mut registry).await {
		Ok(engine) => engine,
		Err(e) => {
			eprintln!("failed to construct engine: {e}");
			return exit_code(ExitReason::ConfigError);
		},
	};
	drop(engine_task);

	info!("version: {}", version::BuildInfo::new());

	let shutdown = signal::Shutdown::new();
	let cancel = CancellationToken::new();

	let admin_task = {
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if let Err(e) = admin::serve(&admin_addr, registry, ready, cancel).await {
				error!(error = %e, "admin listener failed");
			}
		})
	};

	let engine_run = {
		let engine = Arc::clone(&engine);
		let cancel = cancel.clone();
		tokio::spawn(async move { engine.run(cancel).await })
	};

	shutdown.wait().await;
	info!("shutdown signaled, draining");
	cancel.cancel();
	let _ = engine_run.await;
	let _ = admin_task.await;

	ExitCode::SUCCESS
}
