// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initializes the global tracing subscriber: an `EnvFilter` (defaulting to `info`) driving a
/// compact, target-prefixed fmt layer. Returns a guard that must be held for the lifetime of the
/// process; dropping it is harmless but log output stops once it is gone since there is no
/// buffered writer to flush.
pub fn setup_logging() -> LoggingGuard {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(true)
		.with_thread_ids(false);
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.try_init();
	Lazy::force(&APPLICATION_START_TIME);
	LoggingGuard
}

/// Held for the process lifetime; see [`setup_logging`].
#[must_use]
pub struct LoggingGuard;
