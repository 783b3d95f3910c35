//! Process-wide ambient primitives shared by the proxy harvesting engine and its binary:
//! graceful draining, shutdown signal handling, a readiness gate, build metadata, and logging
//! setup. Nothing in this crate knows about proxies, pools, or adapters.

pub mod drain;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod version;
