//! Ambient admin listener: `/healthz` backed by `harvest_core::readiness`, and `/metrics`
//! encoding the `prometheus-client` registry the engine populates. This is infrastructure
//! plumbing, not a request-routing/auth/CORS-bearing HTTP API surface — it has no route for
//! `get_proxy`/`report_outcome`.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use harvest_core::readiness::Ready;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct AdminState {
	registry: Arc<Mutex<Registry>>,
	ready: Ready,
}

fn router(state: AdminState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics))
		.with_state(state)
}

async fn healthz(State(state): State<AdminState>) -> (StatusCode, String) {
	let pending = state.ready.pending();
	if pending.is_empty() {
		(StatusCode::OK, "ok".to_string())
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, format!("pending: {pending:?}"))
	}
}

async fn metrics(State(state): State<AdminState>) -> Result<String, StatusCode> {
	let mut buf = String::new();
	let registry = state.registry.lock().expect("registry mutex poisoned");
	match encode(&mut buf, &registry) {
		Ok(()) => Ok(buf),
		Err(e) => {
			error!(error = %e, "failed to encode metrics");
			Err(StatusCode::INTERNAL_SERVER_ERROR)
		},
	}
}

/// Binds and serves the admin listener until `cancel` fires. Bind failures are reported to the
/// caller so `main` can map them onto the appropriate exit code.
pub async fn serve(addr: &str, registry: Registry, ready: Ready, cancel: CancellationToken) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(%addr, "admin listener bound");
	let state = AdminState { registry: Arc::new(Mutex::new(registry)), ready };
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move { cancel.cancelled().await })
		.await?;
	Ok(())
}
