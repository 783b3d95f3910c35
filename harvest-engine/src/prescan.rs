//! Port Prescanner: a cheap bounded-concurrency TCP-connect filter that runs
//! ahead of the (expensive) HTTP validation stage. Failing prescan never blacklists a node —
//! many proxies refuse a raw connect probe but still answer CONNECT — it just drops the
//! candidate from this cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::model::ProxyNode;

pub struct Prescanner {
	concurrency: Arc<Semaphore>,
	timeout: Duration,
}

impl Prescanner {
	pub fn new(concurrency: usize, timeout: Duration) -> Self {
		Self {
			concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
			timeout,
		}
	}

	/// Filters `candidates` down to those that accepted a TCP connect within the timeout.
	/// Candidates are never retried; a cancelled probe (cancellation token fired) is
	/// treated the same as a failed one — the node simply doesn't make it into this cycle.
	pub async fn filter(&self, candidates: Vec<ProxyNode>, cancel: &tokio_util::sync::CancellationToken) -> Vec<ProxyNode> {
		let mut tasks = Vec::with_capacity(candidates.len());
		for candidate in candidates {
			let permit = self.concurrency.clone();
			let timeout = self.timeout;
			let cancel = cancel.clone();
			tasks.push(tokio::spawn(async move {
				let _permit = match permit.acquire_owned().await {
					Ok(p) => p,
					Err(_) => return None,
				};
				tokio::select! {
					biased;
					_ = cancel.cancelled() => None,
					reachable = probe(&candidate, timeout) => if reachable { Some(candidate) } else { None },
				}
			}));
		}

		let mut out = Vec::new();
		for task in tasks {
			if let Ok(Some(candidate)) = task.await {
				out.push(candidate);
			}
		}
		out
	}
}

async fn probe(candidate: &ProxyNode, timeout: Duration) -> bool {
	let addr = format!("{}:{}", candidate.key.host, candidate.key.port);
	matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}
