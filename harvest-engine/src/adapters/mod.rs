//! Source Adapters: a closed variant set behind a uniform `fetch()`/`name()` capability, rather
//! than duck-typed adapter objects. Adapters are stateless between calls; throttling state lives
//! in the Scheduler.

mod freeproxylist;
mod geonode;
mod github_list;
mod sslproxies;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::SourceConfig;
use crate::error::{SourceError, SourceErrorKind};
use crate::model::ProxyNode;

/// Result of one `fetch()` call: zero or more candidates, or a per-source error. A source that
/// errors never poisons the cycle for any other source.
pub type FetchResult = Result<Vec<ProxyNode>, SourceError>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
	fn name(&self) -> &str;
	async fn fetch(&self, client: &reqwest::Client, timeout: std::time::Duration) -> FetchResult;
}

/// Builds the concrete adapter for a configured source. Unknown `kind` values are a configuration
/// error detected at startup, not a per-cycle one.
pub fn build_adapter(cfg: &SourceConfig) -> Result<Box<dyn SourceAdapter>, crate::error::ConfigError> {
	match cfg.kind.as_str() {
		"sslproxies" => Ok(Box::new(sslproxies::SslproxiesAdapter::new(cfg.name.clone(), cfg.url.clone()))),
		"geonode" => Ok(Box::new(geonode::GeonodeAdapter::new(cfg.name.clone(), cfg.url.clone()))),
		"freeproxylist" => Ok(Box::new(freeproxylist::FreeProxyListAdapter::new(
			cfg.name.clone(),
			cfg.url.clone(),
		))),
		"github_list" => Ok(Box::new(github_list::GithubListAdapter::new(cfg.name.clone(), cfg.url.clone()))),
		other => Err(crate::error::ConfigError::Invalid(format!(
			"unknown source kind '{other}' for source '{}'",
			cfg.name
		))),
	}
}

/// Shared HTTP fetch helper: GETs `url`, follows at most one redirect, and maps
/// transport/redirect/status failures onto `SourceErrorKind`. Adapters call this then hand the
/// body to their own parser.
async fn fetch_body(
	client: &reqwest::Client,
	source: &str,
	url: &str,
	timeout: std::time::Duration,
) -> Result<String, SourceError> {
	let resp = client
		.get(url)
		.timeout(timeout)
		.send()
		.await
		.map_err(|e| SourceError::new(source, SourceErrorKind::Unreachable, e.to_string()))?;

	if resp.status().is_redirection() {
		return Err(SourceError::new(
			source,
			SourceErrorKind::Unreachable,
			format!("unexpected redirect chain at status {}", resp.status()),
		));
	}
	if !resp.status().is_success() {
		return Err(SourceError::new(
			source,
			SourceErrorKind::Unreachable,
			format!("status {}", resp.status()),
		));
	}
	resp.text()
		.await
		.map_err(|e| SourceError::new(source, SourceErrorKind::ParseError, e.to_string()))
}

/// Parses a `host:port` pair into a candidate. Shared by the plain-text-list adapters.
fn candidate_from_host_port(
	source: &str,
	source_url: &str,
	host: &str,
	port: &str,
	protocol: crate::model::Protocol,
) -> Option<ProxyNode> {
	let port: u16 = port.trim().parse().ok()?;
	let host = host.trim();
	if host.is_empty() {
		return None;
	}
	let key = crate::model::ProxyKey::new(host, port, protocol);
	Some(ProxyNode::new_candidate(key, source, Some(source_url.to_string()), Utc::now()))
}
