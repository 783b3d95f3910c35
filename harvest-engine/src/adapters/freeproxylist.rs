//! Raw `host:port` text-list adapter, one proxy per line — the format used by
//! proxy-list.download-shaped endpoints.

use async_trait::async_trait;

use super::{FetchResult, SourceAdapter, candidate_from_host_port, fetch_body};
use crate::model::Protocol;

pub struct FreeProxyListAdapter {
	name: String,
	url: String,
}

impl FreeProxyListAdapter {
	pub fn new(name: String, url: String) -> Self {
		Self { name, url }
	}
}

fn parse_list(source: &str, source_url: &str, body: &str) -> Vec<crate::model::ProxyNode> {
	body.lines()
		.filter_map(|line| {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				return None;
			}
			let (host, port) = line.split_once(':')?;
			candidate_from_host_port(source, source_url, host, port, Protocol::Http)
		})
		.collect()
}

#[async_trait]
impl SourceAdapter for FreeProxyListAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self, client: &reqwest::Client, timeout: std::time::Duration) -> FetchResult {
		let body = fetch_body(client, &self.name, &self.url, timeout).await?;
		Ok(parse_list(&self.name, &self.url, &body))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_host_port_lines() {
		let nodes = parse_list("test", "http://x", "1.2.3.4:8080\n5.6.7.8:3128\n\n# comment\nmalformed");
		assert_eq!(nodes.len(), 2);
		assert_eq!(nodes[0].key.host, "1.2.3.4");
		assert_eq!(nodes[0].key.port, 8080);
	}
}
