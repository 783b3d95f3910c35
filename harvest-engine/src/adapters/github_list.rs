//! Line-delimited adapter for GitHub-hosted raw proxy lists, which commonly prefix each line with
//! a scheme (`socks5://1.2.3.4:1080`) rather than leaving protocol implicit.

use async_trait::async_trait;

use super::{FetchResult, SourceAdapter, candidate_from_host_port, fetch_body};
use crate::model::{Protocol, ProxyNode};

pub struct GithubListAdapter {
	name: String,
	url: String,
}

impl GithubListAdapter {
	pub fn new(name: String, url: String) -> Self {
		Self { name, url }
	}
}

fn parse_protocol_prefix(line: &str) -> (Protocol, &str) {
	if let Some(rest) = line.strip_prefix("socks5://") {
		(Protocol::Socks5, rest)
	} else if let Some(rest) = line.strip_prefix("socks4://") {
		(Protocol::Socks4, rest)
	} else if let Some(rest) = line.strip_prefix("https://") {
		(Protocol::Https, rest)
	} else if let Some(rest) = line.strip_prefix("http://") {
		(Protocol::Http, rest)
	} else {
		(Protocol::Http, line)
	}
}

fn parse_list(source: &str, source_url: &str, body: &str) -> Vec<ProxyNode> {
	body.lines()
		.filter_map(|line| {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				return None;
			}
			let (protocol, rest) = parse_protocol_prefix(line);
			let (host, port) = rest.split_once(':')?;
			candidate_from_host_port(source, source_url, host, port, protocol)
		})
		.collect()
}

#[async_trait]
impl SourceAdapter for GithubListAdapter {
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
	fn parses_scheme_prefixed_lines() {
		let nodes = parse_list("test", "http://x", "socks5://1.2.3.4:1080\nhttp://5.6.7.8:8080\n9.9.9.9:3128");
		assert_eq!(nodes.len(), 3);
		assert_eq!(nodes[0].key.protocol, Protocol::Socks5);
		assert_eq!(nodes[1].key.protocol, Protocol::Http);
		assert_eq!(nodes[2].key.protocol, Protocol::Http);
	}
}
