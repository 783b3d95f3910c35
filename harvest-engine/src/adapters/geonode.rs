//! JSON API adapter, modeled on geonode's `proxy-list` endpoint, which returns
//! `{"data": [{"ip": ..., "port": ..., "protocols": [...], "anonymityLevel": ..., "country": ...}]}`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{FetchResult, SourceAdapter, fetch_body};
use crate::error::{SourceError, SourceErrorKind};
use crate::model::{Anonymity, ProxyKey, ProxyNode, Protocol};

#[derive(Debug, Deserialize)]
struct GeonodeResponse {
	data: Vec<GeonodeEntry>,
}

#[derive(Debug, Deserialize)]
struct GeonodeEntry {
	ip: String,
	port: String,
	protocols: Vec<String>,
	#[serde(rename = "anonymityLevel")]
	anonymity_level: Option<String>,
	country: Option<String>,
	#[serde(rename = "isp")]
	isp: Option<String>,
}

pub struct GeonodeAdapter {
	name: String,
	url: String,
}

impl GeonodeAdapter {
	pub fn new(name: String, url: String) -> Self {
		Self { name, url }
	}
}

fn parse_protocol(raw: &str) -> Option<Protocol> {
	match raw.to_ascii_lowercase().as_str() {
		"http" => Some(Protocol::Http),
		"https" => Some(Protocol::Https),
		"socks4" => Some(Protocol::Socks4),
		"socks5" => Some(Protocol::Socks5),
		_ => None,
	}
}

fn parse_anonymity(raw: &str) -> Anonymity {
	match raw.to_ascii_lowercase().as_str() {
		"elite" | "high anonymous" | "elite proxy" => Anonymity::Elite,
		"anonymous" => Anonymity::Anonymous,
		"transparent" => Anonymity::Transparent,
		_ => Anonymity::Unknown,
	}
}

#[async_trait]
impl SourceAdapter for GeonodeAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self, client: &reqwest::Client, timeout: std::time::Duration) -> FetchResult {
		let body = fetch_body(client, &self.name, &self.url, timeout).await?;
		let parsed: GeonodeResponse = serde_json::from_str(&body)
			.map_err(|e| SourceError::new(&self.name, SourceErrorKind::ParseError, e.to_string()))?;

		let mut nodes = Vec::new();
		let now = Utc::now();
		for entry in parsed.data {
			let port: u16 = match entry.port.trim().parse() {
				Ok(p) => p,
				Err(_) => continue,
			};
			for raw_proto in &entry.protocols {
				let Some(protocol) = parse_protocol(raw_proto) else {
					continue;
				};
				let key = ProxyKey::new(entry.ip.clone(), port, protocol);
				let mut node = ProxyNode::new_candidate(key, &self.name, Some(self.url.clone()), now);
				node.anonymity = entry
					.anonymity_level
					.as_deref()
					.map(parse_anonymity)
					.unwrap_or(Anonymity::Unknown);
				node.country = entry.country.clone();
				node.isp = entry.isp.clone();
				nodes.push(node);
			}
		}
		Ok(nodes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_known_protocols() {
		assert_eq!(parse_protocol("HTTP"), Some(Protocol::Http));
		assert_eq!(parse_protocol("socks5"), Some(Protocol::Socks5));
		assert_eq!(parse_protocol("carrier-pigeon"), None);
	}

	#[test]
	fn maps_anonymity_levels() {
		assert_eq!(parse_anonymity("elite"), Anonymity::Elite);
		assert_eq!(parse_anonymity("anonymous"), Anonymity::Anonymous);
		assert_eq!(parse_anonymity("???"), Anonymity::Unknown);
	}
}
