//! Validator: issues a test request through each candidate, classifies anonymity from the
//! echoed response, and probes HTTPS capability. `reqwest::Proxy` covers http/https/socks5
//! transport; SOCKS4 has no reqwest support so it gets a small hand-rolled raw-TCP CONNECT
//! handshake below rather than pulling in a dedicated socks4 crate.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::ValidationError;
use crate::model::{Anonymity, Protocol, ProxyNode, ValidationOutcome};

pub struct Validator {
	concurrency: std::sync::Arc<Semaphore>,
	timeout: Duration,
	test_endpoints: Vec<Url>,
	/// The caller's own public IP, as echoed back by a direct (unproxied) request to the first
	/// test endpoint. Resolved lazily and cached: every candidate needs it to tell `Anonymous`
	/// from `Transparent`, so it's wasteful to refetch per validation.
	own_ip: tokio::sync::OnceCell<Option<String>>,
}

impl Validator {
	pub fn new(concurrency: usize, timeout: Duration, test_endpoints: Vec<Url>) -> Self {
		Self {
			concurrency: std::sync::Arc::new(Semaphore::new(concurrency.max(1))),
			timeout,
			test_endpoints,
			own_ip: tokio::sync::OnceCell::new(),
		}
	}

	/// The real IP our own outbound requests present. Used to tell a proxy that leaks the real
	/// caller IP (transparent) from one that only reveals its own address (anonymous/elite).
	/// `None` if the direct probe itself fails — validation then falls back to the
	/// header-presence-only heuristic, which degrades `Transparent` detection but never panics.
	async fn own_ip(&self) -> Option<&str> {
		self.own_ip
			.get_or_init(|| async {
				let Some(endpoint) = self.test_endpoints.first() else { return None };
				let client = reqwest::Client::builder().timeout(self.timeout).build().ok()?;
				let body = client.get(endpoint.clone()).send().await.ok()?.text().await.ok()?;
				extract_echoed_ip(&body)
			})
			.await
			.as_deref()
	}

	/// Validates one candidate, retrying once on `Transport`/`Timeout` with a fresh connection
	/// with a fresh connection. Every other failure kind is final for this cycle.
	pub async fn validate(&self, node: &ProxyNode) -> ValidationOutcome {
		let _permit = self.concurrency.acquire().await.expect("semaphore never closed");
		let Some(endpoint) = self.test_endpoints.first() else {
			// Caught at startup by Engine::new; defensive only.
			return ValidationOutcome::failure(ValidationError::Transport("no test endpoints configured".into()), Utc::now());
		};

		let mut attempt = self.attempt(node, endpoint).await;
		if let Err(ref e) = attempt {
			if e.is_retryable() {
				attempt = self.attempt(node, endpoint).await;
			}
		}

		match attempt {
			Ok((latency_ms, body)) => {
				let anonymity = classify_anonymity(&body, self.own_ip().await);
				let https_capable = if node.key.protocol == Protocol::Http {
					self.probe_https(node).await
				} else {
					node.key.protocol == Protocol::Https
				};
				ValidationOutcome::success(latency_ms, anonymity, https_capable, Utc::now())
			},
			Err(e) => ValidationOutcome::failure(e, Utc::now()),
		}
	}

	async fn attempt(&self, node: &ProxyNode, endpoint: &Url) -> Result<(u32, String), ValidationError> {
		let start = Instant::now();
		let body = match node.key.protocol {
			Protocol::Socks4 => self.fetch_via_socks4(node, endpoint).await?,
			_ => self.fetch_via_reqwest(node, endpoint).await?,
		};
		let latency_ms = start.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
		if looks_banned(&body) {
			return Err(ValidationError::BannedSignal("captive-portal-shaped body".into()));
		}
		Ok((latency_ms, body))
	}

	async fn fetch_via_reqwest(&self, node: &ProxyNode, endpoint: &Url) -> Result<String, ValidationError> {
		let proxy_url = format!("{}://{}:{}", node.key.protocol, node.key.host, node.key.port);
		let proxy = reqwest::Proxy::all(&proxy_url)
			.map_err(|e| ValidationError::Transport(format!("invalid proxy url: {e}")))?;
		let client = reqwest::Client::builder()
			.proxy(proxy)
			.timeout(self.timeout)
			.build()
			.map_err(|e| ValidationError::Transport(e.to_string()))?;

		let resp = match tokio::time::timeout(self.timeout, client.get(endpoint.clone()).send()).await {
			Ok(Ok(r)) => r,
			Ok(Err(e)) if e.is_timeout() => return Err(ValidationError::Timeout),
			Ok(Err(e)) if e.is_connect() => return Err(ValidationError::Transport(e.to_string())),
			Ok(Err(e)) => return Err(classify_reqwest_error(e)),
			Err(_) => return Err(ValidationError::Timeout),
		};
		if !resp.status().is_success() {
			return Err(ValidationError::HttpStatus(resp.status().as_u16()));
		}
		resp.text().await.map_err(|e| ValidationError::Transport(e.to_string()))
	}

	async fn probe_https(&self, node: &ProxyNode) -> bool {
		let Some(https_endpoint) = self.test_endpoints.iter().find(|u| u.scheme() == "https") else {
			return false;
		};
		self.fetch_via_reqwest(node, https_endpoint).await.is_ok()
	}

	/// Hand-rolled SOCKS4 CONNECT (no formal RFC, only an informally documented protocol): `VER=4 CMD=1 DSTPORT
	/// DSTIP USERID\0`, then an 8-byte reply whose second byte is `0x5A` on grant.
	async fn fetch_via_socks4(&self, node: &ProxyNode, endpoint: &Url) -> Result<String, ValidationError> {
		let host = endpoint
			.host_str()
			.ok_or_else(|| ValidationError::Transport("test endpoint has no host".into()))?;
		let port = endpoint.port_or_known_default().unwrap_or(80);
		let dst_ip = resolve_ipv4(host).await?;

		let connect_fut = async {
			let mut stream = TcpStream::connect((node.key.host.as_str(), node.key.port))
				.await
				.map_err(|e| ValidationError::Transport(e.to_string()))?;

			let mut req = Vec::with_capacity(9);
			req.push(4u8); // VER
			req.push(1u8); // CMD = CONNECT
			req.extend_from_slice(&port.to_be_bytes());
			req.extend_from_slice(&dst_ip.octets());
			req.push(0u8); // USERID terminator, empty userid
			stream
				.write_all(&req)
				.await
				.map_err(|e| ValidationError::Transport(e.to_string()))?;

			let mut reply = [0u8; 8];
			stream
				.read_exact(&mut reply)
				.await
				.map_err(|e| ValidationError::Transport(e.to_string()))?;
			if reply[1] != 0x5A {
				return Err(ValidationError::TlsHandshake(format!("SOCKS4 request rejected, code {}", reply[1])));
			}

			let request = format!(
				"GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
				endpoint.path(),
				host
			);
			stream
				.write_all(request.as_bytes())
				.await
				.map_err(|e| ValidationError::Transport(e.to_string()))?;

			let mut raw = Vec::new();
			stream
				.read_to_end(&mut raw)
				.await
				.map_err(|e| ValidationError::Transport(e.to_string()))?;
			parse_http_response(&raw)
		};

		match tokio::time::timeout(self.timeout, connect_fut).await {
			Ok(result) => result,
			Err(_) => Err(ValidationError::Timeout),
		}
	}
}

async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, ValidationError> {
	if let Ok(addr) = Ipv4Addr::from_str(host) {
		return Ok(addr);
	}
	tokio::net::lookup_host((host, 0))
		.await
		.map_err(|e| ValidationError::Transport(e.to_string()))?
		.find_map(|addr| match addr.ip() {
			std::net::IpAddr::V4(v4) => Some(v4),
			std::net::IpAddr::V6(_) => None,
		})
		.ok_or_else(|| ValidationError::Transport(format!("no A record for {host}")))
}

/// Minimal HTTP/1.1 response parser: enough to split status line from body for a validator that
/// only needs the status code and echoed body, not a general client.
fn parse_http_response(raw: &[u8]) -> Result<String, ValidationError> {
	let text = String::from_utf8_lossy(raw);
	let mut parts = text.splitn(2, "\r\n\r\n");
	let head = parts.next().unwrap_or_default();
	let body = parts.next().unwrap_or_default();

	let status_line = head.lines().next().unwrap_or_default();
	let code: u16 = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.ok_or_else(|| ValidationError::Transport(format!("malformed status line: {status_line}")))?;
	if !(200..300).contains(&code) {
		return Err(ValidationError::HttpStatus(code));
	}
	Ok(body.to_string())
}

fn classify_reqwest_error(e: reqwest::Error) -> ValidationError {
	if e.is_timeout() {
		ValidationError::Timeout
	} else if let Some(status) = e.status() {
		ValidationError::HttpStatus(status.as_u16())
	} else {
		ValidationError::Transport(e.to_string())
	}
}

/// Classifies anonymity from an echo-endpoint body. `own_ip` is the caller's real public IP, as
/// observed by a direct (unproxied) probe of the same endpoint; `None` when that probe itself
/// failed.
///
/// Per spec §4.4: real IP absent and no Via/X-Forwarded-For leakage → elite; proxy IP appears but
/// no real-IP leakage → anonymous; otherwise → transparent. A body with no echo fields at all
/// (neither an IP nor a leak header) is `Unknown` rather than `Elite` — an open question resolved
/// in DESIGN.md as "treat as success with degraded metadata" rather than a false-positive elite.
fn classify_anonymity(body: &str, own_ip: Option<&str>) -> Anonymity {
	let lower = body.to_ascii_lowercase();
	let has_via_or_xff = lower.contains("\"via\"") || lower.contains("x-forwarded-for") || lower.contains("\"xff\"");
	let has_origin_field = extract_echoed_ip(body).is_some() || lower.contains("\"origin\"") || lower.contains("\"ip\"");

	if !has_origin_field && !has_via_or_xff {
		return Anonymity::Unknown;
	}

	let real_ip_leaked = own_ip.is_some_and(|ip| body.contains(ip));
	if real_ip_leaked {
		Anonymity::Transparent
	} else if has_via_or_xff {
		// A leak header is present (e.g. an anonymized X-Forwarded-For entry) but it doesn't
		// carry our real IP: the proxy is detectable but doesn't unmask the caller.
		Anonymity::Anonymous
	} else if has_origin_field {
		Anonymity::Elite
	} else {
		Anonymity::Unknown
	}
}

/// Pulls an IPv4 address out of a JSON-ish echo body's `"origin"`/`"ip"` field. Used both to
/// recover our own public IP from a direct probe and, implicitly, to detect whether an echo body
/// carries IP data at all.
fn extract_echoed_ip(body: &str) -> Option<String> {
	static ECHO_IP: once_cell::sync::Lazy<regex::Regex> =
		once_cell::sync::Lazy::new(|| regex::Regex::new(r#""(?:origin|ip)"\s*:\s*"([0-9.]+)"#).expect("static regex is valid"));
	ECHO_IP.captures(body).map(|c| c[1].to_string())
}

/// Heuristic ban-signal detector: a body that
/// looks like a captive portal login page or redirect loop rather than the echo JSON we asked
/// for.
fn looks_banned(body: &str) -> bool {
	let lower = body.to_ascii_lowercase();
	lower.contains("captive portal") || (lower.contains("<form") && lower.contains("login") && !lower.contains("origin"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_elite_when_only_proxy_ip_present() {
		// Proxy's own IP is echoed, no Via/XFF header, and it doesn't match the real caller IP.
		let body = r#"{"origin": "9.9.9.9"}"#;
		assert_eq!(classify_anonymity(body, Some("5.6.7.8")), Anonymity::Elite);
	}

	#[test]
	fn classifies_anonymous_when_leak_header_present_without_real_ip() {
		// A Via/XFF header reveals proxy use, but the real caller IP never appears in the body.
		let body = r#"{"origin": "9.9.9.9", "X-Forwarded-For": "10.0.0.1"}"#;
		assert_eq!(classify_anonymity(body, Some("5.6.7.8")), Anonymity::Anonymous);
	}

	#[test]
	fn classifies_transparent_when_real_ip_leaks() {
		let body = r#"{"origin": "9.9.9.9", "X-Forwarded-For": "5.6.7.8"}"#;
		assert_eq!(classify_anonymity(body, Some("5.6.7.8")), Anonymity::Transparent);
	}

	#[test]
	fn classifies_transparent_when_real_ip_is_the_origin() {
		// No leak header, but the echoed origin itself is our real IP (proxy passed it through).
		let body = r#"{"origin": "5.6.7.8"}"#;
		assert_eq!(classify_anonymity(body, Some("5.6.7.8")), Anonymity::Transparent);
	}

	#[test]
	fn classifies_unknown_when_no_echo_fields() {
		let body = "hello world";
		assert_eq!(classify_anonymity(body, Some("5.6.7.8")), Anonymity::Unknown);
	}

	#[test]
	fn classifies_elite_without_own_ip_known() {
		// Own-IP probe failed; falls back to header-presence-only heuristic.
		let body = r#"{"origin": "9.9.9.9"}"#;
		assert_eq!(classify_anonymity(body, None), Anonymity::Elite);
	}

	#[test]
	fn extracts_ip_from_echo_body() {
		assert_eq!(extract_echoed_ip(r#"{"origin": "1.2.3.4"}"#), Some("1.2.3.4".to_string()));
		assert_eq!(extract_echoed_ip("no ip here"), None);
	}

	#[test]
	fn detects_captive_portal_body() {
		assert!(looks_banned("<html>Captive Portal - please login</html>"));
	}

	#[test]
	fn does_not_flag_ordinary_echo_body() {
		assert!(!looks_banned(r#"{"origin": "1.2.3.4"}"#));
	}

	#[test]
	fn parses_successful_http_response() {
		let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"origin\":1}\n";
		let body = parse_http_response(raw).unwrap();
		assert!(body.contains("origin"));
	}

	#[test]
	fn rejects_non_2xx_http_response() {
		let raw = b"HTTP/1.1 403 Forbidden\r\n\r\nblocked";
		let err = parse_http_response(raw).unwrap_err();
		assert_eq!(err, ValidationError::HttpStatus(403));
	}
}
