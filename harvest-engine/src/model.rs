//! The data model: `ProxyNode` is the identity + measurement envelope for one endpoint;
//! `ProxyKey` is its primary key; `Tier` is the pool it currently occupies.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http,
	Https,
	Socks4,
	Socks5,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Protocol::Http => "http",
			Protocol::Https => "https",
			Protocol::Socks4 => "socks4",
			Protocol::Socks5 => "socks5",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
	/// Ranked below `Transparent` for `anonymity_at_least` comparisons: an unknown leakage
	/// posture must never satisfy a positive anonymity requirement.
	#[default]
	Unknown,
	Transparent,
	Anonymous,
	Elite,
}

impl Anonymity {
	fn rank(self) -> u8 {
		match self {
			Anonymity::Unknown => 0,
			Anonymity::Transparent => 1,
			Anonymity::Anonymous => 2,
			Anonymity::Elite => 3,
		}
	}
}

impl PartialOrd for Anonymity {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Anonymity {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.rank().cmp(&other.rank())
	}
}

/// Tier membership. A node occupies exactly one of these at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
	Pending,
	Cold,
	Warm,
	Hot,
	Blacklist,
}

/// Primary key: `(host, port, protocol)`. Hosts are canonicalized (lowercased, trimmed) by the
/// deduplicator before a key is ever constructed; nothing downstream re-normalizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyKey {
	pub host: String,
	pub port: u16,
	pub protocol: Protocol,
}

impl ProxyKey {
	pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
		Self {
			host: canonicalize_host(host.into()),
			port,
			protocol,
		}
	}
}

impl fmt::Display for ProxyKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
	}
}

/// Lowercases and trims a host. IDN normalization would additionally punycode-encode unicode
/// labels; we don't carry an idna dependency for this scope, so non-ASCII hosts pass through
/// lowercased only (flagged in DESIGN.md as a known limitation).
pub fn canonicalize_host(host: String) -> String {
	host.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyNode {
	pub key: ProxyKey,

	// Provenance
	pub source: Vec<String>,
	pub source_url: Option<String>,
	pub first_seen: DateTime<Utc>,

	// Measurement
	pub last_checked: Option<DateTime<Utc>>,
	pub last_successful: Option<DateTime<Utc>>,
	pub response_time_ms: Option<u32>,
	pub checks_total: u64,
	pub checks_ok: u64,
	pub consecutive_failures: u32,

	// Quality
	pub score: f64,
	pub anonymity: Anonymity,
	pub https_capable: bool,

	// Enrichment (best-effort, nullable)
	pub country: Option<String>,
	pub region: Option<String>,
	pub city: Option<String>,
	pub isp: Option<String>,
	pub organization: Option<String>,
	/// Free-form enrichment tags opportunistically supplied by some adapters, e.g.
	/// "datacenter" / "residential".
	pub tags: Vec<String>,

	pub pool: Tier,

	/// Only set once a node enters Blacklist; drives the retention sweep.
	pub blacklisted_at: Option<DateTime<Utc>>,

	/// Last 5 latencies observed, most recent last; diagnostics only, not used by the scorer.
	#[serde(default)]
	pub recent_latencies_ms: VecDeque<u32>,
}

pub const RECENT_LATENCIES_CAPACITY: usize = 5;

impl ProxyNode {
	/// A freshly emitted candidate: identity set, all measurement fields unset, `pool = Pending`.
	pub fn new_candidate(
		key: ProxyKey,
		source: impl Into<String>,
		source_url: Option<String>,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			key,
			source: vec![source.into()],
			source_url,
			first_seen: now,
			last_checked: None,
			last_successful: None,
			response_time_ms: None,
			checks_total: 0,
			checks_ok: 0,
			consecutive_failures: 0,
			score: 0.5,
			anonymity: Anonymity::Unknown,
			https_capable: false,
			country: None,
			region: None,
			city: None,
			isp: None,
			organization: None,
			tags: Vec::new(),
			pool: Tier::Pending,
			blacklisted_at: None,
			recent_latencies_ms: VecDeque::with_capacity(RECENT_LATENCIES_CAPACITY),
		}
	}

	pub fn push_latency_sample(&mut self, ms: u32) {
		if self.recent_latencies_ms.len() == RECENT_LATENCIES_CAPACITY {
			self.recent_latencies_ms.pop_front();
		}
		self.recent_latencies_ms.push_back(ms);
	}
}

/// Result of one measurement attempt through a candidate.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
	pub ok: bool,
	pub latency_ms: Option<u32>,
	pub anonymity: Option<Anonymity>,
	pub https_capable: Option<bool>,
	pub error: Option<crate::error::ValidationError>,
	pub checked_at: DateTime<Utc>,
}

impl ValidationOutcome {
	pub fn success(latency_ms: u32, anonymity: Anonymity, https_capable: bool, now: DateTime<Utc>) -> Self {
		Self {
			ok: true,
			latency_ms: Some(latency_ms),
			anonymity: Some(anonymity),
			https_capable: Some(https_capable),
			error: None,
			checked_at: now,
		}
	}

	pub fn failure(error: crate::error::ValidationError, now: DateTime<Utc>) -> Self {
		Self {
			ok: false,
			latency_ms: None,
			anonymity: None,
			https_capable: None,
			error: Some(error),
			checked_at: now,
		}
	}
}

/// Filter fields accepted by the Selector.
#[derive(Debug, Clone, Default)]
pub struct SelectorFilter {
	pub protocol: Option<Protocol>,
	pub anonymity_at_least: Option<Anonymity>,
	pub country: Option<String>,
	pub https_required: bool,
	pub max_latency_ms: Option<u32>,
	pub exclude_ids: Vec<ProxyKey>,
}

impl SelectorFilter {
	pub fn matches(&self, node: &ProxyNode) -> bool {
		if let Some(p) = self.protocol {
			if node.key.protocol != p {
				return false;
			}
		}
		if let Some(min) = self.anonymity_at_least {
			if node.anonymity < min {
				return false;
			}
		}
		if let Some(country) = &self.country {
			if node.country.as_deref() != Some(country.as_str()) {
				return false;
			}
		}
		if self.https_required && !node.https_capable {
			return false;
		}
		if let Some(max_latency) = self.max_latency_ms {
			match node.response_time_ms {
				Some(rt) if rt <= max_latency => {},
				_ => return false,
			}
		}
		if self.exclude_ids.contains(&node.key) {
			return false;
		}
		true
	}
}

/// `stats()` response.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
	pub per_tier_count: std::collections::BTreeMap<String, usize>,
	pub avg_score: f64,
	pub fetch_cycles_completed: u64,
	pub validation_success_rate_1h: f64,
	pub adapter_success_rate: std::collections::BTreeMap<String, f64>,
}
