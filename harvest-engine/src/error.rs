//! Error taxonomy for the engine. Adapter and validator errors are recovered locally (folded into
//! scores/counters); pool and persistence errors are surfaced to an operator channel.
//! Configuration errors are detected at startup only and refuse to start the engine.

use thiserror::Error;

/// The reason a source adapter produced zero nodes for a fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
	/// The source did not respond, or responded with a network-level failure.
	Unreachable,
	/// The source responded but its body could not be parsed into candidates.
	ParseError,
	/// The source signaled (or is configured) to be rate limited for this cycle.
	RateLimited,
	/// The source's known schema no longer matches what came back.
	SchemaDrift,
}

#[derive(Debug, Error, Clone)]
#[error("source {source} failed ({kind:?}): {message}")]
pub struct SourceError {
	pub source: String,
	pub kind: SourceErrorKind,
	pub message: String,
}

impl SourceError {
	pub fn new(source: impl Into<String>, kind: SourceErrorKind, message: impl Into<String>) -> Self {
		Self {
			source: source.into(),
			kind,
			message: message.into(),
		}
	}
}

/// Outcome of a single validation attempt that did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("transport error: {0}")]
	Transport(String),
	#[error("timed out")]
	Timeout,
	#[error("unexpected status {0}")]
	HttpStatus(u16),
	#[error("TLS handshake refused: {0}")]
	TlsHandshake(String),
	#[error("anomalous response body: {0}")]
	BodyAnomaly(String),
	/// Repeated 403s, TLS refusal storms, or a captive-portal-shaped body: an explicit ban
	/// signal rather than a garden-variety failure.
	#[error("explicit ban signal: {0}")]
	BannedSignal(String),
}

impl ValidationError {
	/// Transport and Timeout failures get one fresh-connection retry in the same cycle; everything
	/// else does not.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ValidationError::Transport(_) | ValidationError::Timeout)
	}
}

/// Pool invariant violations are never expected at runtime; if one is detected the engine enters
/// degraded mode (reads continue, writes blocked, operator alerted) rather than panicking.
#[derive(Debug, Error, Clone)]
pub enum PoolError {
	#[error("node {0} observed in more than one tier")]
	InvariantViolated(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("failed to write snapshot: {0}")]
	WriteFailed(String),
	#[error("snapshot is corrupt: {0}")]
	LoadCorrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("{0}")]
	Invalid(String),
}
