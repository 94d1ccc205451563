//! Guard-level error types shared across the store, transport, and call pipeline.

// self
use crate::{_prelude::*, domain::Domain};

/// Guard-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Status reported for failures that never produced an HTTP response.
pub const SYNTHETIC_UNAVAILABLE_STATUS: u16 = 503;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// The domain's circuit breaker is open; no transport attempt was made.
	#[error("Circuit for {domain} is open.")]
	CircuitOpen {
		/// Domain whose circuit is open.
		domain: Domain,
	},
	/// Remote answered 429 Too Many Requests.
	#[error("{domain} rate limited the request.")]
	RateLimited {
		/// Domain that rejected the request.
		domain: Domain,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// The attempt did not complete within its per-attempt timeout.
	#[error("Request to {domain} timed out after {timeout}.")]
	Timeout {
		/// Domain that failed to answer in time.
		domain: Domain,
		/// Per-attempt timeout that elapsed.
		timeout: Duration,
	},
	/// DNS or connection failure; reported with a synthetic service-unavailable status.
	#[error("{domain} is unreachable.")]
	NetworkUnreachable {
		/// Domain that could not be reached.
		domain: Domain,
		/// Underlying transport failure.
		#[source]
		source: TransportError,
	},
	/// Remote answered with a 5xx status, or the transport failed in an unclassified way.
	#[error("{domain} failed with status {status}.")]
	ServerError {
		/// Domain that failed.
		domain: Domain,
		/// HTTP status, or the synthetic unavailable status for unclassified transport failures.
		status: u16,
		/// Short description of the failure.
		message: String,
	},
	/// Remote rejected the request with a 4xx status other than 429.
	#[error("{domain} rejected the request with status {status}.")]
	Rejected {
		/// Domain that rejected the request.
		domain: Domain,
		/// HTTP status code.
		status: u16,
		/// Response body returned alongside the rejection.
		body: Vec<u8>,
	},
	/// The caller cancelled the call before transport began.
	#[error("Call was cancelled.")]
	Cancelled,
	/// Every allowed attempt was used without a successful response.
	#[error("Gave up after {attempts} attempts.")]
	Exhausted {
		/// Number of attempts made.
		attempts: u32,
		/// Classified error from the final attempt.
		#[source]
		last: Box<Error>,
	},
}
impl Error {
	/// Closed classification of this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Storage(_) => ErrorKind::Storage,
			Self::Config(_) => ErrorKind::Config,
			Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
			Self::RateLimited { .. } => ErrorKind::RateLimited,
			Self::Timeout { .. } => ErrorKind::Timeout,
			Self::NetworkUnreachable { .. } => ErrorKind::NetworkUnreachable,
			Self::ServerError { .. } => ErrorKind::ServerError,
			Self::Rejected { .. } => ErrorKind::Rejected,
			Self::Cancelled => ErrorKind::Cancelled,
			Self::Exhausted { .. } => ErrorKind::Exhausted,
		}
	}

	/// HTTP status associated with the failure, synthetic for unreachable remotes.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::RateLimited { .. } => Some(429),
			Self::NetworkUnreachable { .. } => Some(SYNTHETIC_UNAVAILABLE_STATUS),
			Self::ServerError { status, .. } | Self::Rejected { status, .. } => Some(*status),
			Self::Exhausted { last, .. } => last.status(),
			_ => None,
		}
	}

	/// Returns true when the failure counts toward the domain's breaker threshold.
	pub fn counts_as_failure(&self) -> bool {
		self.kind().counts_as_failure()
	}
}

/// Closed set of error classes used for retry dispatch and reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// Remote rate limited the call; retried, not counted.
	RateLimited,
	/// Attempt timed out; retried and counted.
	Timeout,
	/// DNS/connection failure; counted, not retried.
	NetworkUnreachable,
	/// 5xx or unclassified failure; counted, not retried.
	ServerError,
	/// Circuit breaker is open; surfaced immediately.
	CircuitOpen,
	/// Retry budget spent; surfaced immediately.
	Exhausted,
	/// 4xx rejection; counted, not retried.
	Rejected,
	/// Caller cancelled the call.
	Cancelled,
	/// Shared store failure.
	Storage,
	/// Local configuration failure.
	Config,
}
impl ErrorKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::RateLimited => "rate_limited",
			Self::Timeout => "timeout",
			Self::NetworkUnreachable => "network_unreachable",
			Self::ServerError => "server_error",
			Self::CircuitOpen => "circuit_open",
			Self::Exhausted => "exhausted",
			Self::Rejected => "rejected",
			Self::Cancelled => "cancelled",
			Self::Storage => "storage",
			Self::Config => "config",
		}
	}

	/// Returns true when the class is retried inside the call loop.
	pub const fn is_retryable(self) -> bool {
		matches!(self, Self::RateLimited | Self::Timeout)
	}

	/// Returns true when the class increments the domain's failure counter.
	pub const fn counts_as_failure(self) -> bool {
		matches!(
			self,
			Self::Timeout | Self::NetworkUnreachable | Self::ServerError | Self::Rejected
		)
	}
}
impl Display for ErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Configuration and validation failures raised by the guard.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// Request URL does not identify a remote domain.
	#[error("Request URL is invalid.")]
	InvalidUrl(#[from] crate::domain::DomainError),
	/// Environment variable holds an unparsable value.
	#[error("Environment variable {key} has an invalid value `{value}`.")]
	InvalidEnv {
		/// Variable name.
		key: String,
		/// Raw value that failed to parse.
		value: String,
	},
	/// Tunables contradict each other.
	#[error("Invalid guard configuration: {reason}.")]
	InvalidSettings {
		/// Human-readable reason.
		reason: String,
	},
	/// Response body could not be decoded as the requested type.
	#[error("Response body could not be decoded.")]
	Decode {
		/// Structured decoding failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (network, IO) reported by an [`HttpTransport`](crate::http::HttpTransport).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// The attempt exceeded its deadline.
	#[error("Request timed out.")]
	Timeout,
	/// DNS resolution or connection establishment failed.
	#[error("Remote host is unreachable.")]
	Unreachable {
		/// Transport-specific failure.
		#[source]
		source: BoxError,
	},
	/// Underlying HTTP client reported another network failure.
	#[error("Network error occurred while calling the remote host.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the remote host.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a connection or DNS failure.
	pub fn unreachable(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Unreachable { source: Box::new(src) }
	}

	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_timeout() {
			Self::Timeout
		} else if e.is_connect() {
			Self::unreachable(e)
		} else {
			Self::network(e)
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn domain() -> Domain {
		Domain::new("api.example.com").expect("Domain fixture should be valid.")
	}

	#[test]
	fn kinds_encode_retry_and_counting_policy() {
		assert!(ErrorKind::RateLimited.is_retryable());
		assert!(!ErrorKind::RateLimited.counts_as_failure());
		assert!(ErrorKind::Timeout.is_retryable());
		assert!(ErrorKind::Timeout.counts_as_failure());
		assert!(!ErrorKind::ServerError.is_retryable());
		assert!(ErrorKind::ServerError.counts_as_failure());
		assert!(ErrorKind::NetworkUnreachable.counts_as_failure());
		assert!(ErrorKind::Rejected.counts_as_failure());
		assert!(!ErrorKind::Rejected.is_retryable());
		assert!(!ErrorKind::CircuitOpen.counts_as_failure());
	}

	#[test]
	fn unreachable_reports_synthetic_status() {
		let err = Error::NetworkUnreachable {
			domain: domain(),
			source: TransportError::Io(std::io::Error::other("connection refused")),
		};

		assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);
		assert_eq!(err.status(), Some(SYNTHETIC_UNAVAILABLE_STATUS));
	}

	#[test]
	fn exhausted_exposes_last_classification() {
		let err = Error::Exhausted {
			attempts: 3,
			last: Box::new(Error::RateLimited { domain: domain(), retry_after: None }),
		};

		assert_eq!(err.kind(), ErrorKind::Exhausted);
		assert_eq!(err.status(), Some(429));

		let source = StdError::source(&err).expect("Exhausted should expose the last error.");

		assert!(source.to_string().contains("rate limited"));
	}
}
