//! Maps raw transport results onto the closed [`Error`] taxonomy.

// std
use std::time::Duration as StdDuration;
// self
use crate::{
	_prelude::*,
	domain::Domain,
	error::{SYNTHETIC_UNAVAILABLE_STATUS, TransportError},
	http::TransportResponse,
};

const MAX_MESSAGE_LEN: usize = 200;

/// Classifies one attempt.
///
/// Statuses below 400 are successes. 429 is [`Error::RateLimited`], other 4xx are
/// [`Error::Rejected`], and 5xx are [`Error::ServerError`]. Transport timeouts become
/// [`Error::Timeout`], connect/DNS failures [`Error::NetworkUnreachable`], and any other transport
/// failure a [`Error::ServerError`] carrying the synthetic unavailable status.
pub(crate) fn classify(
	domain: &Domain,
	timeout: StdDuration,
	result: Result<TransportResponse, TransportError>,
) -> Result<TransportResponse> {
	let domain = domain.clone();

	match result {
		Ok(response) if response.status < 400 => Ok(response),
		Ok(response) if response.status == 429 =>
			Err(Error::RateLimited { domain, retry_after: response.retry_after() }),
		Ok(response) if response.status < 500 =>
			Err(Error::Rejected { domain, status: response.status, body: response.body }),
		Ok(response) => Err(Error::ServerError {
			domain,
			status: response.status,
			message: summarize(&response.body),
		}),
		Err(TransportError::Timeout) => Err(Error::Timeout {
			domain,
			timeout: Duration::try_from(timeout).unwrap_or(Duration::MAX),
		}),
		Err(source @ TransportError::Unreachable { .. }) =>
			Err(Error::NetworkUnreachable { domain, source }),
		Err(source) => Err(Error::ServerError {
			domain,
			status: SYNTHETIC_UNAVAILABLE_STATUS,
			message: source.to_string(),
		}),
	}
}

fn summarize(body: &[u8]) -> String {
	let text = String::from_utf8_lossy(body);
	let text = text.trim();

	match text.char_indices().nth(MAX_MESSAGE_LEN) {
		Some((cut, _)) => format!("{}...", &text[..cut]),
		None => text.to_owned(),
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::ErrorKind;

	fn domain() -> Domain {
		Domain::new("classify.example.com").expect("Domain fixture should be valid.")
	}

	fn status(status: u16) -> Result<TransportResponse, TransportError> {
		Ok(TransportResponse::new(status, [("Retry-After", "2")], "upstream said no"))
	}

	fn kind(result: Result<TransportResponse, TransportError>) -> Option<ErrorKind> {
		classify(&domain(), StdDuration::from_secs(1), result).err().map(|e| e.kind())
	}

	#[test]
	fn statuses_map_to_closed_kinds() {
		assert_eq!(kind(status(200)), None);
		assert_eq!(kind(status(304)), None);
		assert_eq!(kind(status(429)), Some(ErrorKind::RateLimited));
		assert_eq!(kind(status(404)), Some(ErrorKind::Rejected));
		assert_eq!(kind(status(500)), Some(ErrorKind::ServerError));
		assert_eq!(kind(status(503)), Some(ErrorKind::ServerError));
	}

	#[test]
	fn transport_failures_map_to_closed_kinds() {
		let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
		let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");

		assert_eq!(kind(Err(TransportError::Timeout)), Some(ErrorKind::Timeout));
		assert_eq!(
			kind(Err(TransportError::unreachable(refused))),
			Some(ErrorKind::NetworkUnreachable)
		);
		assert_eq!(kind(Err(TransportError::Io(reset))), Some(ErrorKind::ServerError));
	}

	#[test]
	fn rate_limit_keeps_retry_hint_and_server_errors_keep_body() {
		let limited = classify(&domain(), StdDuration::from_secs(1), status(429))
			.expect_err("429 should be an error.");

		assert!(matches!(limited, Error::RateLimited { retry_after: Some(d), .. } if d == Duration::seconds(2)));

		let failed = classify(&domain(), StdDuration::from_secs(1), status(502))
			.expect_err("502 should be an error.");

		assert!(matches!(failed, Error::ServerError { status: 502, ref message, .. } if message == "upstream said no"));
	}
}
