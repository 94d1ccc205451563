// self
use crate::obs::CallResult;

/// Records a call outcome via the global metrics recorder (when enabled).
pub fn record_call_outcome(result: CallResult) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!("upstream_guard_call_total", "outcome" => result.as_str()).increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = result;
	}
}

/// Records a single transport attempt (when enabled).
///
/// Labeled by status only so the series count stays bounded however many remotes are called.
pub fn record_attempt(status: Option<u16>) {
	#[cfg(feature = "metrics")]
	{
		let status = status.map_or_else(|| "none".to_owned(), |status| status.to_string());

		metrics::counter!("upstream_guard_attempt_total", "status" => status).increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = status;
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::ErrorKind;

	#[test]
	fn recorders_noop_without_metrics() {
		record_call_outcome(CallResult::Failure(ErrorKind::Timeout));
		record_attempt(Some(200));
		record_attempt(None);
	}
}
