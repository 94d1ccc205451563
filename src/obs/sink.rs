// self
use crate::{_prelude::*, domain::Domain, error::ErrorKind};

/// Record of a single transport attempt, success or failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
	/// Requested URL.
	pub url: Url,
	/// Domain the URL belongs to.
	pub domain: Domain,
	/// 1-based attempt number within the call.
	pub attempt: u32,
	/// Adaptive delay slept before the attempt, before jitter.
	pub delay_ms: u64,
	/// HTTP status, synthetic for unreachable remotes, absent for timeouts.
	pub status: Option<u16>,
	/// Classification of a failed attempt.
	pub kind: Option<ErrorKind>,
	/// Failure description; absent on success.
	pub message: Option<String>,
	/// When the attempt finished.
	#[serde(with = "time::serde::timestamp")]
	pub timestamp: OffsetDateTime,
}
impl CallOutcome {
	/// Returns true when the attempt produced a usable response.
	pub fn is_success(&self) -> bool {
		self.kind.is_none()
	}
}

/// Receiver of per-attempt outcomes.
///
/// Called inline on the request path, so implementations should hand work off rather than block.
pub trait OutcomeSink
where
	Self: Send + Sync,
{
	/// Receives the outcome of one attempt.
	fn on_call_outcome(&self, outcome: &CallOutcome);
}
impl<F> OutcomeSink for F
where
	F: Fn(&CallOutcome) + Send + Sync,
{
	fn on_call_outcome(&self, outcome: &CallOutcome) {
		self(outcome)
	}
}

/// Sink that discards every outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;
impl OutcomeSink for NoopSink {
	fn on_call_outcome(&self, _: &CallOutcome) {}
}

/// Sink that keeps every outcome in memory, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink(Arc<Mutex<Vec<CallOutcome>>>);
impl RecordingSink {
	/// Copies the outcomes recorded so far.
	pub fn outcomes(&self) -> Vec<CallOutcome> {
		self.0.lock().clone()
	}

	/// Number of outcomes recorded so far.
	pub fn len(&self) -> usize {
		self.0.lock().len()
	}

	/// Returns true when nothing has been recorded.
	pub fn is_empty(&self) -> bool {
		self.0.lock().is_empty()
	}
}
impl OutcomeSink for RecordingSink {
	fn on_call_outcome(&self, outcome: &CallOutcome) {
		self.0.lock().push(outcome.clone());
	}
}
