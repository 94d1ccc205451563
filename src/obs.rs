//! Observability helpers for guarded calls.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to run every call inside an `upstream_guard.call` span carrying the `domain`
//!   and `method` fields, and to emit events on state transitions (circuit opened, rate limited,
//!   timeout backoff).
//! - Enable `metrics` to increment the `upstream_guard_call_total` counter once per call, labeled
//!   by `outcome`, and `upstream_guard_attempt_total` once per transport attempt, labeled by
//!   `status`.
//!
//! The [`OutcomeSink`] hook is always available and receives one [`CallOutcome`] per attempt.

mod metrics;
mod sink;
mod tracing;

pub use metrics::*;
pub use sink::*;
pub use tracing::*;

// self
use crate::{_prelude::*, error::ErrorKind};

/// Emits a `tracing` event when the feature is enabled; expands to nothing otherwise.
macro_rules! trace_event {
	($level:ident, $($arg:tt)+) => {{
		#[cfg(feature = "tracing")]
		::tracing::$level!($($arg)+);
	}};
}
pub(crate) use trace_event;

/// Final outcome of a guarded call, used as a metric label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallResult {
	/// Served from the response cache without touching the remote.
	CacheHit,
	/// Remote answered successfully.
	Success,
	/// Call failed with the given classification.
	Failure(ErrorKind),
}
impl CallResult {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			CallResult::CacheHit => "cache_hit",
			CallResult::Success => "success",
			CallResult::Failure(kind) => kind.as_str(),
		}
	}
}
impl Display for CallResult {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
impl From<&Error> for CallResult {
	fn from(err: &Error) -> Self {
		Self::Failure(err.kind())
	}
}
