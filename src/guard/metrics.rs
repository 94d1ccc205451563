//! Always-on counters for calls made through a guard.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{error::ErrorKind, obs::CallResult};

/// Thread-safe counters for guarded calls.
#[derive(Debug, Default)]
pub struct CallMetrics {
	calls: AtomicU64,
	attempts: AtomicU64,
	success: AtomicU64,
	cache_hits: AtomicU64,
	failure: AtomicU64,
	rate_limited: AtomicU64,
	circuit_open: AtomicU64,
}
impl CallMetrics {
	/// Returns the number of calls started.
	pub fn calls(&self) -> u64 {
		self.calls.load(Ordering::Relaxed)
	}

	/// Returns the number of transport attempts made.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Returns the number of calls answered by the remote.
	pub fn successes(&self) -> u64 {
		self.success.load(Ordering::Relaxed)
	}

	/// Returns the number of calls answered from the cache.
	pub fn cache_hits(&self) -> u64 {
		self.cache_hits.load(Ordering::Relaxed)
	}

	/// Returns the number of calls that ended in an error.
	pub fn failures(&self) -> u64 {
		self.failure.load(Ordering::Relaxed)
	}

	/// Returns the number of 429 responses observed across all attempts.
	pub fn rate_limited(&self) -> u64 {
		self.rate_limited.load(Ordering::Relaxed)
	}

	/// Returns the number of calls refused by an open circuit.
	pub fn circuit_open(&self) -> u64 {
		self.circuit_open.load(Ordering::Relaxed)
	}

	pub(crate) fn record_call(&self) {
		self.calls.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_attempt(&self, kind: Option<ErrorKind>) {
		self.attempts.fetch_add(1, Ordering::Relaxed);

		if kind == Some(ErrorKind::RateLimited) {
			self.rate_limited.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub(crate) fn record_result(&self, result: CallResult) {
		let counter = match result {
			CallResult::CacheHit => &self.cache_hits,
			CallResult::Success => &self.success,
			CallResult::Failure(ErrorKind::CircuitOpen) => {
				self.circuit_open.fetch_add(1, Ordering::Relaxed);

				&self.failure
			},
			CallResult::Failure(_) => &self.failure,
		};

		counter.fetch_add(1, Ordering::Relaxed);
	}
}
