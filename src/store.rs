//! Shared key-value store contract and the built-in store implementations.
//!
//! Every piece of cross-process state the guard keeps (adaptive delays, failure counters,
//! circuit flags, token buckets, cached responses) lives behind [`SharedStore`]. Values are
//! plain strings so adapters for Redis-like backends stay trivial, and expiry is expressed as
//! an optional relative TTL that the backend enforces natively.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, domain::Domain};

/// Boxed future returned by [`SharedStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend contract visible to every process instance.
pub trait SharedStore
where
	Self: Send + Sync,
{
	/// Fetches the live value stored under `key`, if any.
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

	/// Stores `value` under `key`, replacing any previous value and expiry.
	fn set<'a>(&'a self, key: &'a str, value: String, ttl: Option<Duration>)
	-> StoreFuture<'a, ()>;

	/// Removes `key`, returning whether a live value existed.
	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

	/// Removes every key starting with `prefix`, returning how many were removed.
	fn delete_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64>;

	/// Atomically adds `delta` to the integer stored under `key` (missing counts as zero).
	///
	/// The existing expiry is preserved.
	fn increment<'a>(&'a self, key: &'a str, delta: i64) -> StoreFuture<'a, i64>;

	/// Atomically replaces the value under `key` if it still equals `expected`.
	///
	/// `expected = None` asserts the key is absent (or expired).
	fn compare_and_swap<'a>(
		&'a self,
		key: &'a str,
		expected: Option<&'a str>,
		replacement: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;
}

/// Result of a compare-and-swap attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareAndSwapOutcome {
	/// The stored value matched and was replaced.
	Updated,
	/// Another writer changed the value first.
	Mismatch,
}

/// Error type produced by [`SharedStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend or by value decoding.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// A counter held a value that is not an integer.
	#[error("Value under {key} is not an integer.")]
	NotAnInteger {
		/// Offending key.
		key: String,
	},
}

/// Stored value plus its absolute expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
	/// Raw value.
	pub value: String,
	/// Instant after which the entry is treated as absent.
	#[serde(with = "time::serde::timestamp::option")]
	pub expires_at: Option<OffsetDateTime>,
}
impl StoreEntry {
	/// Builds an entry expiring `ttl` after `now`.
	pub fn new(value: String, ttl: Option<Duration>, now: OffsetDateTime) -> Self {
		Self { value, expires_at: ttl.map(|ttl| now + ttl) }
	}

	/// Returns true once the entry's expiry has passed.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		self.expires_at.is_some_and(|at| at <= now)
	}
}

/// Builds the namespaced keys the guard reads and writes.
///
/// Rate and circuit keys live under `<prefix>:rate:<domain>:`, bucket state under
/// `<prefix>:bucket:<domain>`, and cached responses under `<prefix>:cache:<domain>:` so a
/// cache invalidation never touches rate state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySpace {
	prefix: String,
}
impl KeySpace {
	/// Creates a key space rooted at `prefix`.
	pub fn new(prefix: impl Into<String>) -> Self {
		Self { prefix: prefix.into() }
	}

	/// Root prefix shared by every key.
	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	/// Adaptive delay in milliseconds.
	pub fn delay(&self, domain: &Domain) -> String {
		self.rate(domain, "delay")
	}

	/// Consecutive non-transient failure counter.
	pub fn failures(&self, domain: &Domain) -> String {
		self.rate(domain, "failures")
	}

	/// Success counter shaping the delay decrease step.
	pub fn successes(&self, domain: &Domain) -> String {
		self.rate(domain, "successes")
	}

	/// Expiring circuit-open flag.
	pub fn circuit(&self, domain: &Domain) -> String {
		self.rate(domain, "circuit")
	}

	/// Token bucket state.
	pub fn bucket(&self, domain: &Domain) -> String {
		format!("{}:bucket:{domain}", self.prefix)
	}

	/// Prefix covering every cached response for `domain`.
	pub fn cache_prefix(&self, domain: &Domain) -> String {
		format!("{}:cache:{domain}:", self.prefix)
	}

	fn rate(&self, domain: &Domain, field: &str) -> String {
		format!("{}:rate:{domain}:{field}", self.prefix)
	}
}
impl Default for KeySpace {
	fn default() -> Self {
		Self::new("upstream_guard")
	}
}

pub(crate) fn parse_counter(key: &str, raw: &str) -> Result<i64, StoreError> {
	raw.trim().parse().map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })
}
