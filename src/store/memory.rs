//! Thread-safe in-memory [`SharedStore`] implementation for single-process deployments and tests.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	store::{CompareAndSwapOutcome, SharedStore, StoreEntry, StoreError, StoreFuture, parse_counter},
};

type StoreMap = Arc<RwLock<HashMap<String, StoreEntry>>>;

/// Storage backend that keeps entries in-process.
///
/// Expired entries are hidden from reads immediately and swept from the map every
/// [`MemoryStore::PURGE_EVERY_WRITES`] writes, so caching many distinct keys does not grow the map
/// without bound.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
	map: StoreMap,
	writes: Arc<AtomicU64>,
}
impl MemoryStore {
	/// Number of writes between two sweeps of expired entries.
	pub const PURGE_EVERY_WRITES: u64 = 512;

	/// Number of live (unexpired) entries.
	pub fn len(&self) -> usize {
		let now = OffsetDateTime::now_utc();

		self.map.read().values().filter(|entry| !entry.is_expired_at(now)).count()
	}

	/// Number of stored entries, expired ones included.
	pub fn raw_len(&self) -> usize {
		self.map.read().len()
	}

	/// Returns true when no live entries remain.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops every expired entry, returning how many were removed.
	pub fn purge_expired(&self) -> usize {
		let now = OffsetDateTime::now_utc();
		let mut guard = self.map.write();
		let before = guard.len();

		guard.retain(|_, entry| !entry.is_expired_at(now));

		before - guard.len()
	}

	fn note_write(&self) {
		let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;

		if writes % Self::PURGE_EVERY_WRITES == 0 {
			self.purge_expired();
		}
	}

	fn get_now(map: &StoreMap, key: &str) -> Option<String> {
		let now = OffsetDateTime::now_utc();

		map.read().get(key).filter(|entry| !entry.is_expired_at(now)).map(|entry| entry.value.clone())
	}

	fn delete_now(map: &StoreMap, key: &str) -> bool {
		let now = OffsetDateTime::now_utc();

		map.write().remove(key).is_some_and(|entry| !entry.is_expired_at(now))
	}

	fn delete_prefix_now(map: &StoreMap, prefix: &str) -> u64 {
		let now = OffsetDateTime::now_utc();
		let mut removed = 0;

		map.write().retain(|key, entry| {
			if !key.starts_with(prefix) {
				return true;
			}
			if !entry.is_expired_at(now) {
				removed += 1;
			}

			false
		});

		removed
	}

	fn increment_now(map: &StoreMap, key: &str, delta: i64) -> Result<i64, StoreError> {
		let now = OffsetDateTime::now_utc();
		let mut guard = map.write();
		let (current, expires_at) = match guard.get(key) {
			Some(entry) if !entry.is_expired_at(now) =>
				(parse_counter(key, &entry.value)?, entry.expires_at),
			_ => (0, None),
		};
		let next = current.saturating_add(delta);

		guard.insert(key.to_owned(), StoreEntry { value: next.to_string(), expires_at });

		Ok(next)
	}

	fn cas_now(
		map: &StoreMap,
		key: &str,
		expected: Option<&str>,
		replacement: String,
		ttl: Option<Duration>,
	) -> CompareAndSwapOutcome {
		let now = OffsetDateTime::now_utc();
		let mut guard = map.write();
		let current =
			guard.get(key).filter(|entry| !entry.is_expired_at(now)).map(|entry| entry.value.as_str());

		if current != expected {
			return CompareAndSwapOutcome::Mismatch;
		}

		guard.insert(key.to_owned(), StoreEntry::new(replacement, ttl, now));

		CompareAndSwapOutcome::Updated
	}
}
impl SharedStore for MemoryStore {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		Box::pin(async move { Ok(Self::get_now(&self.map, key)) })
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let entry = StoreEntry::new(value, ttl, OffsetDateTime::now_utc());

			self.map.write().insert(key.to_owned(), entry);
			self.note_write();

			Ok(())
		})
	}

	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
		Box::pin(async move { Ok(Self::delete_now(&self.map, key)) })
	}

	fn delete_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64> {
		Box::pin(async move { Ok(Self::delete_prefix_now(&self.map, prefix)) })
	}

	fn increment<'a>(&'a self, key: &'a str, delta: i64) -> StoreFuture<'a, i64> {
		Box::pin(async move {
			let count = Self::increment_now(&self.map, key, delta)?;

			self.note_write();

			Ok(count)
		})
	}

	fn compare_and_swap<'a>(
		&'a self,
		key: &'a str,
		expected: Option<&'a str>,
		replacement: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move {
			let outcome = Self::cas_now(&self.map, key, expected, replacement, ttl);

			if outcome == CompareAndSwapOutcome::Updated {
				self.note_write();
			}

			Ok(outcome)
		})
	}
}
