//! Simple file-backed [`SharedStore`] so rate state survives process restarts on a single host.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	store::{CompareAndSwapOutcome, SharedStore, StoreEntry, StoreError, StoreFuture, parse_counter},
};

/// Persists entries to a JSON file after each mutation.
///
/// Expired entries are skipped on load and pruned on the next write.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	inner: Arc<RwLock<HashMap<String, StoreEntry>>>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;

		let snapshot = if path.exists() { Self::load_snapshot(&path)? } else { HashMap::new() };

		Ok(Self { path, inner: Arc::new(RwLock::new(snapshot)) })
	}

	/// Location of the backing snapshot.
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn load_snapshot(path: &Path) -> Result<HashMap<String, StoreEntry>, StoreError> {
		let metadata = path.metadata().map_err(|e| StoreError::Backend {
			message: format!("Failed to inspect {}: {e}", path.display()),
		})?;

		if metadata.len() == 0 {
			return Ok(HashMap::new());
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;
		let entries: Vec<(String, StoreEntry)> =
			serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
				message: format!("Failed to parse {}: {e}", path.display()),
			})?;
		let now = OffsetDateTime::now_utc();

		Ok(entries.into_iter().filter(|(_, entry)| !entry.is_expired_at(now)).collect())
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	fn persist_locked(&self, contents: &mut HashMap<String, StoreEntry>) -> Result<(), StoreError> {
		let now = OffsetDateTime::now_utc();

		contents.retain(|_, entry| !entry.is_expired_at(now));

		Self::ensure_parent_exists(&self.path)?;

		let snapshot: Vec<_> = contents.iter().collect();
		let serialized =
			serde_json::to_vec_pretty(&snapshot).map_err(|e| StoreError::Serialization {
				message: format!("Failed to serialize store snapshot: {e}"),
			})?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", self.path.display()),
		})
	}

	fn live_value<'m>(
		map: &'m HashMap<String, StoreEntry>,
		key: &str,
		now: OffsetDateTime,
	) -> Option<&'m StoreEntry> {
		map.get(key).filter(|entry| !entry.is_expired_at(now))
	}
}
impl SharedStore for FileStore {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(Self::live_value(&self.inner.read(), key, now).map(|entry| entry.value.clone()))
		})
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.insert(key.to_owned(), StoreEntry::new(value, ttl, OffsetDateTime::now_utc()));
			self.persist_locked(&mut guard)
		})
	}

	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();
			let mut guard = self.inner.write();
			let existed = guard.remove(key).is_some_and(|entry| !entry.is_expired_at(now));

			if existed {
				self.persist_locked(&mut guard)?;
			}

			Ok(existed)
		})
	}

	fn delete_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, u64> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();
			let mut guard = self.inner.write();
			let mut removed = 0;

			guard.retain(|key, entry| {
				if !key.starts_with(prefix) {
					return true;
				}
				if !entry.is_expired_at(now) {
					removed += 1;
				}

				false
			});

			if removed > 0 {
				self.persist_locked(&mut guard)?;
			}

			Ok(removed)
		})
	}

	fn increment<'a>(&'a self, key: &'a str, delta: i64) -> StoreFuture<'a, i64> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();
			let mut guard = self.inner.write();
			let (current, expires_at) = match Self::live_value(&guard, key, now) {
				Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
				None => (0, None),
			};
			let next = current.saturating_add(delta);

			guard.insert(key.to_owned(), StoreEntry { value: next.to_string(), expires_at });
			self.persist_locked(&mut guard)?;

			Ok(next)
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
			let now = OffsetDateTime::now_utc();
			let mut guard = self.inner.write();
			let matches =
				Self::live_value(&guard, key, now).map(|entry| entry.value.as_str()) == expected;

			if !matches {
				return Ok(CompareAndSwapOutcome::Mismatch);
			}

			guard.insert(key.to_owned(), StoreEntry::new(replacement, ttl, now));
			self.persist_locked(&mut guard)?;

			Ok(CompareAndSwapOutcome::Updated)
		})
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{env, process};
	// crates.io
	use tokio::runtime::Runtime;
	// self
	use super::*;

	fn temp_path() -> PathBuf {
		let unique = format!(
			"upstream_guard_file_store_{}_{}.json",
			process::id(),
			OffsetDateTime::now_utc().unix_timestamp_nanos(),
		);

		env::temp_dir().join(unique)
	}

	#[test]
	fn counters_and_flags_survive_reopen() {
		let path = temp_path();
		let store = FileStore::open(&path).expect("Failed to open file store snapshot.");
		let rt = Runtime::new().expect("Failed to build Tokio runtime for file store test.");

		rt.block_on(store.set("svc:rate:example.com:delay", "450".into(), None))
			.expect("Failed to persist delay value.");
		rt.block_on(store.increment("svc:rate:example.com:failures", 2))
			.expect("Failed to increment failure counter.");
		drop(store);

		let reopened = FileStore::open(&path).expect("Failed to reopen file store snapshot.");
		let delay = rt
			.block_on(reopened.get("svc:rate:example.com:delay"))
			.expect("Failed to read delay from reopened store.");
		let failures = rt
			.block_on(reopened.increment("svc:rate:example.com:failures", 1))
			.expect("Failed to increment reopened counter.");

		assert_eq!(delay.as_deref(), Some("450"));
		assert_eq!(failures, 3);

		fs::remove_file(&path).unwrap_or_else(|e| {
			panic!("Failed to remove temporary file store snapshot {}: {e}", path.display())
		});
	}

	#[test]
	fn compare_and_swap_rejects_stale_expectation() {
		let path = temp_path();
		let store = FileStore::open(&path).expect("Failed to open file store snapshot.");
		let rt = Runtime::new().expect("Failed to build Tokio runtime for file store test.");
		let first = rt
			.block_on(store.compare_and_swap("bucket", None, "a".into(), None))
			.expect("Initial CAS should succeed.");
		let stale = rt
			.block_on(store.compare_and_swap("bucket", None, "b".into(), None))
			.expect("Stale CAS should complete.");

		assert_eq!(first, CompareAndSwapOutcome::Updated);
		assert_eq!(stale, CompareAndSwapOutcome::Mismatch);
		assert_eq!(
			rt.block_on(store.get("bucket")).expect("Read should succeed.").as_deref(),
			Some("a")
		);

		fs::remove_file(&path).unwrap_or_else(|e| {
			panic!("Failed to remove temporary file store snapshot {}: {e}", path.display())
		});
	}
}
