//! Response cache backed by the shared store.
//!
//! Entries are keyed by [`CacheKey`] and stored as JSON with a base64 body. Writes obey a fixed
//! policy: statuses at or above 400 are never stored, `Cache-Control: no-store`/`no-cache` skip the
//! write, and `max-age=N` overrides the caller's TTL (`max-age=0` skips). Entries expire through
//! the store's TTL; [`ResponseCache::invalidate`] busts a whole domain at once.

pub mod key;

pub use key::*;

// self
use crate::{
	_prelude::*,
	config::GuardConfig,
	domain::Domain,
	http::{CACHE_CONTROL, Method, TransportResponse},
	obs::trace_event,
	store::{KeySpace, SharedStore, StoreError},
};

/// Response persisted in the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
	/// HTTP status code.
	pub status: u16,
	/// Response headers keyed by lower-case name.
	pub headers: BTreeMap<String, String>,
	/// Raw response body.
	#[serde(with = "base64_body")]
	pub body: Vec<u8>,
	/// When the entry was written.
	#[serde(with = "time::serde::timestamp")]
	pub cached_at: OffsetDateTime,
}
impl CachedResponse {
	/// Captures `response` as a cache entry stamped at `cached_at`.
	pub fn capture(response: &TransportResponse, cached_at: OffsetDateTime) -> Self {
		Self {
			status: response.status,
			headers: response.headers.clone(),
			body: response.body.clone(),
			cached_at,
		}
	}

	fn encode(&self) -> Result<String, StoreError> {
		serde_json::to_string(self).map_err(|e| StoreError::Serialization {
			message: format!("Failed to encode cached response: {e}"),
		})
	}
}
impl From<CachedResponse> for TransportResponse {
	fn from(cached: CachedResponse) -> Self {
		Self { status: cached.status, headers: cached.headers, body: cached.body }
	}
}

/// Decision taken by [`ResponseCache::set`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheWrite {
	/// Entry written with the given TTL.
	Stored {
		/// Effective TTL after applying `max-age`.
		ttl: Duration,
	},
	/// Status at or above 400; never cached.
	SkippedStatus {
		/// Rejected status code.
		status: u16,
	},
	/// `Cache-Control` forbids storing (`no-store`, `no-cache`, or `max-age=0`).
	SkippedDirective,
}
impl CacheWrite {
	/// Returns true when an entry was written.
	pub fn is_stored(&self) -> bool {
		matches!(self, Self::Stored { .. })
	}
}

/// Key-normalized cache of successful responses.
#[derive(Clone)]
pub struct ResponseCache {
	store: Arc<dyn SharedStore>,
	keys: KeySpace,
	templates: PathTemplates,
	default_ttl: Duration,
}
impl ResponseCache {
	/// Creates a cache using the key space, slug collections, and default TTL from `config`.
	pub fn new(store: Arc<dyn SharedStore>, config: &GuardConfig) -> Self {
		Self {
			store,
			keys: config.key_space(),
			templates: PathTemplates::new(config.slug_collections.iter().cloned()),
			default_ttl: Duration::seconds(i64::try_from(config.cache_ttl_secs).unwrap_or(i64::MAX)),
		}
	}

	/// TTL applied when neither the caller nor `max-age` supplies one.
	pub fn default_ttl(&self) -> Duration {
		self.default_ttl
	}

	/// Builds the normalized key for a request.
	pub fn key(&self, method: Method, url: &Url, body: Option<&[u8]>) -> Result<CacheKey> {
		self.templates.key(&self.keys, method, url, body)
	}

	/// Returns the fresh entry for `key`, if any.
	///
	/// Entries that no longer decode are removed and reported as misses.
	pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
		let Some(raw) = self.store.get(key.as_str()).await? else {
			return Ok(None);
		};

		let Ok(entry) = serde_json::from_str::<CachedResponse>(&raw) else {
			trace_event!(warn, key = %key, "dropping undecodable cache entry");

			self.store.delete(key.as_str()).await?;

			return Ok(None);
		};

		Ok(Some(entry))
	}

	/// Stores `response` under `key` when the write policy allows it.
	pub async fn set(
		&self,
		key: &CacheKey,
		response: &TransportResponse,
		ttl: Option<Duration>,
	) -> Result<CacheWrite> {
		if response.status >= 400 {
			return Ok(CacheWrite::SkippedStatus { status: response.status });
		}

		let ttl = match CacheDirectives::parse(response.header(CACHE_CONTROL)) {
			CacheDirectives { no_store: true, .. } => return Ok(CacheWrite::SkippedDirective),
			CacheDirectives { max_age: Some(max_age), .. } if max_age.is_zero() =>
				return Ok(CacheWrite::SkippedDirective),
			CacheDirectives { max_age: Some(max_age), .. } => max_age,
			CacheDirectives { max_age: None, .. } => ttl.unwrap_or(self.default_ttl),
		};

		if !ttl.is_positive() {
			return Ok(CacheWrite::SkippedDirective);
		}

		let entry = CachedResponse::capture(response, OffsetDateTime::now_utc()).encode()?;

		self.store.set(key.as_str(), entry, Some(ttl)).await?;

		Ok(CacheWrite::Stored { ttl })
	}

	/// Removes every cached entry for `domain`, returning the number removed.
	pub async fn invalidate(&self, domain: &Domain) -> Result<u64> {
		let removed = self.store.delete_prefix(&self.keys.cache_prefix(domain)).await?;

		trace_event!(info, domain = %domain, removed, "cache invalidated");

		Ok(removed)
	}

	/// Removes cached entries for one endpoint template of `domain`, e.g. `/users/:slug`.
	pub async fn invalidate_template(&self, domain: &Domain, template: &str) -> Result<u64> {
		let prefix = format!("{}{template}:", self.keys.cache_prefix(domain));

		Ok(self.store.delete_prefix(&prefix).await?)
	}
}
impl Debug for ResponseCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ResponseCache")
			.field("keys", &self.keys)
			.field("templates", &self.templates)
			.field("default_ttl", &self.default_ttl)
			.finish()
	}
}

#[derive(Debug, Default)]
struct CacheDirectives {
	no_store: bool,
	max_age: Option<Duration>,
}
impl CacheDirectives {
	fn parse(header: Option<&str>) -> Self {
		let mut directives = Self::default();

		for directive in header.unwrap_or_default().split(',') {
			let directive = directive.trim().to_ascii_lowercase();
			let (name, value) = match directive.split_once('=') {
				Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
				None => (directive.as_str(), None),
			};

			match (name, value) {
				// `no-cache="set-cookie"` still forbids reuse without revalidation.
				("no-store" | "no-cache", _) => directives.no_store = true,
				("max-age", Some(value)) =>
					if let Ok(secs) = value.parse::<i64>() {
						directives.max_age = Some(Duration::seconds(secs.max(0)));
					},
				_ => {},
			}
		}

		directives
	}
}

mod base64_body {
	// crates.io
	use base64::{Engine as _, engine::general_purpose::STANDARD};
	use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

	pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&STANDARD.encode(body))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;

		STANDARD.decode(raw).map_err(D::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::time::Duration as StdDuration;
	// self
	use super::*;
	use crate::store::MemoryStore;

	fn cache(store: Arc<MemoryStore>) -> ResponseCache {
		ResponseCache::new(store, &GuardConfig::default())
	}

	fn url(raw: &str) -> Url {
		Url::parse(raw).expect("URL fixture should parse.")
	}

	fn get_key(cache: &ResponseCache, raw: &str) -> CacheKey {
		cache.key(Method::Get, &url(raw), None).expect("Key should build.")
	}

	fn ok(body: &str) -> TransportResponse {
		TransportResponse::new(200, [("Content-Type", "application/json")], body)
	}

	#[tokio::test]
	async fn set_then_get_returns_equal_payload_until_invalidated() {
		let cache = cache(Arc::new(MemoryStore::default()));
		let key = get_key(&cache, "https://api.example.com/clip/7");
		let response = ok(r#"{"id":7}"#);
		let write = cache.set(&key, &response, None).await.expect("Write should succeed.");

		assert_eq!(write, CacheWrite::Stored { ttl: Duration::seconds(300) });

		let hit = cache.get(&key).await.expect("Read should succeed.").expect("Entry should exist.");

		assert_eq!(TransportResponse::from(hit), response);
		assert_eq!(cache.invalidate(key.domain()).await.expect("Invalidate should succeed."), 1);
		assert!(cache.get(&key).await.expect("Read should succeed.").is_none());
	}

	#[tokio::test]
	async fn entries_expire_after_ttl() {
		let cache = cache(Arc::new(MemoryStore::default()));
		let key = get_key(&cache, "https://api.example.com/clip/8");

		cache.set(&key, &ok("{}"), Some(Duration::seconds(1))).await.expect("Write should succeed.");

		assert!(cache.get(&key).await.expect("Read should succeed.").is_some());

		tokio::time::sleep(StdDuration::from_millis(1_100)).await;

		assert!(cache.get(&key).await.expect("Read should succeed.").is_none());
	}

	#[tokio::test]
	async fn error_statuses_and_directives_are_never_stored() {
		let store = Arc::new(MemoryStore::default());
		let cache = cache(store.clone());
		let key = get_key(&cache, "https://api.example.com/clip/9");

		for status in [400, 404, 429, 500, 503] {
			let response = TransportResponse::new(status, Vec::<(String, String)>::new(), "{}");

			assert_eq!(
				cache.set(&key, &response, None).await.expect("Write should succeed."),
				CacheWrite::SkippedStatus { status }
			);
		}
		let directives = ["no-store", "private, no-cache", "max-age=0", r#"no-cache="set-cookie""#];

		for directive in directives {
			let response = TransportResponse::new(200, [("Cache-Control", directive)], "{}");

			assert_eq!(
				cache.set(&key, &response, None).await.expect("Write should succeed."),
				CacheWrite::SkippedDirective
			);
		}

		assert!(store.is_empty());
	}

	#[tokio::test]
	async fn max_age_overrides_caller_ttl() {
		let cache = cache(Arc::new(MemoryStore::default()));
		let key = get_key(&cache, "https://api.example.com/clip/10");
		let response = TransportResponse::new(200, [("cache-control", "public, max-age=42")], "{}");
		let write = cache
			.set(&key, &response, Some(Duration::seconds(5)))
			.await
			.expect("Write should succeed.");

		assert_eq!(write, CacheWrite::Stored { ttl: Duration::seconds(42) });
	}

	#[tokio::test]
	async fn distinct_post_bodies_cache_independently() {
		let cache = cache(Arc::new(MemoryStore::default()));
		let target = url("https://api.example.com/v1/search");
		let rust =
			cache.key(Method::Post, &target, Some(br#"{"q":"rust"}"#)).expect("Key should build.");
		let go = cache.key(Method::Post, &target, Some(br#"{"q":"go"}"#)).expect("Key should build.");

		cache.set(&rust, &ok(r#"["rust"]"#), None).await.expect("Write should succeed.");
		cache.set(&go, &ok(r#"["go"]"#), None).await.expect("Write should succeed.");

		let rust_hit = cache.get(&rust).await.expect("Read should succeed.").expect("Rust hit.");
		let go_hit = cache.get(&go).await.expect("Read should succeed.").expect("Go hit.");

		assert_eq!(rust_hit.body, br#"["rust"]"#);
		assert_eq!(go_hit.body, br#"["go"]"#);
	}

	#[tokio::test]
	async fn template_invalidation_spares_other_endpoints() {
		let cache = cache(Arc::new(MemoryStore::default()));
		let profile = get_key(&cache, "https://api.example.com/profiles/jane");
		let clip = get_key(&cache, "https://api.example.com/clip/11");

		cache.set(&profile, &ok("{}"), None).await.expect("Write should succeed.");
		cache.set(&clip, &ok("{}"), None).await.expect("Write should succeed.");

		let removed = cache
			.invalidate_template(profile.domain(), "/profiles/:slug")
			.await
			.expect("Invalidate should succeed.");

		assert_eq!(removed, 1);
		assert!(cache.get(&profile).await.expect("Read should succeed.").is_none());
		assert!(cache.get(&clip).await.expect("Read should succeed.").is_some());
	}

	#[tokio::test]
	async fn undecodable_entries_are_dropped() {
		let store = Arc::new(MemoryStore::default());
		let cache = cache(store.clone());
		let key = get_key(&cache, "https://api.example.com/clip/12");

		store.set(key.as_str(), "not json".into(), None).await.expect("Seed should succeed.");

		assert!(cache.get(&key).await.expect("Read should succeed.").is_none());
		assert!(store.is_empty());
	}
}
