//! Request and response types for [`Guard::call`](crate::guard::Guard::call).

// std
use std::time::Duration as StdDuration;
// crates.io
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	cache::CachedResponse,
	error::ConfigError,
	http::{Method, OutboundRequest, TransportResponse},
};

/// Per-call cache behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheOptions {
	/// Whether to read from and write to the response cache.
	pub use_cache: bool,
	/// TTL override; falls back to the guard's default when unset.
	pub ttl: Option<Duration>,
}
impl Default for CacheOptions {
	fn default() -> Self {
		Self { use_cache: true, ttl: None }
	}
}

/// Outbound call accepted by the guard.
#[derive(Clone, Debug)]
pub struct CallRequest {
	/// Absolute request URL; its host selects the rate and circuit state.
	pub url: Url,
	/// HTTP method.
	pub method: Method,
	/// Request headers.
	pub headers: BTreeMap<String, String>,
	/// Optional request body, also hashed into the cache key.
	pub body: Option<Vec<u8>>,
	/// Maximum number of attempts, including the first.
	pub max_retries: u32,
	/// Per-attempt timeout; not cumulative across retries.
	pub timeout: StdDuration,
	/// Cancellation honored until the transport call begins.
	pub cancel: Option<CancellationToken>,
	/// Cache behavior.
	pub cache: CacheOptions,
}
impl CallRequest {
	/// Attempts allowed when the caller does not override them.
	pub const DEFAULT_MAX_RETRIES: u32 = 3;
	/// Per-attempt timeout used when the caller does not override it.
	pub const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(10);

	/// Creates a request with default retries, timeout, and caching.
	pub fn new(method: Method, url: Url) -> Self {
		Self {
			url,
			method,
			headers: BTreeMap::new(),
			body: None,
			max_retries: Self::DEFAULT_MAX_RETRIES,
			timeout: Self::DEFAULT_TIMEOUT,
			cancel: None,
			cache: CacheOptions::default(),
		}
	}

	/// Shorthand for a `GET` request.
	pub fn get(url: Url) -> Self {
		Self::new(Method::Get, url)
	}

	/// Shorthand for a `POST` request.
	pub fn post(url: Url) -> Self {
		Self::new(Method::Post, url)
	}

	/// Adds or replaces a header.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.insert(name.into(), value.into());

		self
	}

	/// Sets the raw request body.
	pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
		self.body = Some(body.into());

		self
	}

	/// Serializes `value` as the JSON body and sets `content-type`.
	pub fn with_json<T>(self, value: &T) -> Result<Self, serde_json::Error>
	where
		T: ?Sized + Serialize,
	{
		let body = serde_json::to_vec(value)?;

		Ok(self.with_header("content-type", "application/json").with_body(body))
	}

	/// Overrides the attempt budget; values below 1 are treated as 1.
	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;

		self
	}

	/// Overrides the per-attempt timeout.
	pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Attaches a cancellation token.
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);

		self
	}

	/// Overrides the cache TTL for this call.
	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.cache.ttl = Some(ttl);

		self
	}

	/// Bypasses the response cache for both reads and writes.
	pub fn without_cache(mut self) -> Self {
		self.cache.use_cache = false;

		self
	}

	pub(crate) fn attempts(&self) -> u32 {
		self.max_retries.max(1)
	}

	pub(crate) fn outbound(&self) -> OutboundRequest {
		OutboundRequest {
			method: self.method,
			url: self.url.clone(),
			headers: self.headers.clone(),
			body: self.body.clone(),
		}
	}
}

/// Successful result of a guarded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResponse {
	/// HTTP status code.
	pub status: u16,
	/// Response headers keyed by lower-case name.
	pub headers: BTreeMap<String, String>,
	/// Raw response body.
	pub body: Vec<u8>,
	/// True when served from the response cache.
	pub from_cache: bool,
}
impl CallResponse {
	/// Looks up a header by case-insensitive name.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
	}

	/// Body decoded as UTF-8, replacing invalid sequences.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	/// Decodes the body as JSON, reporting the failing path on error.
	pub fn json<T>(&self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let mut deserializer = serde_json::Deserializer::from_slice(&self.body);

		serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| ConfigError::Decode { source }.into())
	}
}
impl From<TransportResponse> for CallResponse {
	fn from(response: TransportResponse) -> Self {
		Self {
			status: response.status,
			headers: response.headers,
			body: response.body,
			from_cache: false,
		}
	}
}
impl From<CachedResponse> for CallResponse {
	fn from(cached: CachedResponse) -> Self {
		Self { status: cached.status, headers: cached.headers, body: cached.body, from_cache: true }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[derive(Debug, Deserialize)]
	struct Clip {
		id: u64,
		#[allow(dead_code)]
		title: String,
	}

	fn url() -> Url {
		Url::parse("https://api.example.com/clip/1").expect("URL fixture should parse.")
	}

	#[test]
	fn builder_applies_defaults_and_overrides() {
		let request = CallRequest::get(url());

		assert_eq!(request.max_retries, 3);
		assert_eq!(request.timeout, StdDuration::from_secs(10));
		assert!(request.cache.use_cache);

		let request = CallRequest::post(url())
			.with_json(&serde_json::json!({ "q": "rust" }))
			.expect("JSON body should serialize.")
			.with_max_retries(0)
			.without_cache();
		let outbound = request.outbound();

		assert_eq!(request.attempts(), 1);
		assert!(!request.cache.use_cache);
		assert_eq!(outbound.headers.get("content-type").map(String::as_str), Some("application/json"));
		assert_eq!(outbound.body.as_deref(), Some(br#"{"q":"rust"}"#.as_slice()));
	}

	#[test]
	fn json_decoding_reports_failing_path() {
		let ok = CallResponse::from(TransportResponse::new(
			200,
			Vec::<(String, String)>::new(),
			r#"{"id":1,"title":"intro"}"#,
		));
		let clip = ok.json::<Clip>().expect("Valid body should decode.");

		assert_eq!(clip.id, 1);

		let bad = CallResponse { body: br#"{"id":"one","title":"intro"}"#.to_vec(), ..ok };
		let err = bad.json::<Clip>().expect_err("Mistyped body should fail.");

		match err {
			Error::Config(ConfigError::Decode { source }) => assert_eq!(source.path().to_string(), "id"),
			other => panic!("Unexpected error: {other:?}"),
		}
	}
}
