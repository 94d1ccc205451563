//! Transport primitives for guarded calls.
//!
//! The module exposes [`HttpTransport`] alongside the crate-owned [`OutboundRequest`] and
//! [`TransportResponse`] types so downstream crates can plug in any HTTP stack. The guard only
//! needs a status code, the response headers, and the body bytes; classification of timeouts and
//! connection failures happens through [`TransportError`].

// std
#[cfg(feature = "reqwest")] use std::ops::Deref;
use std::time::Duration as StdDuration;
// crates.io
use time::format_description::well_known::Rfc2822;
// self
use crate::{_prelude::*, error::TransportError};

/// Header carrying the remote's remaining request quota.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the remote's retry hint on 429 responses.
pub const RETRY_AFTER: &str = "retry-after";
/// Header carrying caching directives.
pub const CACHE_CONTROL: &str = "cache-control";

/// Boxed future returned by [`HttpTransport::execute`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + 'a + Send>>;

/// Abstraction over HTTP stacks capable of executing one outbound request.
///
/// The trait is the guard's only dependency on an HTTP client. Implementations must be
/// `Send + Sync + 'static` so one transport can be shared by every call, and should map their
/// native errors onto [`TransportError`]: deadline overruns to [`TransportError::Timeout`],
/// DNS/connect failures to [`TransportError::Unreachable`]. Non-2xx statuses are regular
/// responses, not errors.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Executes `request`, giving up after `timeout`.
	fn execute<'a>(
		&'a self,
		request: &'a OutboundRequest,
		timeout: StdDuration,
	) -> TransportFuture<'a>;
}
impl<T> HttpTransport for Arc<T>
where
	T: HttpTransport,
{
	fn execute<'a>(
		&'a self,
		request: &'a OutboundRequest,
		timeout: StdDuration,
	) -> TransportFuture<'a> {
		(**self).execute(request, timeout)
	}
}

/// HTTP methods supported by the guard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	/// `GET`
	#[default]
	Get,
	/// `POST`
	Post,
	/// `PUT`
	Put,
	/// `PATCH`
	Patch,
	/// `DELETE`
	Delete,
	/// `HEAD`
	Head,
}
impl Method {
	/// Returns true for methods whose responses may be cached: reads and body-keyed `POST`s.
	///
	/// `PUT`, `PATCH`, and `DELETE` mutate the resource, so their answers are never cached.
	pub const fn is_cacheable(self) -> bool {
		matches!(self, Method::Get | Method::Head | Method::Post)
	}

	/// Returns the canonical upper-case method name.
	pub const fn as_str(self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Patch => "PATCH",
			Method::Delete => "DELETE",
			Method::Head => "HEAD",
		}
	}
}
impl Display for Method {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
impl FromStr for Method {
	type Err = UnknownMethod;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"GET" => Ok(Method::Get),
			"POST" => Ok(Method::Post),
			"PUT" => Ok(Method::Put),
			"PATCH" => Ok(Method::Patch),
			"DELETE" => Ok(Method::Delete),
			"HEAD" => Ok(Method::Head),
			_ => Err(UnknownMethod(s.to_owned())),
		}
	}
}

/// Error returned when parsing an unsupported HTTP method.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Unsupported HTTP method `{0}`.")]
pub struct UnknownMethod(pub String);

/// Request handed to an [`HttpTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
	/// HTTP method.
	pub method: Method,
	/// Absolute request URL.
	pub url: Url,
	/// Request headers.
	pub headers: BTreeMap<String, String>,
	/// Optional request body.
	pub body: Option<Vec<u8>>,
}

/// Response produced by an [`HttpTransport`].
///
/// Header names are stored lower-cased; repeated headers are joined with `", "`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportResponse {
	/// HTTP status code.
	pub status: u16,
	/// Response headers keyed by lower-case name.
	pub headers: BTreeMap<String, String>,
	/// Raw response body.
	pub body: Vec<u8>,
}
impl TransportResponse {
	/// Creates a response from its parts, normalizing header names.
	pub fn new<I, K, V>(status: u16, headers: I, body: impl Into<Vec<u8>>) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: Into<String>,
	{
		let mut normalized = BTreeMap::<String, String>::new();

		for (name, value) in headers {
			let value = value.into();

			normalized
				.entry(name.as_ref().to_ascii_lowercase())
				.and_modify(|existing| {
					existing.push_str(", ");
					existing.push_str(&value);
				})
				.or_insert_with(|| value.clone());
		}

		Self { status, headers: normalized, body: body.into() }
	}

	/// Looks up a header by case-insensitive name.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
	}

	/// Remaining quota advertised by `x-ratelimit-remaining`, if present and numeric.
	pub fn remaining_quota(&self) -> Option<u64> {
		self.header(RATE_LIMIT_REMAINING)?.trim().parse().ok()
	}

	/// Retry hint advertised by `Retry-After`, in seconds or as an HTTP date.
	pub fn retry_after(&self) -> Option<Duration> {
		parse_retry_after(self.header(RETRY_AFTER)?)
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// The per-attempt timeout passed to [`HttpTransport::execute`] is applied to each request, so
/// the wrapped client does not need a global timeout.
#[cfg(feature = "reqwest")]
#[derive(Clone, Default)]
pub struct ReqwestTransport(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	fn method(method: Method) -> reqwest::Method {
		match method {
			Method::Get => reqwest::Method::GET,
			Method::Post => reqwest::Method::POST,
			Method::Put => reqwest::Method::PUT,
			Method::Patch => reqwest::Method::PATCH,
			Method::Delete => reqwest::Method::DELETE,
			Method::Head => reqwest::Method::HEAD,
		}
	}
}
#[cfg(feature = "reqwest")]
impl AsRef<ReqwestClient> for ReqwestTransport {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl Deref for ReqwestTransport {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl Debug for ReqwestTransport {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("ReqwestTransport(..)")
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestTransport {
	fn execute<'a>(
		&'a self,
		request: &'a OutboundRequest,
		timeout: StdDuration,
	) -> TransportFuture<'a> {
		Box::pin(async move {
			let mut builder = self
				.0
				.request(Self::method(request.method), request.url.clone())
				.timeout(timeout);

			for (name, value) in &request.headers {
				builder = builder.header(name.as_str(), value.as_str());
			}
			if let Some(body) = &request.body {
				builder = builder.body(body.clone());
			}

			let response = builder.send().await?;
			let status = response.status().as_u16();
			let headers = response
				.headers()
				.iter()
				.filter_map(|(name, value)| {
					value.to_str().ok().map(|value| (name.as_str().to_owned(), value.to_owned()))
				})
				.collect::<Vec<_>>();
			let body = response.bytes().await?.to_vec();

			Ok(TransportResponse::new(status, headers, body))
		})
	}
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
	let raw = raw.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::seconds(i64::try_from(secs).ok()?));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Some(delta);
		}
	}

	None
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn response_headers_are_case_insensitive_and_joined() {
		let response = TransportResponse::new(
			200,
			[("X-RateLimit-Remaining", "2"), ("Vary", "accept"), ("vary", "origin")],
			b"{}".to_vec(),
		);

		assert_eq!(response.remaining_quota(), Some(2));
		assert_eq!(response.header("VARY"), Some("accept, origin"));
		assert_eq!(response.header("retry-after"), None);
	}

	#[test]
	fn retry_after_accepts_seconds_and_ignores_past_dates() {
		let seconds = TransportResponse::new(429, [("Retry-After", "3")], Vec::new());
		let past = TransportResponse::new(
			429,
			[("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT")],
			Vec::new(),
		);
		let garbage = TransportResponse::new(429, [("Retry-After", "soon")], Vec::new());

		assert_eq!(seconds.retry_after(), Some(Duration::seconds(3)));
		assert_eq!(past.retry_after(), None);
		assert_eq!(garbage.retry_after(), None);
	}

	#[test]
	fn methods_parse_case_insensitively() {
		assert_eq!("post".parse::<Method>(), Ok(Method::Post));
		assert_eq!(Method::Patch.to_string(), "PATCH");
		assert!("TRACE".parse::<Method>().is_err());
		assert!(Method::Get.is_cacheable());
		assert!(Method::Post.is_cacheable());
		assert!(!Method::Delete.is_cacheable());
		assert!(!Method::Put.is_cacheable());
	}
}
