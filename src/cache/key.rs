//! Normalized cache keys.

// crates.io
use sha2::{Digest, Sha256};
use url::form_urlencoded::Serializer;
// self
use crate::{_prelude::*, domain::Domain, http::Method, store::KeySpace};

/// Number of hex characters kept from the body digest.
pub const BODY_HASH_LEN: usize = 10;

/// Fully resolved cache key for one request.
///
/// The store key is `<prefix>:cache:<domain>:<template>:<METHOD>:<path>[#<body hash>][?<query>]`,
/// so every entry for one endpoint shape shares the `<template>:` namespace while distinct
/// methods, resources, and payloads stay separate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
	domain: Domain,
	method: Method,
	template: String,
	body_hash: Option<String>,
	storage_key: String,
}
impl CacheKey {
	/// Domain the key is scoped to.
	pub fn domain(&self) -> &Domain {
		&self.domain
	}

	/// HTTP method of the cached request.
	pub fn method(&self) -> Method {
		self.method
	}

	/// Endpoint template, e.g. `/users/:slug/posts/:id`.
	pub fn template(&self) -> &str {
		&self.template
	}

	/// Short digest of the request body, when one was supplied.
	pub fn body_hash(&self) -> Option<&str> {
		self.body_hash.as_deref()
	}

	/// Key used in the shared store.
	pub fn as_str(&self) -> &str {
		&self.storage_key
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.storage_key)
	}
}

/// Collapses concrete request paths into endpoint templates.
///
/// Segments that look like identifiers (numbers, UUIDs, long hex or opaque tokens) become `:id`;
/// the segment right after a configured slug collection (e.g. `profiles`) becomes `:slug`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathTemplates {
	slug_collections: Vec<String>,
}
impl PathTemplates {
	/// Creates a normalizer treating the segment after any of `collections` as a slug.
	pub fn new<I, S>(collections: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			slug_collections: collections
				.into_iter()
				.map(|c| c.into().trim_matches('/').to_ascii_lowercase())
				.collect(),
		}
	}

	/// Returns the endpoint template for `path`.
	pub fn template(&self, path: &str) -> String {
		let mut previous: Option<&str> = None;
		let mut out = String::with_capacity(path.len());

		for segment in path.split('/').filter(|s| !s.is_empty()) {
			out.push('/');

			if previous.is_some_and(|p| self.is_slug_collection(p)) {
				out.push_str(":slug");
			} else if looks_like_identifier(segment) {
				out.push_str(":id");
			} else {
				out.push_str(segment);
			}

			previous = Some(segment);
		}

		if out.is_empty() {
			out.push('/');
		}

		out
	}

	/// Builds the cache key for a `method` request against `url` with an optional body.
	pub fn key(
		&self,
		keys: &KeySpace,
		method: Method,
		url: &Url,
		body: Option<&[u8]>,
	) -> Result<CacheKey> {
		let domain = Domain::from_url(url).map_err(crate::error::ConfigError::from)?;
		let template = self.template(url.path());
		let body_hash = body.filter(|b| !b.is_empty()).map(body_digest);
		let mut storage_key =
			format!("{}{template}:{method}:{}", keys.cache_prefix(&domain), url.path());

		if let Some(hash) = &body_hash {
			storage_key.push('#');
			storage_key.push_str(hash);
		}
		if let Some(query) = sorted_query(url) {
			storage_key.push('?');
			storage_key.push_str(&query);
		}

		Ok(CacheKey { domain, method, template, body_hash, storage_key })
	}

	fn is_slug_collection(&self, segment: &str) -> bool {
		self.slug_collections.iter().any(|c| c.eq_ignore_ascii_case(segment))
	}
}

/// First [`BODY_HASH_LEN`] hex characters of the SHA-256 digest of `body`.
pub fn body_digest(body: &[u8]) -> String {
	let mut hasher = Sha256::new();

	hasher.update(body);

	let digest = hasher.finalize();

	digest.iter().take(BODY_HASH_LEN / 2).map(|byte| format!("{byte:02x}")).collect()
}

fn sorted_query(url: &Url) -> Option<String> {
	let mut pairs = url.query_pairs().into_owned().collect::<Vec<_>>();

	if pairs.is_empty() {
		return None;
	}

	pairs.sort();

	Some(Serializer::new(String::new()).extend_pairs(pairs).finish())
}

fn looks_like_identifier(segment: &str) -> bool {
	let len = segment.len();
	let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());

	if segment.chars().all(|c| c.is_ascii_digit()) {
		return true;
	}
	// Canonical UUID.
	if len == 36 && segment.chars().filter(|&c| c == '-').count() == 4 {
		return is_hex(&segment.replace('-', ""));
	}
	if len >= 16 && is_hex(segment) {
		return true;
	}

	// Opaque tokens: long, no separators, and mixing letters with digits.
	len >= 20
		&& segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& segment.chars().any(|c| c.is_ascii_digit())
		&& segment.chars().any(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn templates() -> PathTemplates {
		PathTemplates::new(["profiles", "users", "channels"])
	}

	fn url(raw: &str) -> Url {
		Url::parse(raw).expect("URL fixture should parse.")
	}

	#[test]
	fn templates_collapse_identifiers_and_slugs() {
		let templates = templates();

		assert_eq!(templates.template("/clip/123456"), "/clip/:id");
		assert_eq!(templates.template("/profiles/jane-doe"), "/profiles/:slug");
		assert_eq!(
			templates.template("/users/jane/posts/550e8400-e29b-41d4-a716-446655440000"),
			"/users/:slug/posts/:id"
		);
		assert_eq!(templates.template("/v1/items/0123456789abcdef"), "/v1/items/:id");
		assert_eq!(templates.template("/v1/search"), "/v1/search");
		assert_eq!(templates.template(""), "/");
	}

	#[test]
	fn distinct_bodies_produce_distinct_keys() {
		let templates = templates();
		let keys = KeySpace::default();
		let target = url("https://api.example.com/v1/search");
		let a = templates
			.key(&keys, Method::Post, &target, Some(br#"{"q":"rust"}"#))
			.expect("Key should build.");
		let b = templates
			.key(&keys, Method::Post, &target, Some(br#"{"q":"go"}"#))
			.expect("Key should build.");
		let bare = templates.key(&keys, Method::Post, &target, None).expect("Key should build.");

		assert_ne!(a, b);
		assert_ne!(a, bare);
		assert_eq!(a.template(), b.template());
		assert_eq!(a.body_hash().map(str::len), Some(BODY_HASH_LEN));
		assert!(bare.body_hash().is_none());
	}

	#[test]
	fn query_order_does_not_change_the_key() {
		let templates = templates();
		let keys = KeySpace::default();
		let a = templates
			.key(&keys, Method::Get, &url("https://api.example.com/clip/42?b=2&a=1"), None)
			.expect("Key should build.");
		let b = templates
			.key(&keys, Method::Get, &url("https://api.example.com/clip/42?a=1&b=2"), None)
			.expect("Key should build.");
		let other = templates
			.key(&keys, Method::Get, &url("https://api.example.com/clip/43?a=1&b=2"), None)
			.expect("Key should build.");

		assert_eq!(a, b);
		assert_ne!(a, other);
		assert_eq!(a.template(), other.template());
		assert_eq!(
			a.as_str(),
			"upstream_guard:cache:api.example.com:/clip/:id:GET:/clip/42?a=1&b=2"
		);
	}

	#[test]
	fn methods_never_share_a_key() {
		let templates = templates();
		let keys = KeySpace::default();
		let target = url("https://api.example.com/clip/1");
		let get = templates.key(&keys, Method::Get, &target, None).expect("Key should build.");
		let head = templates.key(&keys, Method::Head, &target, None).expect("Key should build.");
		let delete = templates.key(&keys, Method::Delete, &target, None).expect("Key should build.");

		assert_ne!(get, head);
		assert_ne!(get, delete);
		assert_eq!(get.template(), delete.template());
		assert_eq!(get.method(), Method::Get);
		assert!(delete.as_str().contains(":DELETE:/clip/1"));
	}

	#[test]
	fn body_digest_is_stable_hex_prefix() {
		let digest = body_digest(b"hello");

		assert_eq!(digest, "2cf24dba5f");
		assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
	}
}
