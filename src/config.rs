//! Tunables for the guard, loadable from serde sources or `UPSTREAM_GUARD_*` environment variables.

// std
use std::env;
// self
use crate::{_prelude::*, error::ConfigError, store::KeySpace};

/// Deployment profile that scales the failure threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
	/// Live traffic; the breaker trips quickly.
	#[default]
	Production,
	/// Test suites; a higher threshold keeps flaky remotes from tripping the breaker.
	Test,
}
impl Profile {
	/// Failure threshold used when none is set explicitly.
	pub const fn failure_threshold(self) -> u32 {
		match self {
			Self::Production => 3,
			Self::Test => 10,
		}
	}
}
impl FromStr for Profile {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"production" | "prod" => Ok(Self::Production),
			"test" | "testing" => Ok(Self::Test),
			_ => Err(ConfigError::InvalidEnv { key: ENV_PROFILE.into(), value: s.into() }),
		}
	}
}

const ENV_PREFIX: &str = "UPSTREAM_GUARD_";
const ENV_PROFILE: &str = "UPSTREAM_GUARD_PROFILE";

/// Guard configuration.
///
/// Delays are expressed in milliseconds and TTLs in seconds, matching the units of the
/// environment variables read by [`GuardConfig::from_env`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
	/// Deployment profile.
	pub profile: Profile,
	/// Adaptive delay used for domains without stored state.
	pub default_delay_ms: u64,
	/// Lower bound of the adaptive delay.
	pub min_delay_ms: u64,
	/// Upper bound of the adaptive delay.
	pub max_delay_ms: u64,
	/// Half-width of the jitter applied around the adaptive delay.
	pub delay_jitter_ms: u64,
	/// Maximum age of the controller's local delay cache.
	pub local_cache_ttl_ms: u64,
	/// Token bucket capacity.
	pub bucket_limit: u32,
	/// Token bucket refill interval.
	pub bucket_refill_ms: u64,
	/// Base sleep between denied admission attempts.
	pub admission_poll_ms: u64,
	/// Upper bound of the random jitter added to the admission sleep.
	pub admission_jitter_ms: u64,
	/// Base of the escalating timeout backoff.
	pub timeout_backoff_ms: u64,
	/// Consecutive failures tolerated before the breaker opens; profile default when unset.
	pub failure_threshold: Option<u32>,
	/// How long a tripped circuit stays open.
	pub circuit_open_secs: u64,
	/// Remaining-quota value below which a successful call still raises the delay.
	pub low_quota_threshold: u64,
	/// Default TTL for cached responses.
	pub cache_ttl_secs: u64,
	/// Path segments whose following segment is a slug rather than an identifier.
	pub slug_collections: Vec<String>,
	/// Root prefix for every store key.
	pub key_prefix: String,
}
impl GuardConfig {
	/// Multiplier applied to the delay on rate-limit signals.
	pub const BACKOFF_FACTOR: f64 = 1.5;

	/// Reads overrides from `UPSTREAM_GUARD_*` variables on top of [`GuardConfig::default`].
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| env::var(key).ok())
	}

	/// Same as [`GuardConfig::from_env`] but with an injectable variable source.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = Self::default();
		let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

		if let Some(raw) = var("PROFILE") {
			config.profile = raw.parse()?;
		}

		read_number(&var, "DEFAULT_DELAY_MS", &mut config.default_delay_ms)?;
		read_number(&var, "MIN_DELAY_MS", &mut config.min_delay_ms)?;
		read_number(&var, "MAX_DELAY_MS", &mut config.max_delay_ms)?;
		read_number(&var, "DELAY_JITTER_MS", &mut config.delay_jitter_ms)?;
		read_number(&var, "LOCAL_CACHE_TTL_MS", &mut config.local_cache_ttl_ms)?;
		read_number(&var, "ADMISSION_POLL_MS", &mut config.admission_poll_ms)?;
		read_number(&var, "ADMISSION_JITTER_MS", &mut config.admission_jitter_ms)?;
		read_number(&var, "TIMEOUT_BACKOFF_MS", &mut config.timeout_backoff_ms)?;
		read_number(&var, "BUCKET_LIMIT", &mut config.bucket_limit)?;
		read_number(&var, "BUCKET_REFILL_MS", &mut config.bucket_refill_ms)?;
		read_number(&var, "CIRCUIT_OPEN_SECS", &mut config.circuit_open_secs)?;
		read_number(&var, "CACHE_TTL_SECS", &mut config.cache_ttl_secs)?;
		read_number(&var, "LOW_QUOTA_THRESHOLD", &mut config.low_quota_threshold)?;

		if let Some(raw) = var("FAILURE_THRESHOLD") {
			config.failure_threshold = Some(parse_number("FAILURE_THRESHOLD", &raw)?);
		}
		if let Some(raw) = var("KEY_PREFIX") {
			config.key_prefix = raw;
		}
		if let Some(raw) = var("SLUG_COLLECTIONS") {
			config.slug_collections = raw
				.split(',')
				.map(str::trim)
				.filter(|value| !value.is_empty())
				.map(str::to_owned)
				.collect();
		}

		config.validate()?;

		Ok(config)
	}

	/// Checks that the tunables are mutually consistent.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |reason: &str| -> Result<(), ConfigError> {
			Err(ConfigError::InvalidSettings { reason: reason.into() })
		};

		if self.min_delay_ms > self.max_delay_ms {
			return invalid("min_delay_ms exceeds max_delay_ms");
		}
		if !(self.min_delay_ms..=self.max_delay_ms).contains(&self.default_delay_ms) {
			return invalid("default_delay_ms lies outside the delay bounds");
		}
		if self.bucket_limit == 0 {
			return invalid("bucket_limit must be positive");
		}
		if self.bucket_refill_ms == 0 {
			return invalid("bucket_refill_ms must be positive");
		}
		if self.key_prefix.is_empty() {
			return invalid("key_prefix cannot be empty");
		}

		Ok(())
	}

	/// Effective breaker threshold.
	pub fn failure_threshold(&self) -> u32 {
		self.failure_threshold.unwrap_or_else(|| self.profile.failure_threshold())
	}

	/// Key space derived from [`GuardConfig::key_prefix`].
	pub fn key_space(&self) -> KeySpace {
		KeySpace::new(self.key_prefix.clone())
	}

	/// Overrides the profile.
	pub fn with_profile(mut self, profile: Profile) -> Self {
		self.profile = profile;

		self
	}

	/// Overrides the default, minimum, and maximum delays.
	pub fn with_delays(mut self, default_ms: u64, min_ms: u64, max_ms: u64) -> Self {
		self.default_delay_ms = default_ms;
		self.min_delay_ms = min_ms;
		self.max_delay_ms = max_ms;

		self
	}

	/// Overrides the jitter applied around the adaptive delay.
	pub fn with_delay_jitter_ms(mut self, jitter_ms: u64) -> Self {
		self.delay_jitter_ms = jitter_ms;

		self
	}

	/// Overrides the token bucket capacity and refill interval.
	pub fn with_bucket(mut self, limit: u32, refill_ms: u64) -> Self {
		self.bucket_limit = limit;
		self.bucket_refill_ms = refill_ms;

		self
	}

	/// Overrides the admission retry sleep.
	pub fn with_admission_poll(mut self, poll_ms: u64, jitter_ms: u64) -> Self {
		self.admission_poll_ms = poll_ms;
		self.admission_jitter_ms = jitter_ms;

		self
	}

	/// Overrides the timeout backoff base.
	pub fn with_timeout_backoff_ms(mut self, backoff_ms: u64) -> Self {
		self.timeout_backoff_ms = backoff_ms;

		self
	}

	/// Pins the breaker threshold regardless of profile.
	pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
		self.failure_threshold = Some(threshold);

		self
	}

	/// Overrides the default cache TTL.
	pub fn with_cache_ttl_secs(mut self, ttl_secs: u64) -> Self {
		self.cache_ttl_secs = ttl_secs;

		self
	}

	/// Overrides the store key prefix.
	pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.key_prefix = prefix.into();

		self
	}
}
impl Default for GuardConfig {
	fn default() -> Self {
		Self {
			profile: Profile::default(),
			default_delay_ms: 300,
			min_delay_ms: 100,
			max_delay_ms: 5_000,
			delay_jitter_ms: 200,
			local_cache_ttl_ms: 1_000,
			bucket_limit: 10,
			bucket_refill_ms: 1_000,
			admission_poll_ms: 80,
			admission_jitter_ms: 70,
			timeout_backoff_ms: 500,
			failure_threshold: None,
			circuit_open_secs: 60,
			low_quota_threshold: 3,
			cache_ttl_secs: 300,
			slug_collections: vec!["profiles".into(), "users".into(), "channels".into()],
			key_prefix: KeySpace::default().prefix().to_owned(),
		}
	}
}

fn read_number<T, F>(var: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
	T: FromStr,
	F: Fn(&str) -> Option<String>,
{
	if let Some(raw) = var(name) {
		*slot = parse_number(name, &raw)?;
	}

	Ok(())
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
	T: FromStr,
{
	raw.trim()
		.parse()
		.map_err(|_| ConfigError::InvalidEnv { key: format!("{ENV_PREFIX}{name}"), value: raw.into() })
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
		move |key| pairs.iter().find(|(name, _)| *name == key).map(|(_, value)| value.to_string())
	}

	#[test]
	fn defaults_match_documented_tunables() {
		let config = GuardConfig::default();

		assert_eq!(config.default_delay_ms, 300);
		assert_eq!(config.min_delay_ms, 100);
		assert_eq!(config.max_delay_ms, 5_000);
		assert_eq!(config.bucket_limit, 10);
		assert_eq!(config.bucket_refill_ms, 1_000);
		assert_eq!(config.cache_ttl_secs, 300);
		assert_eq!(config.failure_threshold(), 3);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn env_overrides_and_profile_scale_threshold() {
		let config = GuardConfig::from_lookup(lookup(&[
			("UPSTREAM_GUARD_PROFILE", "test"),
			("UPSTREAM_GUARD_DEFAULT_DELAY_MS", "250"),
			("UPSTREAM_GUARD_BUCKET_LIMIT", "4"),
			("UPSTREAM_GUARD_KEY_PREFIX", "svc"),
			("UPSTREAM_GUARD_SLUG_COLLECTIONS", "artists, labels"),
			("UPSTREAM_GUARD_LOCAL_CACHE_TTL_MS", "250"),
			("UPSTREAM_GUARD_ADMISSION_POLL_MS", "40"),
			("UPSTREAM_GUARD_TIMEOUT_BACKOFF_MS", "750"),
		]))
		.expect("Valid overrides should load.");

		assert_eq!(config.profile, Profile::Test);
		assert_eq!(config.failure_threshold(), 10);
		assert_eq!(config.default_delay_ms, 250);
		assert_eq!(config.bucket_limit, 4);
		assert_eq!(config.key_space().prefix(), "svc");
		assert_eq!(config.slug_collections, vec!["artists".to_string(), "labels".to_string()]);
		assert_eq!(config.local_cache_ttl_ms, 250);
		assert_eq!(config.admission_poll_ms, 40);
		assert_eq!(config.admission_jitter_ms, 70);
		assert_eq!(config.timeout_backoff_ms, 750);

		let pinned = GuardConfig::from_lookup(lookup(&[
			("UPSTREAM_GUARD_PROFILE", "test"),
			("UPSTREAM_GUARD_FAILURE_THRESHOLD", "5"),
		]))
		.expect("Explicit threshold should load.");

		assert_eq!(pinned.failure_threshold(), 5);
	}

	#[test]
	fn env_rejects_garbage_and_inconsistent_bounds() {
		let err = GuardConfig::from_lookup(lookup(&[("UPSTREAM_GUARD_MAX_DELAY_MS", "soon")]))
			.expect_err("Non-numeric delays should be rejected.");

		assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "UPSTREAM_GUARD_MAX_DELAY_MS"));

		let err = GuardConfig::from_lookup(lookup(&[("UPSTREAM_GUARD_MIN_DELAY_MS", "9000")]))
			.expect_err("Minimum above maximum should be rejected.");

		assert!(matches!(err, ConfigError::InvalidSettings { .. }));
	}

	#[test]
	fn serde_fills_missing_fields_from_defaults() {
		let config: GuardConfig = serde_json::from_str("{\"bucket_limit\":25,\"profile\":\"test\"}")
			.expect("Partial config should deserialize.");

		assert_eq!(config.bucket_limit, 25);
		assert_eq!(config.profile, Profile::Test);
		assert_eq!(config.max_delay_ms, 5_000);
	}
}
