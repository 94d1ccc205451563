//! Adaptive per-domain delay, failure counter, and circuit breaker.
//!
//! The delay grows multiplicatively on distress signals (429s, low remaining quota) and
//! shrinks on success by a step of `1000 / sqrt(success_count)` milliseconds, so recovery
//! after a long outage slows down instead of oscillating. Reads are served from a local cache
//! no older than [`GuardConfig::local_cache_ttl_ms`]; every write goes to the store first and
//! then refreshes the local copy.

// std
use std::time::{Duration as StdDuration, Instant};
// self
use crate::{
	_prelude::*,
	config::GuardConfig,
	domain::Domain,
	obs::trace_event,
	store::{KeySpace, SharedStore, parse_counter},
};

/// Bounds applied to every stored delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayLimits {
	/// Delay used for domains without stored state.
	pub default_ms: u64,
	/// Lower bound.
	pub min_ms: u64,
	/// Upper bound.
	pub max_ms: u64,
}
impl DelayLimits {
	/// Clamps a raw delay into `[min_ms, max_ms]`.
	pub fn clamp(&self, delay_ms: f64) -> u64 {
		if !delay_ms.is_finite() {
			return self.max_ms;
		}

		(delay_ms.round().max(0.) as u64).clamp(self.min_ms, self.max_ms)
	}
}
impl From<&GuardConfig> for DelayLimits {
	fn from(config: &GuardConfig) -> Self {
		Self {
			default_ms: config.default_delay_ms,
			min_ms: config.min_delay_ms,
			max_ms: config.max_delay_ms,
		}
	}
}

/// Point-in-time view of a domain's adaptive state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
	/// Domain the snapshot describes.
	pub domain: Domain,
	/// Current adaptive delay.
	pub delay_ms: u64,
	/// Consecutive non-transient failures.
	pub failure_count: u64,
	/// Success counter shaping the decrease step.
	pub success_count: u64,
	/// Instant the open circuit closes, if it is open.
	#[serde(with = "time::serde::timestamp::option")]
	pub circuit_open_until: Option<OffsetDateTime>,
}

#[derive(Clone, Copy, Debug)]
struct LocalDelay {
	delay_ms: u64,
	cached_at: Instant,
}

/// Store-backed adaptive delay and circuit-breaker controller.
///
/// Each instance owns its local read cache, so separate instances (for example, in tests)
/// never observe each other's cached values.
pub struct AdaptiveController {
	store: Arc<dyn SharedStore>,
	keys: KeySpace,
	limits: DelayLimits,
	local_ttl: StdDuration,
	local: Mutex<HashMap<Domain, LocalDelay>>,
}
impl AdaptiveController {
	/// Success counter value assumed for domains without stored state.
	pub const INITIAL_SUCCESS_COUNT: u64 = 1;
	/// Success counter ceiling; crossing it resets the counter to [`Self::SUCCESS_COUNT_RESET`].
	pub const SUCCESS_COUNT_CEILING: u64 = 10_000;
	/// Value the success counter wraps back to.
	pub const SUCCESS_COUNT_RESET: u64 = 1_000;

	/// Creates a controller using the bounds and key space from `config`.
	pub fn new(store: Arc<dyn SharedStore>, config: &GuardConfig) -> Self {
		Self {
			store,
			keys: config.key_space(),
			limits: DelayLimits::from(config),
			local_ttl: StdDuration::from_millis(config.local_cache_ttl_ms),
			local: Mutex::new(HashMap::new()),
		}
	}

	/// Delay bounds enforced by this controller.
	pub fn limits(&self) -> DelayLimits {
		self.limits
	}

	/// Current delay for `domain`, from the local cache when fresh.
	pub async fn get_delay(&self, domain: &Domain) -> Result<u64> {
		if let Some(delay) = self.cached(domain) {
			return Ok(delay);
		}

		let key = self.keys.delay(domain);
		let delay = match self.store.get(&key).await? {
			Some(raw) => self.limits.clamp(parse_counter(&key, &raw)? as f64),
			None => self.limits.default_ms,
		};

		self.remember(domain, delay);

		Ok(delay)
	}

	/// Multiplies the delay by `factor`, capped at the maximum; returns the new delay.
	pub async fn increase_delay(&self, domain: &Domain, factor: f64) -> Result<u64> {
		let current = self.get_delay(domain).await?;
		let next = self.limits.clamp(current as f64 * factor.max(1.));

		self.store_delay(domain, next).await?;

		trace_event!(debug, domain = %domain, from_ms = current, to_ms = next, "delay increased");

		Ok(next)
	}

	/// Shrinks the delay by `max(1, 1000 / sqrt(success_count))`, floored at the minimum.
	pub async fn decrease_delay(&self, domain: &Domain) -> Result<u64> {
		let current = self.get_delay(domain).await?;
		let successes = self.success_count(domain).await?;
		let step = (1_000. / (successes.max(1) as f64).sqrt()).floor().max(1.) as u64;
		let next = current.saturating_sub(step).max(self.limits.min_ms).min(self.limits.max_ms);
		let bumped = match successes + 1 {
			count if count > Self::SUCCESS_COUNT_CEILING => Self::SUCCESS_COUNT_RESET,
			count => count,
		};

		self.store_delay(domain, next).await?;
		self.store.set(&self.keys.successes(domain), bumped.to_string(), None).await?;

		Ok(next)
	}

	/// Success counter for `domain`.
	pub async fn success_count(&self, domain: &Domain) -> Result<u64> {
		self.read_counter(&self.keys.successes(domain), Self::INITIAL_SUCCESS_COUNT).await
	}

	/// Restores the default delay and success counter for `domain`.
	pub async fn reset_delay(&self, domain: &Domain) -> Result<()> {
		self.store.delete(&self.keys.delay(domain)).await?;
		self.store.delete(&self.keys.successes(domain)).await?;
		self.forget(domain);

		Ok(())
	}

	/// Returns true while the circuit flag for `domain` has not expired.
	pub async fn is_circuit_open(&self, domain: &Domain) -> Result<bool> {
		Ok(self.store.get(&self.keys.circuit(domain)).await?.is_some())
	}

	/// Instant at which the open circuit for `domain` closes.
	pub async fn circuit_open_until(&self, domain: &Domain) -> Result<Option<OffsetDateTime>> {
		let key = self.keys.circuit(domain);
		let Some(raw) = self.store.get(&key).await? else {
			return Ok(None);
		};
		let until = OffsetDateTime::from_unix_timestamp(parse_counter(&key, &raw)?)
			.unwrap_or_else(|_| OffsetDateTime::now_utc());

		Ok(Some(until))
	}

	/// Opens the circuit for `seconds`; the store's expiry closes it again.
	pub async fn open_circuit(&self, domain: &Domain, seconds: u64) -> Result<()> {
		let window = Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX));
		let until = OffsetDateTime::now_utc() + window;

		self.store
			.set(&self.keys.circuit(domain), until.unix_timestamp().to_string(), Some(window))
			.await?;

		trace_event!(warn, domain = %domain, seconds, "circuit opened");

		Ok(())
	}

	/// Closes the circuit for `domain` immediately.
	pub async fn reset_circuit(&self, domain: &Domain) -> Result<()> {
		self.store.delete(&self.keys.circuit(domain)).await?;

		Ok(())
	}

	/// Consecutive non-transient failures recorded for `domain`.
	pub async fn failure_count(&self, domain: &Domain) -> Result<u64> {
		self.read_counter(&self.keys.failures(domain), 0).await
	}

	/// Atomically bumps the failure counter, returning the new value.
	pub async fn increment_failure_count(&self, domain: &Domain) -> Result<u64> {
		let count = self.store.increment(&self.keys.failures(domain), 1).await?;

		Ok(u64::try_from(count).unwrap_or(0))
	}

	/// Clears the failure counter.
	pub async fn reset_failure_count(&self, domain: &Domain) -> Result<()> {
		self.store.delete(&self.keys.failures(domain)).await?;

		Ok(())
	}

	/// Administrative reset: default delay, zero failures, closed circuit.
	pub async fn reset(&self, domain: &Domain) -> Result<()> {
		self.reset_delay(domain).await?;
		self.reset_failure_count(domain).await?;
		self.reset_circuit(domain).await?;

		trace_event!(info, domain = %domain, "adaptive state reset");

		Ok(())
	}

	/// Reads every adaptive field for `domain` straight from the store.
	pub async fn snapshot(&self, domain: &Domain) -> Result<RateSnapshot> {
		self.forget(domain);

		Ok(RateSnapshot {
			domain: domain.clone(),
			delay_ms: self.get_delay(domain).await?,
			failure_count: self.failure_count(domain).await?,
			success_count: self.success_count(domain).await?,
			circuit_open_until: self.circuit_open_until(domain).await?,
		})
	}

	async fn store_delay(&self, domain: &Domain, delay_ms: u64) -> Result<()> {
		self.store.set(&self.keys.delay(domain), delay_ms.to_string(), None).await?;
		self.remember(domain, delay_ms);

		Ok(())
	}

	async fn read_counter(&self, key: &str, default: u64) -> Result<u64> {
		match self.store.get(key).await? {
			Some(raw) => Ok(u64::try_from(parse_counter(key, &raw)?).unwrap_or(0)),
			None => Ok(default),
		}
	}

	fn cached(&self, domain: &Domain) -> Option<u64> {
		let local = self.local.lock();

		local
			.get(domain)
			.filter(|entry| entry.cached_at.elapsed() <= self.local_ttl)
			.map(|entry| entry.delay_ms)
	}

	fn remember(&self, domain: &Domain, delay_ms: u64) {
		self.local.lock().insert(domain.clone(), LocalDelay { delay_ms, cached_at: Instant::now() });
	}

	fn forget(&self, domain: &Domain) {
		self.local.lock().remove(domain);
	}
}
impl Debug for AdaptiveController {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AdaptiveController")
			.field("keys", &self.keys)
			.field("limits", &self.limits)
			.field("local_ttl", &self.local_ttl)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::store::MemoryStore;

	fn controller(store: Arc<MemoryStore>) -> AdaptiveController {
		AdaptiveController::new(store, &GuardConfig::default())
	}

	fn domain() -> Domain {
		Domain::new("adaptive.example.com").expect("Domain fixture should be valid.")
	}

	#[tokio::test]
	async fn delay_defaults_and_stays_within_bounds() {
		let controller = controller(Arc::new(MemoryStore::default()));
		let domain = domain();

		assert_eq!(controller.get_delay(&domain).await.expect("Read should succeed."), 300);

		for round in 0..40 {
			let delay = if round % 3 == 0 {
				controller.decrease_delay(&domain).await
			} else {
				controller.increase_delay(&domain, 1.5_f64.powi(round % 5)).await
			}
			.expect("Delay update should succeed.");

			assert!((100..=5_000).contains(&delay), "Delay {delay} escaped its bounds.");
		}

		let capped = controller.increase_delay(&domain, 1_000.).await.expect("Increase should work.");

		assert_eq!(capped, 5_000);
	}

	#[tokio::test]
	async fn repeated_decreases_converge_to_minimum() {
		let controller = controller(Arc::new(MemoryStore::default()));
		let domain = domain();

		controller.increase_delay(&domain, 100.).await.expect("Increase should succeed.");

		let mut previous = controller.get_delay(&domain).await.expect("Read should succeed.");

		for _ in 0..200 {
			let next = controller.decrease_delay(&domain).await.expect("Decrease should succeed.");

			assert!(next <= previous);
			assert!(next >= 100);

			previous = next;
		}

		assert_eq!(previous, 100);
	}

	#[tokio::test]
	async fn decrease_step_shrinks_with_success_count() {
		let store = Arc::new(MemoryStore::default());
		let controller = controller(store.clone());
		let domain = domain();
		let keys = KeySpace::default();

		store.set(&keys.delay(&domain), "5000".into(), None).await.expect("Seed delay.");
		store.set(&keys.successes(&domain), "100".into(), None).await.expect("Seed successes.");

		let first = controller.decrease_delay(&domain).await.expect("Decrease should succeed.");

		assert_eq!(first, 4_900);
		assert_eq!(controller.success_count(&domain).await.expect("Read should succeed."), 101);

		store.set(&keys.successes(&domain), "10000".into(), None).await.expect("Seed successes.");
		controller.decrease_delay(&domain).await.expect("Decrease should succeed.");

		assert_eq!(controller.success_count(&domain).await.expect("Read should succeed."), 1_000);
	}

	#[tokio::test]
	async fn local_cache_is_per_instance_and_write_through() {
		let store = Arc::new(MemoryStore::default());
		let writer = controller(store.clone());
		let reader = controller(store.clone());
		let domain = domain();

		assert_eq!(reader.get_delay(&domain).await.expect("Read should succeed."), 300);

		writer.increase_delay(&domain, 2.).await.expect("Increase should succeed.");

		assert_eq!(writer.get_delay(&domain).await.expect("Read should succeed."), 600);
		assert_eq!(
			reader.get_delay(&domain).await.expect("Read should succeed."),
			300,
			"A fresh local entry may serve a stale value."
		);
		assert_eq!(reader.snapshot(&domain).await.expect("Snapshot should succeed.").delay_ms, 600);
	}

	#[tokio::test]
	async fn circuit_and_failures_round_trip_and_reset() {
		let controller = controller(Arc::new(MemoryStore::default()));
		let domain = domain();

		assert!(!controller.is_circuit_open(&domain).await.expect("Read should succeed."));
		assert_eq!(controller.increment_failure_count(&domain).await.expect("Increment."), 1);
		assert_eq!(controller.increment_failure_count(&domain).await.expect("Increment."), 2);

		controller.open_circuit(&domain, 60).await.expect("Open should succeed.");

		let snapshot = controller.snapshot(&domain).await.expect("Snapshot should succeed.");

		assert_eq!(snapshot.failure_count, 2);
		assert!(snapshot.circuit_open_until.is_some_and(|until| until > OffsetDateTime::now_utc()));

		controller.reset(&domain).await.expect("Reset should succeed.");

		assert!(!controller.is_circuit_open(&domain).await.expect("Read should succeed."));
		assert_eq!(controller.failure_count(&domain).await.expect("Read should succeed."), 0);
	}

	#[tokio::test]
	async fn circuit_closes_when_store_expiry_passes() {
		let controller = controller(Arc::new(MemoryStore::default()));
		let domain = domain();

		controller.open_circuit(&domain, 1).await.expect("Open should succeed.");

		assert!(controller.is_circuit_open(&domain).await.expect("Read should succeed."));

		tokio::time::sleep(StdDuration::from_millis(1_100)).await;

		assert!(!controller.is_circuit_open(&domain).await.expect("Read should succeed."));
	}
}
