//! Token bucket admission control with compare-and-swap commits.
//!
//! Bucket state (`tokens` plus `last_refill_ms`) lives under a single store key so every
//! admission commits through [`SharedStore::compare_and_swap`]. A writer that loses the race
//! recomputes from a fresh read, which removes the over-admission a plain read-then-write
//! would allow while keeping the refill formula unchanged.

// std
use std::time::Duration as StdDuration;
// crates.io
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	config::GuardConfig,
	domain::Domain,
	obs::trace_event,
	rate,
	store::{CompareAndSwapOutcome, KeySpace, SharedStore, StoreError},
};

/// Persisted bucket state for one domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
	/// Tokens left after the last admission.
	pub tokens: u32,
	/// Wall-clock instant (Unix milliseconds) of the last admission.
	pub last_refill_ms: i64,
}
impl BucketState {
	/// State of a bucket that has never been touched.
	pub fn full(limit: u32, now_ms: i64) -> Self {
		Self { tokens: limit, last_refill_ms: now_ms }
	}

	/// Tokens available at `now_ms`: whole refill intervals elapsed times `limit`, capped at `limit`.
	pub fn available(&self, limit: u32, refill_ms: u64, now_ms: i64) -> u32 {
		let elapsed = u64::try_from(now_ms.saturating_sub(self.last_refill_ms)).unwrap_or(0);
		let refill = (elapsed / refill_ms.max(1)).saturating_mul(u64::from(limit));
		let total = u64::from(self.tokens).saturating_add(refill).min(u64::from(limit));

		u32::try_from(total).unwrap_or(limit)
	}

	fn encode(&self) -> Result<String, StoreError> {
		serde_json::to_string(self).map_err(|e| StoreError::Serialization {
			message: format!("Failed to encode bucket state: {e}"),
		})
	}

	fn decode(raw: &str) -> Result<Self, StoreError> {
		serde_json::from_str(raw).map_err(|e| StoreError::Serialization {
			message: format!("Failed to decode bucket state: {e}"),
		})
	}
}

/// Per-domain rate gate shared by every process that points at the same store.
#[derive(Clone)]
pub struct TokenBucket {
	store: Arc<dyn SharedStore>,
	keys: KeySpace,
	limit: u32,
	refill_ms: u64,
	poll_ms: u64,
	poll_jitter_ms: u64,
}
impl TokenBucket {
	const MAX_CONTENTION_RETRIES: usize = 8;

	/// Creates a bucket using the limits from `config`.
	pub fn new(store: Arc<dyn SharedStore>, config: &GuardConfig) -> Self {
		Self {
			store,
			keys: config.key_space(),
			limit: config.bucket_limit,
			refill_ms: config.bucket_refill_ms,
			poll_ms: config.admission_poll_ms,
			poll_jitter_ms: config.admission_jitter_ms,
		}
	}

	/// Takes one token for `domain` using the configured limit and refill interval.
	pub async fn acquire_token(&self, domain: &Domain) -> Result<bool> {
		self.acquire_token_with(domain, self.limit, self.refill_ms).await
	}

	/// Takes one token for `domain`; returns false without mutating state when the bucket is empty.
	pub async fn acquire_token_with(
		&self,
		domain: &Domain,
		limit: u32,
		refill_ms: u64,
	) -> Result<bool> {
		let key = self.keys.bucket(domain);

		for _ in 0..Self::MAX_CONTENTION_RETRIES {
			let now = rate::now_ms();
			let raw = self.store.get(&key).await?;
			let state = match raw.as_deref() {
				Some(raw) => BucketState::decode(raw)?,
				None => BucketState::full(limit, now),
			};
			let available = state.available(limit, refill_ms, now);

			if available == 0 {
				return Ok(false);
			}

			let next = BucketState { tokens: available - 1, last_refill_ms: now }.encode()?;

			match self.store.compare_and_swap(&key, raw.as_deref(), next, None).await? {
				CompareAndSwapOutcome::Updated => return Ok(true),
				CompareAndSwapOutcome::Mismatch => continue,
			}
		}

		trace_event!(debug, domain = %domain, "token bucket contention exhausted retries");

		Ok(false)
	}

	/// Blocks until `domain` admits the call, sleeping a jittered interval between denials.
	///
	/// Fails only when `cancel` fires or the store errors.
	pub async fn wait_for_token(
		&self,
		domain: &Domain,
		cancel: Option<&CancellationToken>,
	) -> Result<()> {
		loop {
			if cancel.is_some_and(CancellationToken::is_cancelled) {
				return Err(Error::Cancelled);
			}
			if self.acquire_token(domain).await? {
				return Ok(());
			}

			let pause = rate::jittered_ms(self.poll_ms, self.poll_jitter_ms);

			rate::pause(StdDuration::from_millis(pause), cancel).await?;
		}
	}

	/// Current persisted state for `domain`, if the bucket has been touched.
	pub async fn state(&self, domain: &Domain) -> Result<Option<BucketState>> {
		let raw = self.store.get(&self.keys.bucket(domain)).await?;

		Ok(raw.as_deref().map(BucketState::decode).transpose()?)
	}

	/// Overwrites the persisted state for `domain`.
	pub async fn set_state(&self, domain: &Domain, state: BucketState) -> Result<()> {
		self.store.set(&self.keys.bucket(domain), state.encode()?, None).await?;

		Ok(())
	}
}
impl Debug for TokenBucket {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenBucket")
			.field("keys", &self.keys)
			.field("limit", &self.limit)
			.field("refill_ms", &self.refill_ms)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::store::MemoryStore;

	fn bucket(limit: u32, refill_ms: u64) -> TokenBucket {
		let config = GuardConfig::default().with_bucket(limit, refill_ms).with_admission_poll(5, 5);

		TokenBucket::new(Arc::new(MemoryStore::default()), &config)
	}

	fn domain() -> Domain {
		Domain::new("bucket.example.com").expect("Domain fixture should be valid.")
	}

	#[test]
	fn refill_counts_whole_intervals_only() {
		let state = BucketState { tokens: 0, last_refill_ms: 1_000 };

		assert_eq!(state.available(10, 1_000, 1_999), 0);
		assert_eq!(state.available(10, 1_000, 2_000), 10);
		assert_eq!(BucketState { tokens: 4, last_refill_ms: 0 }.available(10, 1_000, 5_000), 10);
		assert_eq!(BucketState { tokens: 3, last_refill_ms: 10 }.available(10, 1_000, 5), 3);
	}

	#[tokio::test]
	async fn cold_bucket_admits_at_most_limit_per_window() {
		let bucket = bucket(10, 60_000);
		let domain = domain();
		let mut admitted = 0;

		for _ in 0..25 {
			if bucket.acquire_token(&domain).await.expect("Acquire should not fail.") {
				admitted += 1;
			}
		}

		assert_eq!(admitted, 10);
	}

	#[tokio::test]
	async fn empty_recent_bucket_denies_then_refills() {
		let bucket = bucket(10, 50);
		let domain = domain();
		let seeded = BucketState { tokens: 0, last_refill_ms: rate::now_ms() };

		bucket.set_state(&domain, seeded).await.expect("Seeding bucket state should succeed.");

		assert!(!bucket.acquire_token(&domain).await.expect("Acquire should not fail."));
		assert_eq!(
			bucket.state(&domain).await.expect("State read should succeed."),
			Some(seeded),
			"A denied acquire must not mutate state."
		);

		tokio::time::sleep(StdDuration::from_millis(80)).await;

		assert!(bucket.acquire_token(&domain).await.expect("Acquire should not fail."));

		let after = bucket
			.state(&domain)
			.await
			.expect("State read should succeed.")
			.expect("Admission should persist bucket state.");

		assert_eq!(after.tokens, 9);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_acquires_never_over_admit() {
		let bucket = bucket(5, 60_000);
		let handles = (0..20)
			.map(|_| {
				let bucket = bucket.clone();

				tokio::spawn(async move { bucket.acquire_token(&domain()).await.unwrap_or(false) })
			})
			.collect::<Vec<_>>();
		let mut admitted = 0;

		for handle in handles {
			if handle.await.expect("Acquire task should not panic.") {
				admitted += 1;
			}
		}

		assert!((1..=5).contains(&admitted), "Admitted {admitted} calls from a 5-token bucket.");
	}

	#[tokio::test]
	async fn wait_for_token_blocks_until_refill_and_honors_cancel() {
		let bucket = bucket(1, 40);
		let domain = domain();

		assert!(bucket.acquire_token(&domain).await.expect("First acquire should succeed."));

		let started = std::time::Instant::now();

		bucket.wait_for_token(&domain, None).await.expect("Waiting should eventually admit.");

		assert!(started.elapsed() >= StdDuration::from_millis(30));

		let token = CancellationToken::new();

		token.cancel();

		let err = bucket
			.wait_for_token(&domain, Some(&token))
			.await
			.expect_err("A cancelled wait should fail.");

		assert!(matches!(err, Error::Cancelled));
	}
}
