//! Per-domain admission control and adaptive pacing backed by the shared store.
//!
//! [`TokenBucket`] gates how many calls a domain admits per refill interval, while
//! [`AdaptiveController`] owns the slower feedback loop: the adaptive delay, the consecutive
//! failure counter, and the expiring circuit-breaker flag. Both keep their authoritative state
//! in a [`SharedStore`](crate::store::SharedStore) so every process instance observes the same
//! view of a domain.

pub mod adaptive;
pub mod bucket;

pub use adaptive::*;
pub use bucket::*;

// std
use std::time::Duration as StdDuration;
// crates.io
use rand::Rng;
use tokio_util::sync::CancellationToken;
// self
use crate::_prelude::*;

/// Sleeps for `duration`, returning [`Error::Cancelled`] as soon as `cancel` fires.
pub(crate) async fn pause(duration: StdDuration, cancel: Option<&CancellationToken>) -> Result<()> {
	let Some(token) = cancel else {
		tokio::time::sleep(duration).await;

		return Ok(());
	};

	tokio::select! {
		biased;
		_ = token.cancelled() => Err(Error::Cancelled),
		_ = tokio::time::sleep(duration) => Ok(()),
	}
}

/// Returns `base` plus a uniform random offset in `0..=spread` milliseconds.
pub(crate) fn jittered_ms(base: u64, spread: u64) -> u64 {
	if spread == 0 {
		return base;
	}

	base.saturating_add(rand::rng().random_range(0..=spread))
}

/// Returns a uniform random value in `center ± spread`, floored at zero.
pub(crate) fn centered_ms(center: u64, spread: u64) -> u64 {
	if spread == 0 {
		return center;
	}

	let offset = rand::rng().random_range(0..=spread.saturating_mul(2));

	center.saturating_add(offset).saturating_sub(spread)
}

/// Wall-clock milliseconds since the Unix epoch, shared across processes.
pub(crate) fn now_ms() -> i64 {
	i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn jitter_stays_within_bounds() {
		for _ in 0..256 {
			let admission = jittered_ms(80, 70);
			let centered = centered_ms(300, 200);
			let floored = centered_ms(50, 200);

			assert!((80..=150).contains(&admission));
			assert!((100..=500).contains(&centered));
			assert!(floored <= 250);
		}

		assert_eq!(jittered_ms(80, 0), 80);
		assert_eq!(centered_ms(300, 0), 300);
	}

	#[tokio::test]
	async fn pause_returns_cancelled_when_token_fires() {
		let token = CancellationToken::new();

		token.cancel();

		let result = pause(StdDuration::from_secs(30), Some(&token)).await;

		assert!(matches!(result, Err(Error::Cancelled)));
		assert!(pause(StdDuration::from_millis(1), None).await.is_ok());
	}
}
