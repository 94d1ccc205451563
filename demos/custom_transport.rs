//! Demonstrates plugging a custom transport and an outcome sink into the guard.
//!
//! 1. Implement [`HttpTransport`] so the guard can execute requests without reqwest.
//! 2. Map native failures onto [`TransportError`] so timeouts and unreachable hosts are classified.
//! 3. Attach an [`OutcomeSink`] closure to observe every attempt.
//! 4. Call the same endpoint twice to see a 429 retry followed by a cache hit.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration as StdDuration,
};
// crates.io
use color_eyre::Result;
use url::Url;
// self
use upstream_guard::{
	config::GuardConfig,
	domain::Domain,
	error::TransportError,
	guard::{CallRequest, Guard},
	http::{HttpTransport, OutboundRequest, TransportFuture, TransportResponse},
	obs::CallOutcome,
	store::{MemoryStore, SharedStore},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::default());
	let config = GuardConfig::default().with_delays(50, 10, 2_000).with_delay_jitter_ms(20);
	let printer = |outcome: &CallOutcome| {
		println!(
			"attempt {} -> {:?} {}",
			outcome.attempt,
			outcome.status,
			outcome.message.as_deref().unwrap_or("ok")
		);
	};
	let guard =
		Guard::<FlakyTransport>::with_transport(store, config, FlakyTransport::default())?
			.with_sink(printer);
	let url = Url::parse("https://api.example.com/profiles/ferris")?;
	let first = guard.call(CallRequest::get(url.clone())).await?;

	println!("First call answered {} after a rate-limit retry: {}.", first.status, first.text());

	let second = guard.call(CallRequest::get(url.clone())).await?;

	println!("Second call served from cache: {}.", second.from_cache);

	let snapshot = guard.snapshot(&Domain::from_url(&url)?).await?;

	println!("Adaptive delay for {} is now {}ms.", snapshot.domain, snapshot.delay_ms);

	let offline = Guard::<OfflineTransport>::with_transport(
		Arc::new(MemoryStore::default()),
		GuardConfig::default(),
		OfflineTransport,
	)?;
	let err = offline
		.call(CallRequest::get(url).without_cache())
		.await
		.expect_err("Offline transport always fails.");

	println!("Offline call failed as {} with status {:?}.", err.kind(), err.status());

	Ok(())
}

/// Answers 429 on the first request and 200 afterwards.
#[derive(Debug, Default)]
struct FlakyTransport {
	calls: AtomicUsize,
}
impl HttpTransport for FlakyTransport {
	fn execute<'a>(
		&'a self,
		request: &'a OutboundRequest,
		_timeout: StdDuration,
	) -> TransportFuture<'a> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst);

		Box::pin(async move {
			if call == 0 {
				return Ok(TransportResponse::new(429, [("retry-after", "0")], "slow down"));
			}

			let body = format!(r#"{{"path":"{}"}}"#, request.url.path());

			Ok(TransportResponse::new(
				200,
				[("content-type", "application/json"), ("x-ratelimit-remaining", "40")],
				body,
			))
		})
	}
}

/// Fails every request as if DNS resolution had failed.
#[derive(Debug)]
struct OfflineTransport;
impl HttpTransport for OfflineTransport {
	fn execute<'a>(&'a self, _: &'a OutboundRequest, _: StdDuration) -> TransportFuture<'a> {
		Box::pin(async move {
			Err(TransportError::unreachable(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				"dns lookup failed",
			)))
		})
	}
}
