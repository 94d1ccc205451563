//! Call orchestrator composing the cache, circuit breaker, token bucket, and adaptive delay.
//!
//! [`Guard::call`] runs every request through the same pipeline:
//!
//! 1. Serve a fresh cache entry when one exists; hits bypass every other stage.
//! 2. Fail fast with [`Error::CircuitOpen`] when the domain's circuit is open, or open it when the
//!    failure counter is already past the threshold.
//! 3. Wait for a token, then sleep the adaptive delay with jitter.
//! 4. Execute the attempt under its own timeout and classify the result.
//!
//! 429s and timeouts are retried up to the attempt budget. 5xx responses, unreachable remotes, and
//! other 4xx rejections fail fast after bumping the failure counter. Each attempt is reported to
//! the configured [`OutcomeSink`]. Once the remote has answered, store failures while updating
//! the adaptive state or the cache are logged and never replace the response.

pub mod call;

mod classify;
mod metrics;

pub use call::*;
pub use metrics::*;

// std
use std::time::Duration as StdDuration;
// crates.io
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	cache::{CacheKey, ResponseCache},
	config::GuardConfig,
	domain::Domain,
	error::{ConfigError, ErrorKind, TransportError},
	http::{HttpTransport, OutboundRequest, TransportResponse},
	obs::{self, CallOutcome, CallResult, CallSpan, NoopSink, OutcomeSink, trace_event},
	rate::{self, AdaptiveController, RateSnapshot, TokenBucket},
	store::SharedStore,
};
#[cfg(feature = "reqwest")] use crate::http::ReqwestTransport;

#[cfg(feature = "reqwest")]
/// Guard specialized for the crate's default reqwest transport.
pub type ReqwestGuard = Guard<ReqwestTransport>;

/// Resilient front door for outbound calls.
///
/// The guard owns the transport, the shared store handle, and the per-domain controllers built on
/// top of it. Cloning is cheap and clones share the controllers' local caches and metrics.
pub struct Guard<T>
where
	T: HttpTransport,
{
	/// Transport used for every attempt.
	pub transport: Arc<T>,
	/// Shared store holding rate, circuit, bucket, and cache state.
	pub store: Arc<dyn SharedStore>,
	/// Always-on counters for calls made through this guard.
	pub metrics: Arc<CallMetrics>,
	config: Arc<GuardConfig>,
	bucket: TokenBucket,
	controller: Arc<AdaptiveController>,
	cache: ResponseCache,
	sink: Arc<dyn OutcomeSink>,
}
impl<T> Guard<T>
where
	T: HttpTransport,
{
	/// Creates a guard over the caller-provided transport.
	pub fn with_transport(
		store: Arc<dyn SharedStore>,
		config: GuardConfig,
		transport: impl Into<Arc<T>>,
	) -> Result<Self> {
		config.validate()?;

		Ok(Self {
			transport: transport.into(),
			bucket: TokenBucket::new(store.clone(), &config),
			controller: Arc::new(AdaptiveController::new(store.clone(), &config)),
			cache: ResponseCache::new(store.clone(), &config),
			store,
			metrics: Default::default(),
			config: Arc::new(config),
			sink: Arc::new(NoopSink),
		})
	}

	/// Sets or replaces the sink receiving per-attempt outcomes.
	pub fn with_sink(mut self, sink: impl 'static + OutcomeSink) -> Self {
		self.sink = Arc::new(sink);

		self
	}

	/// Active configuration.
	pub fn config(&self) -> &GuardConfig {
		&self.config
	}

	/// Token bucket gating admissions.
	pub fn bucket(&self) -> &TokenBucket {
		&self.bucket
	}

	/// Adaptive delay and circuit-breaker controller.
	pub fn controller(&self) -> &AdaptiveController {
		&self.controller
	}

	/// Response cache.
	pub fn cache(&self) -> &ResponseCache {
		&self.cache
	}

	/// Reads the adaptive state of `domain`.
	pub async fn snapshot(&self, domain: &Domain) -> Result<RateSnapshot> {
		self.controller.snapshot(domain).await
	}

	/// Administrative reset of the delay, failure counter, and circuit for `domain`.
	pub async fn reset_domain(&self, domain: &Domain) -> Result<()> {
		self.controller.reset(domain).await
	}

	/// Drops every cached response for `domain`.
	pub async fn invalidate_cache(&self, domain: &Domain) -> Result<u64> {
		self.cache.invalidate(domain).await
	}

	/// Executes `request` through the full resilience pipeline.
	pub async fn call(&self, request: CallRequest) -> Result<CallResponse> {
		let domain = Domain::from_url(&request.url).map_err(ConfigError::from)?;
		let span = CallSpan::new(&domain, request.method);

		self.metrics.record_call();

		let result = span.instrument(self.run(&domain, &request)).await;
		let label = match &result {
			Ok(response) if response.from_cache => CallResult::CacheHit,
			Ok(_) => CallResult::Success,
			Err(e) => CallResult::from(e),
		};

		obs::record_call_outcome(label);
		self.metrics.record_result(label);

		result
	}

	async fn run(&self, domain: &Domain, request: &CallRequest) -> Result<CallResponse> {
		let cache_key = (request.cache.use_cache && request.method.is_cacheable())
			.then(|| self.cache.key(request.method, &request.url, request.body.as_deref()))
			.transpose()?;
		let cached = match &cache_key {
			Some(key) => self.cache.get(key).await?,
			None => None,
		};

		if let Some(hit) = cached {
			trace_event!(debug, domain = %domain, "served from cache");

			return Ok(hit.into());
		}

		let cancel = request.cancel.as_ref();
		let outbound = request.outbound();
		let attempts = request.attempts();
		let mut attempt = 0;

		loop {
			attempt += 1;

			self.ensure_circuit_closed(domain).await?;
			self.bucket.wait_for_token(domain, cancel).await?;

			let delay = self.controller.get_delay(domain).await?;

			rate::pause(
				StdDuration::from_millis(rate::centered_ms(delay, self.config.delay_jitter_ms)),
				cancel,
			)
			.await?;

			let err = match self.execute(domain, &outbound, request.timeout).await {
				Ok(response) => {
					self.emit(request, domain, attempt, delay, Some(response.status), None);

					return Ok(self.on_success(domain, cache_key.as_ref(), request, response).await);
				},
				Err(err) => err,
			};

			self.emit(request, domain, attempt, delay, err.status(), Some(&err));

			match err.kind() {
				ErrorKind::RateLimited =>
					self.on_rate_limited(domain, attempt, attempts, &err, cancel).await?,
				ErrorKind::Timeout => self.on_timeout(domain, attempt, attempts, cancel).await?,
				ErrorKind::NetworkUnreachable | ErrorKind::ServerError | ErrorKind::Rejected => {
					self.record_failure(domain).await?;

					return Err(err);
				},
				_ => return Err(err),
			}

			if attempt >= attempts {
				trace_event!(warn, domain = %domain, attempts = attempt, "retry budget exhausted");

				return Err(Error::Exhausted { attempts: attempt, last: Box::new(err) });
			}
		}
	}

	async fn ensure_circuit_closed(&self, domain: &Domain) -> Result<()> {
		if self.controller.is_circuit_open(domain).await? {
			return Err(Error::CircuitOpen { domain: domain.clone() });
		}
		if self.controller.failure_count(domain).await? > u64::from(self.config.failure_threshold()) {
			self.controller.open_circuit(domain, self.config.circuit_open_secs).await?;

			return Err(Error::CircuitOpen { domain: domain.clone() });
		}

		Ok(())
	}

	async fn execute(
		&self,
		domain: &Domain,
		outbound: &OutboundRequest,
		timeout: StdDuration,
	) -> Result<TransportResponse> {
		let result = tokio::time::timeout(timeout, self.transport.execute(outbound, timeout))
			.await
			.unwrap_or_else(|_| Err(TransportError::Timeout));

		classify::classify(domain, timeout, result)
	}

	async fn on_success(
		&self,
		domain: &Domain,
		cache_key: Option<&CacheKey>,
		request: &CallRequest,
		response: TransportResponse,
	) -> CallResponse {
		if let Err(e) = self.controller.reset_failure_count(domain).await {
			obs::record_bookkeeping_failure(domain, "reset_failures", &e);
		}
		if let Err(e) = self.adapt_after_success(domain, &response).await {
			obs::record_bookkeeping_failure(domain, "adapt_delay", &e);
		}

		let cached = match cache_key {
			Some(key) => self.cache.set(key, &response, request.cache.ttl).await.map(|_| ()),
			None => Ok(()),
		};

		if let Err(e) = cached {
			obs::record_bookkeeping_failure(domain, "cache_write", &e);
		}

		response.into()
	}

	async fn adapt_after_success(
		&self,
		domain: &Domain,
		response: &TransportResponse,
	) -> Result<()> {
		self.controller.decrease_delay(domain).await?;

		if response.remaining_quota().is_some_and(|r| r < self.config.low_quota_threshold) {
			self.controller.increase_delay(domain, GuardConfig::BACKOFF_FACTOR).await?;

			trace_event!(info, domain = %domain, "remote quota running low");
		}

		Ok(())
	}

	async fn on_rate_limited(
		&self,
		domain: &Domain,
		attempt: u32,
		attempts: u32,
		err: &Error,
		cancel: Option<&CancellationToken>,
	) -> Result<()> {
		let factor = GuardConfig::BACKOFF_FACTOR.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
		let delay = self.controller.increase_delay(domain, factor).await?;

		trace_event!(warn, domain = %domain, attempt, delay_ms = delay, "rate limited by remote");

		if attempt >= attempts {
			return Ok(());
		}

		// Upstream hints never park a call longer than the delay ceiling.
		let ceiling = StdDuration::from_millis(self.config.max_delay_ms);
		let hinted = match err {
			Error::RateLimited { retry_after: Some(hint), .. } =>
				StdDuration::try_from(*hint).unwrap_or_default().min(ceiling),
			_ => StdDuration::ZERO,
		};

		rate::pause(StdDuration::from_millis(delay).max(hinted), cancel).await
	}

	async fn on_timeout(
		&self,
		domain: &Domain,
		attempt: u32,
		attempts: u32,
		cancel: Option<&CancellationToken>,
	) -> Result<()> {
		self.record_failure(domain).await?;

		if attempt >= attempts {
			return Ok(());
		}

		let base = self.config.timeout_backoff_ms as f64
			* GuardConfig::BACKOFF_FACTOR.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
		let base = base.min(u64::MAX as f64) as u64;
		let backoff = rate::jittered_ms(base, base / 5);

		trace_event!(warn, domain = %domain, attempt, backoff_ms = backoff, "attempt timed out");

		rate::pause(StdDuration::from_millis(backoff), cancel).await
	}

	async fn record_failure(&self, domain: &Domain) -> Result<()> {
		let failures = self.controller.increment_failure_count(domain).await?;

		if failures > u64::from(self.config.failure_threshold()) {
			self.controller.open_circuit(domain, self.config.circuit_open_secs).await?;
		}

		Ok(())
	}

	fn emit(
		&self,
		request: &CallRequest,
		domain: &Domain,
		attempt: u32,
		delay_ms: u64,
		status: Option<u16>,
		err: Option<&Error>,
	) {
		let kind = err.map(Error::kind);

		obs::record_attempt(status);
		self.metrics.record_attempt(kind);
		self.sink.on_call_outcome(&CallOutcome {
			url: request.url.clone(),
			domain: domain.clone(),
			attempt,
			delay_ms,
			status,
			kind,
			message: err.map(ToString::to_string),
			timestamp: OffsetDateTime::now_utc(),
		});
	}
}
impl<T> Clone for Guard<T>
where
	T: HttpTransport,
{
	fn clone(&self) -> Self {
		Self {
			transport: self.transport.clone(),
			store: self.store.clone(),
			metrics: self.metrics.clone(),
			config: self.config.clone(),
			bucket: self.bucket.clone(),
			controller: self.controller.clone(),
			cache: self.cache.clone(),
			sink: self.sink.clone(),
		}
	}
}
#[cfg(feature = "reqwest")]
impl Guard<ReqwestTransport> {
	/// Creates a guard that provisions its own reqwest transport.
	pub fn new(store: Arc<dyn SharedStore>, config: GuardConfig) -> Result<Self> {
		Self::with_transport(store, config, ReqwestTransport::default())
	}
}
impl<T> Debug for Guard<T>
where
	T: HttpTransport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Guard")
			.field("config", &self.config)
			.field("bucket", &self.bucket)
			.field("controller", &self.controller)
			.field("cache", &self.cache)
			.finish()
	}
}
