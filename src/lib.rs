//! Resilient outbound HTTP layer: per-domain token buckets, adaptive delays, shared-state circuit
//! breakers, and content-aware response caching behind one `call` entry point.
//!
//! Every piece of rate, circuit, bucket, and cache state lives in a [`SharedStore`](store::SharedStore)
//! so several processes pointing at the same backend cooperate without in-process locks.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod guard;
pub mod http;
pub mod obs;
pub mod rate;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::{
		collections::VecDeque,
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration as StdDuration,
	};
	// self
	#[cfg(feature = "reqwest")] use crate::{guard::ReqwestGuard, http::ReqwestTransport};
	use crate::{
		config::{GuardConfig, Profile},
		error::TransportError,
		guard::Guard,
		http::{HttpTransport, OutboundRequest, TransportFuture, TransportResponse},
		obs::RecordingSink,
		store::{MemoryStore, SharedStore},
	};

	/// Configuration with millisecond-scale delays so retry tests finish quickly.
	pub fn test_config() -> GuardConfig {
		GuardConfig::default()
			.with_profile(Profile::Test)
			.with_delays(5, 1, 5_000)
			.with_delay_jitter_ms(0)
			.with_bucket(100, 1_000)
			.with_admission_poll(5, 5)
			.with_timeout_backoff_ms(5)
	}

	/// Constructs a [`Guard`] over `transport`, backed by an in-memory store and a recording sink.
	pub fn build_test_guard<T>(
		config: GuardConfig,
		transport: T,
	) -> (Guard<T>, Arc<MemoryStore>, RecordingSink)
	where
		T: HttpTransport,
	{
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn SharedStore> = store_backend.clone();
		let sink = RecordingSink::default();
		let guard = Guard::<T>::with_transport(store, config, transport)
			.expect("Test guard configuration should validate.")
			.with_sink(sink.clone());

		(guard, store_backend, sink)
	}

	/// Builds a reqwest transport that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	#[cfg(feature = "reqwest")]
	pub fn test_reqwest_transport() -> ReqwestTransport {
		let client = ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestTransport::with_client(client)
	}

	/// Constructs a reqwest-backed [`Guard`] for `httpmock` integration tests.
	#[cfg(feature = "reqwest")]
	pub fn build_reqwest_test_guard(
		config: GuardConfig,
	) -> (ReqwestGuard, Arc<MemoryStore>, RecordingSink) {
		build_test_guard(config, test_reqwest_transport())
	}

	/// One canned behavior of a [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub enum Step {
		/// Answer with an empty-bodied response carrying this status.
		Status(u16),
		/// Answer with this response.
		Respond(TransportResponse),
		/// Fail with [`TransportError::Timeout`].
		Timeout,
		/// Fail with [`TransportError::Unreachable`].
		Unreachable,
		/// Sleep for the duration, then answer 200.
		Hang(StdDuration),
	}

	/// Transport replaying a fixed script; the final step repeats once the script runs out.
	#[derive(Debug)]
	pub struct ScriptedTransport {
		steps: Mutex<VecDeque<Step>>,
		calls: AtomicUsize,
	}
	impl ScriptedTransport {
		/// Creates a transport replaying `steps` in order.
		pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
			Self { steps: Mutex::new(steps.into_iter().collect()), calls: AtomicUsize::new(0) }
		}

		/// Number of requests executed so far.
		pub fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}

		fn next_step(&self) -> Step {
			let mut steps = self.steps.lock();

			match steps.len() {
				0 => Step::Status(200),
				1 => steps[0].clone(),
				_ => steps.pop_front().unwrap_or(Step::Status(200)),
			}
		}
	}
	impl HttpTransport for ScriptedTransport {
		fn execute<'a>(
			&'a self,
			_: &'a OutboundRequest,
			_: StdDuration,
		) -> TransportFuture<'a> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			let step = self.next_step();

			Box::pin(async move {
				match step {
					Step::Status(status) =>
						Ok(TransportResponse::new(status, Vec::<(String, String)>::new(), Vec::new())),
					Step::Respond(response) => Ok(response),
					Step::Timeout => Err(TransportError::Timeout),
					Step::Unreachable => Err(TransportError::unreachable(std::io::Error::new(
						std::io::ErrorKind::ConnectionRefused,
						"connection refused",
					))),
					Step::Hang(duration) => {
						tokio::time::sleep(duration).await;

						Ok(TransportResponse::new(200, Vec::<(String, String)>::new(), Vec::new()))
					},
				}
			})
		}
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
