// self
use crate::{_prelude::*, domain::Domain, http::Method};

/// Logs a store failure hit while updating state after the remote already answered.
pub fn record_bookkeeping_failure(domain: &Domain, stage: &'static str, err: &Error) {
	#[cfg(feature = "tracing")]
	tracing::warn!(
		domain = domain.as_str(),
		stage,
		error = %err,
		"bookkeeping failed after a successful attempt"
	);

	#[cfg(not(feature = "tracing"))]
	{
		let _ = (domain, stage, err);
	}
}

/// Type alias that resolves to an instrumented future when tracing is enabled.
#[cfg(feature = "tracing")]
pub type InstrumentedCall<F> = tracing::instrument::Instrumented<F>;
/// Passthrough future type when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub type InstrumentedCall<F> = F;

/// Span wrapping one guarded call, across every attempt.
#[derive(Clone, Debug)]
pub struct CallSpan {
	#[cfg(feature = "tracing")]
	span: tracing::Span,
}
impl CallSpan {
	/// Creates a new span tagged with the remote domain and HTTP method.
	pub fn new(domain: &Domain, method: Method) -> Self {
		#[cfg(feature = "tracing")]
		{
			let span = tracing::info_span!(
				"upstream_guard.call",
				domain = domain.as_str(),
				method = method.as_str()
			);

			Self { span }
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = (domain, method);

			Self {}
		}
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedCall<Fut>
	where
		Fut: Future,
	{
		#[cfg(feature = "tracing")]
		{
			use tracing::Instrument;

			fut.instrument(self.span.clone())
		}
		#[cfg(not(feature = "tracing"))]
		{
			fut
		}
	}
}
