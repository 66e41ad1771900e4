//! # OpenTelemetry Tail Sampling
//!
//! Trace sampling for services whose spans fall into a few well-known kinds
//! of work (regular requests, update ticks, network packets, world scripts),
//! where high-volume kinds must be sampled aggressively but slow operations
//! must never be lost.
//!
//! The pipeline has three stages:
//!
//! * [`CategorySampler`] is the head sampler. It applies a per-category
//!   trace-id ratio to root spans and makes children follow their parent. A
//!   root that loses the draw is still recorded, just not sampled.
//! * [`ThresholdTagger`] flags every completed span that ran longer than the
//!   threshold of its category, forcing it to be sampled.
//! * [`TraceAggregator`] buffers completed spans per trace and forwards the
//!   whole trace to a downstream [`SpanProcessor`] if any of its spans was
//!   sampled or slow.
//!
//! ```no_run
//! use opentelemetry::trace::{Tracer, TracerProvider as _};
//! use opentelemetry_sdk::trace::{BatchSpanProcessor, InMemorySpanExporter, SdkTracerProvider};
//! use opentelemetry_tail_sampling::{TailSamplingConfig, TailSamplingExt};
//!
//! let exporter = InMemorySpanExporter::default();
//! let provider = SdkTracerProvider::builder()
//!     .with_tail_sampling(
//!         TailSamplingConfig::default(),
//!         BatchSpanProcessor::builder(exporter.clone()).build(),
//!     )
//!     .build();
//!
//! provider.tracer("game-server").in_span("RecvPacket", |_cx| {
//!     // handle the packet
//! });
//!
//! provider.shutdown().unwrap();
//! ```
//!
//! ## Configuration
//!
//! See [`TailSamplingConfigBuilder`] for the knobs and the environment
//! variables overriding their defaults.
//!
//! [`SpanProcessor`]: opentelemetry_sdk::trace::SpanProcessor
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

mod aggregator;
mod category;
mod config;
mod error;
mod sampler;
mod tagger;
#[cfg(test)]
mod testing;

pub use aggregator::{TraceAggregator, TraceAggregatorBuilder, TraceAggregatorStats};
pub use category::{PerCategory, SpanCategory};
pub use config::{TailSamplingConfig, TailSamplingConfigBuilder};
pub use error::ConfigError;
pub use sampler::CategorySampler;
pub use tagger::{
    ThresholdTagger, DURATION_MS_KEY, SLOW_OPERATION_DESCRIPTION, SLOW_OPERATION_KEY,
};

use opentelemetry_sdk::trace::{SpanProcessor, TracerProviderBuilder};

/// Installs the tail sampling pipeline on a [`TracerProviderBuilder`].
pub trait TailSamplingExt {
    /// Sets a [`CategorySampler`] as the provider's sampler and registers a
    /// [`TraceAggregator`] forwarding kept traces to `downstream`.
    ///
    /// Any sampler set earlier is replaced. Span processors registered
    /// directly on the builder still see every recorded span, unfiltered.
    fn with_tail_sampling<P>(self, config: TailSamplingConfig, downstream: P) -> Self
    where
        P: SpanProcessor + 'static;
}

impl TailSamplingExt for TracerProviderBuilder {
    fn with_tail_sampling<P>(self, config: TailSamplingConfig, downstream: P) -> Self
    where
        P: SpanProcessor + 'static,
    {
        self.with_sampler(CategorySampler::new(&config))
            .with_span_processor(TraceAggregator::new(downstream, config))
    }
}
