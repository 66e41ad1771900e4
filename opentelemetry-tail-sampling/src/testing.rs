//! Test doubles shared by the unit tests.
use crate::category::SpanCategory;
use crate::config::{TailSamplingConfig, TailSamplingConfigBuilder};
use crate::sampler::CategorySampler;
use opentelemetry::trace::{
    Span as _, SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState, Tracer,
    TracerProvider as _,
};
use opentelemetry::Context;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, Span, SpanData, SpanProcessor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Downstream stand-in recording every call it receives.
#[derive(Clone, Debug, Default)]
pub(crate) struct CapturingProcessor {
    spans: Arc<Mutex<Vec<SpanData>>>,
    force_flush_calls: Arc<AtomicUsize>,
    shutdown_calls: Arc<AtomicUsize>,
}

impl CapturingProcessor {
    pub(crate) fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    pub(crate) fn take_spans(&self) -> Vec<SpanData> {
        std::mem::take(&mut *self.spans.lock().unwrap())
    }

    pub(crate) fn force_flush_calls(&self) -> usize {
        self.force_flush_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

impl SpanProcessor for CapturingProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {}

    fn on_end(&self, span: SpanData) {
        self.spans.lock().unwrap().push(span);
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.force_flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Produces completed spans through a real SDK tracer, with every head
/// decision either sampled or record-only.
#[derive(Debug)]
pub(crate) struct SpanFactory {
    _provider: SdkTracerProvider,
    tracer: SdkTracer,
    capture: CapturingProcessor,
}

impl SpanFactory {
    pub(crate) fn sampled() -> Self {
        SpanFactory::with_ratio(1.0)
    }

    pub(crate) fn unsampled() -> Self {
        SpanFactory::with_ratio(0.0)
    }

    fn with_ratio(ratio: f64) -> Self {
        let config = SpanCategory::ALL
            .into_iter()
            .fold(TailSamplingConfigBuilder::defaults(), |builder, category| {
                builder.with_sampling_ratio(category, ratio)
            })
            .build();
        SpanFactory::with_config(&config)
    }

    pub(crate) fn with_config(config: &TailSamplingConfig) -> Self {
        let capture = CapturingProcessor::default();
        let provider = SdkTracerProvider::builder()
            .with_sampler(CategorySampler::new(config))
            .with_span_processor(capture.clone())
            .build();
        let tracer = provider.tracer("tail-sampling-test");
        SpanFactory {
            _provider: provider,
            tracer,
            capture,
        }
    }

    /// A single completed root span.
    pub(crate) fn root(&self, name: &str, duration: Duration) -> SpanData {
        let start = SystemTime::now();
        let mut span = self
            .tracer
            .span_builder(name.to_string())
            .with_start_time(start)
            .start(&self.tracer);
        span.end_with_timestamp(start + duration);
        self.single()
    }

    /// A completed trace: each child ends before the root, spans are returned
    /// in completion order (children first, root last).
    pub(crate) fn trace(
        &self,
        root: (&str, Duration),
        children: &[(&str, Duration)],
    ) -> Vec<SpanData> {
        let start = SystemTime::now();
        let root_span = self
            .tracer
            .span_builder(root.0.to_string())
            .with_start_time(start)
            .start(&self.tracer);
        let cx = Context::current_with_span(root_span);
        for (name, duration) in children {
            let mut child = self
                .tracer
                .span_builder(name.to_string())
                .with_start_time(start)
                .start_with_context(&self.tracer, &cx);
            child.end_with_timestamp(start + *duration);
        }
        cx.span().end_with_timestamp(start + root.1);
        self.capture.take_spans()
    }

    /// A span whose parent lives in another process, so its trace root is
    /// never seen locally.
    pub(crate) fn remote_child(&self, name: &str, duration: Duration, trace_id: TraceId) -> SpanData {
        let parent = Context::new().with_remote_span_context(SpanContext::new(
            trace_id,
            SpanId::from(0x5eed),
            TraceFlags::default(),
            true,
            TraceState::default(),
        ));
        let start = SystemTime::now();
        let mut span = self
            .tracer
            .span_builder(name.to_string())
            .with_start_time(start)
            .start_with_context(&self.tracer, &parent);
        span.end_with_timestamp(start + duration);
        self.single()
    }

    fn single(&self) -> SpanData {
        let mut spans = self.capture.take_spans();
        assert_eq!(spans.len(), 1, "expected exactly one completed span");
        spans.remove(0)
    }
}
