use crate::category::{PerCategory, SpanCategory};
use crate::config::TailSamplingConfig;
use opentelemetry::{
    trace::{
        Link, SamplingDecision, SamplingResult, SpanId, SpanKind, TraceContextExt, TraceId,
        TraceState,
    },
    Context, KeyValue,
};
use opentelemetry_sdk::trace::{Sampler, ShouldSample};

/// Head sampler applying an independent trace-id ratio per [`SpanCategory`].
///
/// Unlike [`Sampler::TraceIdRatioBased`], this sampler never drops a span
/// outright:
///
/// * A root span that loses the ratio draw is created as
///   [`SamplingDecision::RecordOnly`]. It is not exported by itself, but the
///   [`TraceAggregator`] still sees it complete and can promote the whole trace
///   if any of its spans turns out to be slow.
/// * A child span inherits [`SamplingDecision::RecordAndSample`] from a
///   sampled parent, and is [`SamplingDecision::RecordOnly`] otherwise.
///
/// Whether a span has a parent is decided by the parent span id alone, so a
/// span started from a propagated remote context is a child even though no
/// parent span object exists in this process.
///
/// [`TraceAggregator`]: crate::TraceAggregator
#[derive(Clone, Debug)]
pub struct CategorySampler {
    ratio_samplers: PerCategory<Sampler>,
}

impl CategorySampler {
    /// Creates a sampler using the ratios of `config`.
    pub fn new(config: &TailSamplingConfig) -> Self {
        CategorySampler {
            ratio_samplers: config.sampling_ratios.map(Sampler::TraceIdRatioBased),
        }
    }

    /// Head decision for a span with no parent.
    pub fn sample_root(&self, trace_id: TraceId, name: &str) -> SamplingDecision {
        self.root_decision(trace_id, name, &SpanKind::Internal, &[], &[])
    }

    fn root_decision(
        &self,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingDecision {
        let sampler = self.ratio_samplers.get(SpanCategory::from_span_name(name));
        match sampler
            .should_sample(None, trace_id, name, span_kind, attributes, links)
            .decision
        {
            SamplingDecision::Drop => SamplingDecision::RecordOnly,
            decision => decision,
        }
    }
}

impl ShouldSample for CategorySampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let decision = match parent_sampled(parent_context) {
            Some(true) => SamplingDecision::RecordAndSample,
            Some(false) => SamplingDecision::RecordOnly,
            None => self.root_decision(trace_id, name, span_kind, attributes, links),
        };

        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: match parent_context {
                Some(ctx) => ctx.span().span_context().trace_state().clone(),
                None => TraceState::default(),
            },
        }
    }
}

/// `Some(sampled)` when the context carries a parent span, `None` for a root.
fn parent_sampled(parent_context: Option<&Context>) -> Option<bool> {
    parent_context
        .filter(|cx| cx.has_active_span())
        .and_then(|cx| {
            let span = cx.span();
            let parent = span.span_context();
            (parent.span_id() != SpanId::INVALID).then_some(parent.is_sampled())
        })
}
