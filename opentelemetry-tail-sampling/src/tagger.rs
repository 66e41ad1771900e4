use crate::category::{PerCategory, SpanCategory};
use crate::config::TailSamplingConfig;
use opentelemetry::trace::{SpanContext, Status};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::SpanData;
use std::time::Duration;

/// Attribute set to `true` on spans that exceeded their category threshold.
pub const SLOW_OPERATION_KEY: &str = "slow_operation";
/// Attribute holding the span duration in (fractional) milliseconds.
pub const DURATION_MS_KEY: &str = "duration_ms";
/// Status description set on slow spans.
pub const SLOW_OPERATION_DESCRIPTION: &str = "Operation exceeded slow threshold";

/// Flags spans whose duration exceeds the threshold of their [`SpanCategory`].
///
/// A slow span is force-marked as sampled regardless of the head decision,
/// annotated with [`SLOW_OPERATION_KEY`] and [`DURATION_MS_KEY`], and given an
/// error status. Tagging depends only on the span itself and may be applied
/// more than once.
#[derive(Clone, Debug)]
pub struct ThresholdTagger {
    thresholds: PerCategory<Duration>,
}

impl ThresholdTagger {
    /// Creates a tagger using the thresholds of `config`.
    pub fn new(config: &TailSamplingConfig) -> Self {
        ThresholdTagger {
            thresholds: config.slow_thresholds,
        }
    }

    /// Threshold applying to a span called `name`.
    pub fn threshold_for(&self, name: &str) -> Duration {
        *self.thresholds.get(SpanCategory::from_span_name(name))
    }

    /// Whether `span` ran longer than its category threshold.
    pub fn is_slow(&self, span: &SpanData) -> bool {
        span_duration(span) > self.threshold_for(&span.name)
    }

    /// Annotates a completed span. Returns whether the span was slow.
    pub fn tag(&self, span: &mut SpanData) -> bool {
        let duration = span_duration(span);
        if duration > self.threshold_for(&span.name) {
            mark_slow(span, duration);
            true
        } else {
            if span.span_context.is_sampled() && !has_attribute(span, DURATION_MS_KEY) {
                set_attribute(span, DURATION_MS_KEY, duration_ms(duration));
            }
            false
        }
    }

    /// Prepares a span of a kept trace for export.
    pub(crate) fn finalize(&self, span: &mut SpanData) {
        let duration = span_duration(span);
        mark_sampled(span);
        set_attribute(span, DURATION_MS_KEY, duration_ms(duration));
        if duration > self.threshold_for(&span.name) {
            mark_slow(span, duration);
        }
    }
}

/// Wall-clock duration of a completed span, zero if the clock went backwards.
pub(crate) fn span_duration(span: &SpanData) -> Duration {
    span.end_time
        .duration_since(span.start_time)
        .unwrap_or_default()
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

fn mark_slow(span: &mut SpanData, duration: Duration) {
    mark_sampled(span);
    set_attribute(span, SLOW_OPERATION_KEY, true);
    set_attribute(span, DURATION_MS_KEY, duration_ms(duration));
    span.status = Status::error(SLOW_OPERATION_DESCRIPTION);
}

fn mark_sampled(span: &mut SpanData) {
    let cx = &span.span_context;
    if cx.is_sampled() {
        return;
    }
    span.span_context = SpanContext::new(
        cx.trace_id(),
        cx.span_id(),
        cx.trace_flags().with_sampled(true),
        cx.is_remote(),
        cx.trace_state().clone(),
    );
}

fn has_attribute(span: &SpanData, key: &'static str) -> bool {
    span.attributes.iter().any(|kv| kv.key.as_str() == key)
}

fn set_attribute(span: &mut SpanData, key: &'static str, value: impl Into<Value>) {
    let value = value.into();
    match span.attributes.iter_mut().find(|kv| kv.key.as_str() == key) {
        Some(existing) => existing.value = value,
        None => span.attributes.push(KeyValue::new(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TailSamplingConfigBuilder;
    use crate::testing::SpanFactory;

    fn tagger() -> ThresholdTagger {
        let config = TailSamplingConfigBuilder::defaults()
            .with_slow_threshold(SpanCategory::Default, Duration::from_millis(100))
            .with_slow_threshold(SpanCategory::Packet, Duration::from_millis(10))
            .build();
        ThresholdTagger::new(&config)
    }

    fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    fn count_attribute(span: &SpanData, key: &str) -> usize {
        span.attributes
            .iter()
            .filter(|kv| kv.key.as_str() == key)
            .count()
    }

    #[test]
    fn slow_span_is_forced_sampled_and_annotated() {
        let mut span = SpanFactory::unsampled().root("SendPacket", Duration::from_millis(25));
        assert!(!span.span_context.is_sampled());

        assert!(tagger().tag(&mut span));

        assert!(span.span_context.is_sampled());
        assert_eq!(attribute(&span, SLOW_OPERATION_KEY), Some(&Value::Bool(true)));
        assert_eq!(
            attribute(&span, DURATION_MS_KEY),
            Some(&Value::F64(25.0))
        );
        assert_eq!(span.status, Status::error(SLOW_OPERATION_DESCRIPTION));
    }

    #[test]
    fn threshold_is_per_category() {
        // 25ms is slow for a packet but not for a default span.
        let mut span = SpanFactory::unsampled().root("Database.Query", Duration::from_millis(25));
        assert!(!tagger().tag(&mut span));
        assert!(!span.span_context.is_sampled());
        assert!(span.attributes.is_empty());
        assert_eq!(span.status, Status::Unset);
    }

    #[test]
    fn duration_equal_to_threshold_is_not_slow() {
        let span = SpanFactory::unsampled().root("RecvPacket", Duration::from_millis(10));
        assert!(!tagger().is_slow(&span));
    }

    #[test]
    fn sampled_fast_span_gets_duration_only() {
        let mut span = SpanFactory::sampled().root("Database.Query", Duration::from_millis(40));

        assert!(!tagger().tag(&mut span));

        assert_eq!(attribute(&span, DURATION_MS_KEY), Some(&Value::F64(40.0)));
        assert_eq!(attribute(&span, SLOW_OPERATION_KEY), None);
        assert_eq!(span.status, Status::Unset);
    }

    #[test]
    fn existing_duration_is_kept_on_fast_spans() {
        let mut span = SpanFactory::sampled().root("Database.Query", Duration::from_millis(40));
        span.attributes.push(KeyValue::new(DURATION_MS_KEY, 1.5));

        tagger().tag(&mut span);

        assert_eq!(count_attribute(&span, DURATION_MS_KEY), 1);
        assert_eq!(attribute(&span, DURATION_MS_KEY), Some(&Value::F64(1.5)));
    }

    #[test]
    fn tagging_is_idempotent() {
        let tagger = tagger();
        let mut span = SpanFactory::unsampled().root("Packet.Move", Duration::from_millis(12));

        tagger.tag(&mut span);
        let once = span.clone();
        tagger.tag(&mut span);
        tagger.finalize(&mut span);

        assert_eq!(span.attributes, once.attributes);
        assert_eq!(span.status, once.status);
        assert_eq!(span.span_context, once.span_context);
    }

    #[test]
    fn finalize_marks_fast_spans_for_export() {
        let mut span = SpanFactory::unsampled().root("Database.Query", Duration::from_millis(5));

        tagger().finalize(&mut span);

        assert!(span.span_context.is_sampled());
        assert_eq!(attribute(&span, DURATION_MS_KEY), Some(&Value::F64(5.0)));
        assert_eq!(attribute(&span, SLOW_OPERATION_KEY), None);
        assert_eq!(span.status, Status::Unset);
    }

    #[test]
    fn backwards_clock_is_zero_duration() {
        let mut span = SpanFactory::unsampled().root("RecvPacket", Duration::ZERO);
        span.end_time = span.start_time - Duration::from_secs(1);
        assert_eq!(span_duration(&span), Duration::ZERO);
        assert!(!tagger().is_slow(&span));
    }
}
