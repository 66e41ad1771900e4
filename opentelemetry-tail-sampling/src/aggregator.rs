//! # Trace aggregator
//!
//! The aggregator is the tail sampling stage. It sits between the SDK and the
//! downstream span processor (usually a [`BatchSpanProcessor`]) and holds
//! every completed span of a trace until a trace-wide decision can be made:
//!
//! ```ascii
//!   +-----+--------------+   +-------------------+   +-----------------------+
//!   |     |              |   |                   |   |                       |
//!   | SDK | Span.end()   +---> TraceAggregator   +---> (Batch)SpanProcessor  |
//!   |     |              |   |  trace id -> buf  |   |                       |
//!   +-----+--------------+   +---------^---------+   +-----------------------+
//!                                      |
//!                              orphan sweep thread
//! ```
//!
//! A trace is decided exactly once, when its root span (the span with an
//! invalid parent span id) completes, when the orphan sweep finds it idle for
//! longer than the orphan timeout, or when the aggregator shuts down. A trace
//! is flushed if any of its spans was sampled or slow, and discarded
//! otherwise.
//!
//! Buffers live in a sharded concurrent map and each carries its own mutex,
//! so spans of unrelated traces never contend. Removing a buffer from the map
//! while holding its mutex is what makes a path the owner of the decision;
//! whoever fails to remove it has nothing left to do.
//!
//! [`BatchSpanProcessor`]: opentelemetry_sdk::trace::BatchSpanProcessor
use crate::config::TailSamplingConfig;
use crate::tagger::ThresholdTagger;
use dashmap::DashMap;
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::{otel_debug, otel_info, otel_warn, Context};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, Once, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Messages sent to the sweep thread.
#[derive(Debug)]
enum SweepMessage {
    Shutdown,
}

/// Lifecycle of a [`TraceBuffer`]. Only `Open` buffers accept spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferState {
    Open,
    Flushed,
    Discarded,
}

/// What caused a trace to be decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecisionTrigger {
    RootCompleted,
    Orphaned,
    Shutdown,
}

impl DecisionTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            DecisionTrigger::RootCompleted => "root_completed",
            DecisionTrigger::Orphaned => "orphaned",
            DecisionTrigger::Shutdown => "shutdown",
        }
    }
}

/// Completed spans of one trace awaiting a decision.
#[derive(Debug)]
struct TraceBuffer {
    spans: Vec<SpanData>,
    contains_sampled: bool,
    contains_slow: bool,
    last_touched: Instant,
    state: BufferState,
}

impl TraceBuffer {
    fn new() -> Self {
        TraceBuffer {
            spans: Vec::new(),
            contains_sampled: false,
            contains_slow: false,
            last_touched: Instant::now(),
            state: BufferState::Open,
        }
    }

    fn is_open(&self) -> bool {
        self.state == BufferState::Open
    }

    fn push(&mut self, span: SpanData, slow: bool) {
        self.contains_sampled |= span.span_context.is_sampled();
        self.contains_slow |= slow;
        self.last_touched = Instant::now();
        self.spans.push(span);
    }

    fn should_flush(&self) -> bool {
        self.contains_sampled || self.contains_slow
    }
}

type SharedBuffer = Arc<Mutex<TraceBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, TraceBuffer> {
    // Every mutation is a single push or state change, so a poisoned buffer
    // is still consistent.
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Point-in-time counters of a [`TraceAggregator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceAggregatorStats {
    /// Traces whose spans were forwarded downstream.
    pub traces_flushed: u64,
    /// Traces dropped without reaching the downstream processor.
    pub traces_discarded: u64,
    /// Spans forwarded downstream.
    pub spans_exported: u64,
    /// Traces decided by the orphan sweep.
    pub orphans_swept: u64,
    /// Spans that raced with the decision of their trace and were moved to a
    /// fresh buffer for the same trace id.
    pub late_arrivals: u64,
    /// Traces buffered and not yet decided.
    pub pending_traces: usize,
}

impl TraceAggregatorStats {
    /// Total number of trace decisions, flushed or discarded.
    pub fn traces_decided(&self) -> u64 {
        self.traces_flushed + self.traces_discarded
    }
}

#[derive(Debug, Default)]
struct Counters {
    traces_flushed: AtomicU64,
    traces_discarded: AtomicU64,
    spans_exported: AtomicU64,
    orphans_swept: AtomicU64,
    late_arrivals: AtomicU64,
}

/// State shared between the aggregator and its sweep thread.
#[derive(Debug)]
struct AggregatorCore<P> {
    traces: DashMap<TraceId, SharedBuffer>,
    tagger: ThresholdTagger,
    orphan_timeout: Duration,
    downstream: P,
    counters: Counters,
}

impl<P: SpanProcessor> AggregatorCore<P> {
    fn on_span_end(&self, mut span: SpanData) {
        let slow = self.tagger.tag(&mut span);
        let is_root = span.parent_span_id == SpanId::INVALID;
        let trace_id = span.span_context.trace_id();

        loop {
            let buffer = self
                .traces
                .entry(trace_id)
                .or_insert_with(|| Arc::new(Mutex::new(TraceBuffer::new())))
                .value()
                .clone();

            let mut guard = lock(&buffer);
            if !guard.is_open() {
                // Decided and removed after the lookup; the next lookup creates
                // a fresh buffer for this trace id.
                self.counters.late_arrivals.fetch_add(1, Ordering::Relaxed);
                otel_debug!(
                    name: "TailSampling.Aggregator.LateArrival",
                    trace_id = format!("{}", trace_id)
                );
                continue;
            }

            guard.push(span, slow);
            if is_root && self.claim(trace_id, &buffer) {
                self.decide(&mut guard, DecisionTrigger::RootCompleted);
            }
            return;
        }
    }

    /// Removes `buffer` from the directory if it is still the entry for
    /// `trace_id`. Must be called with the buffer locked.
    fn claim(&self, trace_id: TraceId, buffer: &SharedBuffer) -> bool {
        self.traces
            .remove_if(&trace_id, |_, current| Arc::ptr_eq(current, buffer))
            .is_some()
    }

    fn decide(&self, buffer: &mut TraceBuffer, trigger: DecisionTrigger) {
        let spans = std::mem::take(&mut buffer.spans);
        let span_count = spans.len();

        if buffer.should_flush() {
            buffer.state = BufferState::Flushed;
            for mut span in spans {
                self.tagger.finalize(&mut span);
                self.downstream.on_end(span);
            }
            self.counters.traces_flushed.fetch_add(1, Ordering::Relaxed);
            self.counters
                .spans_exported
                .fetch_add(span_count as u64, Ordering::Relaxed);
        } else {
            buffer.state = BufferState::Discarded;
            self.counters
                .traces_discarded
                .fetch_add(1, Ordering::Relaxed);
        }

        otel_debug!(
            name: "TailSampling.Aggregator.TraceDecided",
            trigger = trigger.as_str(),
            flushed = buffer.state == BufferState::Flushed,
            span_count = span_count
        );
    }

    /// Decides every buffer accepted by `expired`. Returns how many traces
    /// this call decided.
    fn drain(&self, trigger: DecisionTrigger, expired: impl Fn(&TraceBuffer) -> bool) -> usize {
        // Snapshot first: no buffer may be locked while a shard guard is held.
        let candidates: Vec<(TraceId, SharedBuffer)> = self
            .traces
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut decided = 0;
        for (trace_id, buffer) in candidates {
            let mut guard = lock(&buffer);
            if !guard.is_open() || !expired(&*guard) {
                continue;
            }
            if self.claim(trace_id, &buffer) {
                self.decide(&mut guard, trigger);
                decided += 1;
            }
        }
        decided
    }

    fn sweep_orphans_at(&self, now: Instant) -> usize {
        let swept = self.drain(DecisionTrigger::Orphaned, |buffer| {
            now.saturating_duration_since(buffer.last_touched) > self.orphan_timeout
        });
        self.counters
            .orphans_swept
            .fetch_add(swept as u64, Ordering::Relaxed);
        otel_debug!(
            name: "TailSampling.Aggregator.SweepCompleted",
            swept = swept,
            pending = self.traces.len()
        );
        swept
    }

    fn stats(&self) -> TraceAggregatorStats {
        TraceAggregatorStats {
            traces_flushed: self.counters.traces_flushed.load(Ordering::Relaxed),
            traces_discarded: self.counters.traces_discarded.load(Ordering::Relaxed),
            spans_exported: self.counters.spans_exported.load(Ordering::Relaxed),
            orphans_swept: self.counters.orphans_swept.load(Ordering::Relaxed),
            late_arrivals: self.counters.late_arrivals.load(Ordering::Relaxed),
            pending_traces: self.traces.len(),
        }
    }
}

/// A [`SpanProcessor`] making keep/discard decisions per trace.
///
/// Every completed span is first passed through the [`ThresholdTagger`], then
/// buffered under its trace id. When the trace root completes the whole
/// buffer is either forwarded to the downstream processor, if any span was
/// sampled or slow, or dropped. Traces whose root never completes locally are
/// decided by a background sweep once they have been idle for the orphan
/// timeout.
///
/// The sweep thread is started by the first completed span, which leaves
/// [`SpanProcessor::set_resource`] free to reach the downstream processor
/// while the tracer provider is being built.
///
/// # Example
///
/// ```no_run
/// use opentelemetry_sdk::trace::{BatchSpanProcessor, InMemorySpanExporter, SdkTracerProvider};
/// use opentelemetry_tail_sampling::{CategorySampler, TailSamplingConfig, TraceAggregator};
///
/// let config = TailSamplingConfig::default();
/// let downstream = BatchSpanProcessor::builder(InMemorySpanExporter::default()).build();
/// let provider = SdkTracerProvider::builder()
///     .with_sampler(CategorySampler::new(&config))
///     .with_span_processor(TraceAggregator::builder(downstream).with_config(config).build())
///     .build();
/// # drop(provider);
/// ```
#[derive(Debug)]
pub struct TraceAggregator<P: SpanProcessor + 'static> {
    core: Arc<AggregatorCore<P>>,
    sweep_interval: Duration,
    sweep_started: Once,
    sweeper: Mutex<Option<SweepWorker>>,
    // Held for reading across every `on_end`, for writing to flip it at
    // shutdown. No span can be buffered once the shutdown drain has started.
    is_shutdown: RwLock<bool>,
}

/// Handle on the orphan sweep thread.
#[derive(Debug)]
struct SweepWorker {
    message_sender: SyncSender<SweepMessage>,
    handle: thread::JoinHandle<()>,
}

impl<P: SpanProcessor + 'static> TraceAggregator<P> {
    /// Creates a new aggregator forwarding kept spans to `downstream`.
    pub fn new(downstream: P, config: TailSamplingConfig) -> Self {
        TraceAggregator {
            core: Arc::new(AggregatorCore {
                traces: DashMap::new(),
                tagger: ThresholdTagger::new(&config),
                orphan_timeout: config.orphan_timeout,
                downstream,
                counters: Counters::default(),
            }),
            sweep_interval: config.sweep_interval,
            sweep_started: Once::new(),
            sweeper: Mutex::new(None),
            is_shutdown: RwLock::new(false),
        }
    }

    /// Returns a builder for a [`TraceAggregator`] in front of `downstream`.
    pub fn builder(downstream: P) -> TraceAggregatorBuilder<P> {
        TraceAggregatorBuilder {
            downstream,
            config: None,
        }
    }

    /// Number of traces buffered and not yet decided.
    pub fn pending_traces(&self) -> usize {
        self.core.traces.len()
    }

    /// Snapshot of the decision counters.
    pub fn stats(&self) -> TraceAggregatorStats {
        self.core.stats()
    }

    /// Runs one orphan sweep on the calling thread. Returns the number of
    /// traces it decided.
    pub fn sweep_orphans(&self) -> usize {
        self.core.sweep_orphans_at(Instant::now())
    }

    /// Must be called with the shutdown gate held for reading, so that a
    /// worker started here is always seen by `stop_sweep_thread`.
    fn start_sweep_thread(&self) {
        let mut sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sweeper.is_some() {
            return;
        }

        let (message_sender, message_receiver) = sync_channel::<SweepMessage>(1);
        let sweep_interval = self.sweep_interval;
        let core = Arc::clone(&self.core);
        let spawned = thread::Builder::new()
            .name("TailSamplingSweepThread".to_string())
            .spawn(move || {
                let mut last_sweep = Instant::now();
                loop {
                    let timeout = sweep_interval.saturating_sub(last_sweep.elapsed());
                    match message_receiver.recv_timeout(timeout) {
                        Ok(SweepMessage::Shutdown) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            core.sweep_orphans_at(Instant::now());
                            last_sweep = Instant::now();
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                *sweeper = Some(SweepWorker {
                    message_sender,
                    handle,
                });
            }
            Err(err) => {
                // Traces are still decided by their roots and at shutdown.
                otel_warn!(
                    name: "TailSampling.Aggregator.SweepThreadSpawnFailed",
                    reason = format!("{}", err)
                );
            }
        }
    }

    fn stop_sweep_thread(&self) {
        let worker = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            // A sweep in progress completes before the message is seen.
            let _ = worker.message_sender.send(SweepMessage::Shutdown);
            if worker.handle.join().is_err() {
                otel_debug!(name: "TailSampling.Aggregator.SweepThreadPanicked");
            }
        }
    }
}

impl<P: SpanProcessor + 'static> SpanProcessor for TraceAggregator<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.core.downstream.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        let is_shutdown = self
            .is_shutdown
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *is_shutdown {
            otel_debug!(
                name: "TailSampling.Aggregator.SpanDroppedAfterShutdown",
                span_name = format!("{}", span.name)
            );
            return;
        }
        self.sweep_started.call_once(|| self.start_sweep_thread());
        self.core.on_span_end(span);
    }

    /// Forces the downstream processor to flush. Undecided traces stay
    /// buffered.
    fn force_flush(&self) -> OTelSdkResult {
        self.core.downstream.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        {
            // Waits for spans already inside `on_end` to be buffered.
            let mut is_shutdown = self
                .is_shutdown
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *is_shutdown {
                return Err(OTelSdkError::AlreadyShutdown);
            }
            *is_shutdown = true;
        }

        self.stop_sweep_thread();
        let drained = self.core.drain(DecisionTrigger::Shutdown, |_| true);
        otel_info!(
            name: "TailSampling.Aggregator.ShutdownDrained",
            traces_decided = drained
        );

        self.core.downstream.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        match Arc::get_mut(&mut self.core) {
            Some(core) => core.downstream.set_resource(resource),
            None => {
                otel_debug!(
                    name: "TailSampling.Aggregator.SetResourceIgnored",
                    reason = "sweep thread already running"
                );
            }
        }
    }
}

/// Builder for [`TraceAggregator`].
#[derive(Debug)]
pub struct TraceAggregatorBuilder<P> {
    downstream: P,
    config: Option<TailSamplingConfig>,
}

impl<P: SpanProcessor + 'static> TraceAggregatorBuilder<P> {
    /// Set the [`TailSamplingConfig`]. Defaults to [`TailSamplingConfig::default`].
    pub fn with_config(self, config: TailSamplingConfig) -> Self {
        TraceAggregatorBuilder {
            config: Some(config),
            ..self
        }
    }

    /// Build a new [`TraceAggregator`].
    pub fn build(self) -> TraceAggregator<P> {
        TraceAggregator::new(self.downstream, self.config.unwrap_or_default())
    }
}
