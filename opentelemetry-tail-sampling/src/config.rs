//! Tail sampling configuration
//!
//! All knobs are plain numbers: one sampling ratio and one slow-operation
//! threshold per [`SpanCategory`], the orphan timeout after which a trace
//! whose root never completed is decided anyway, and the period of the sweep
//! that enforces it. Defaults are overridden by environment variables when
//! set; values given to the builder afterwards take precedence.
use crate::category::{PerCategory, SpanCategory};
use crate::error::ConfigError;
use opentelemetry::otel_warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Per-category sampling ratios, e.g. `default=0.5,update=0.01`.
pub(crate) const OTEL_TAIL_SAMPLING_RATIOS: &str = "OTEL_TAIL_SAMPLING_RATIOS";
/// Per-category slow thresholds in milliseconds, e.g. `packet=5,update=40`.
pub(crate) const OTEL_TAIL_SAMPLING_SLOW_THRESHOLDS: &str = "OTEL_TAIL_SAMPLING_SLOW_THRESHOLDS";
/// Orphan timeout in milliseconds.
pub(crate) const OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT: &str = "OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT";
/// Default orphan timeout: five minutes.
pub(crate) const OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT_DEFAULT: u64 = 300_000;
/// Orphan sweep period in milliseconds.
pub(crate) const OTEL_TAIL_SAMPLING_SWEEP_INTERVAL: &str = "OTEL_TAIL_SAMPLING_SWEEP_INTERVAL";

pub(crate) const DEFAULT_SAMPLING_RATIOS: PerCategory<f64> = PerCategory::new(1.0, 0.01, 0.01, 0.1);

pub(crate) const DEFAULT_SLOW_THRESHOLDS: PerCategory<Duration> = PerCategory::new(
    Duration::from_millis(100),
    Duration::from_millis(50),
    Duration::from_millis(10),
    Duration::from_millis(20),
);

/// Tail sampling configuration.
/// Use [`TailSamplingConfigBuilder`] to configure your own instance.
#[derive(Clone, Debug)]
pub struct TailSamplingConfig {
    pub(crate) sampling_ratios: PerCategory<f64>,
    pub(crate) slow_thresholds: PerCategory<Duration>,
    pub(crate) orphan_timeout: Duration,
    pub(crate) sweep_interval: Duration,
}

impl Default for TailSamplingConfig {
    fn default() -> Self {
        TailSamplingConfigBuilder::default().build()
    }
}

impl TailSamplingConfig {
    /// Returns a builder initialized with defaults and environment overrides.
    pub fn builder() -> TailSamplingConfigBuilder {
        TailSamplingConfigBuilder::default()
    }

    /// Head sampling ratio for `category`, always within `[0, 1]`.
    pub fn sampling_ratio(&self, category: SpanCategory) -> f64 {
        *self.sampling_ratios.get(category)
    }

    /// Duration above which a span of `category` is a slow operation.
    pub fn slow_threshold(&self, category: SpanCategory) -> Duration {
        *self.slow_thresholds.get(category)
    }

    /// Idle time after which an undecided trace is swept.
    pub fn orphan_timeout(&self) -> Duration {
        self.orphan_timeout
    }

    /// Period of the orphan sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// A builder for creating [`TailSamplingConfig`] instances.
#[derive(Clone, Debug)]
pub struct TailSamplingConfigBuilder {
    sampling_ratios: PerCategory<f64>,
    slow_thresholds: PerCategory<Duration>,
    orphan_timeout: Duration,
    sweep_interval: Option<Duration>,
}

impl Default for TailSamplingConfigBuilder {
    /// Create a new [`TailSamplingConfigBuilder`] initialized with default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `OTEL_TAIL_SAMPLING_RATIOS`
    /// * `OTEL_TAIL_SAMPLING_SLOW_THRESHOLDS`
    /// * `OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT`
    /// * `OTEL_TAIL_SAMPLING_SWEEP_INTERVAL`
    fn default() -> Self {
        TailSamplingConfigBuilder::defaults().init_from_env_vars()
    }
}

impl TailSamplingConfigBuilder {
    /// Built-in defaults, without environment overrides.
    pub(crate) fn defaults() -> Self {
        TailSamplingConfigBuilder {
            sampling_ratios: DEFAULT_SAMPLING_RATIOS,
            slow_thresholds: DEFAULT_SLOW_THRESHOLDS,
            orphan_timeout: Duration::from_millis(OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT_DEFAULT),
            sweep_interval: None,
        }
    }

    /// Set the head sampling ratio for `category`.
    /// Values outside `[0, 1]` are clamped; `NaN` is treated as `0`.
    pub fn with_sampling_ratio(mut self, category: SpanCategory, ratio: f64) -> Self {
        self.sampling_ratios.set(category, ratio);
        self
    }

    /// Set the slow-operation threshold for `category`.
    /// A span is slow when its duration is strictly greater than the threshold.
    pub fn with_slow_threshold(mut self, category: SpanCategory, threshold: Duration) -> Self {
        self.slow_thresholds.set(category, threshold);
        self
    }

    /// Set the orphan timeout. The default value is 5 minutes.
    pub fn with_orphan_timeout(mut self, orphan_timeout: Duration) -> Self {
        self.orphan_timeout = orphan_timeout;
        self
    }

    /// Set the sweep interval. Defaults to the orphan timeout.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = Some(sweep_interval);
        self
    }

    /// Builds a `TailSamplingConfig` enforcing the following invariants:
    /// * every sampling ratio is within `[0, 1]`;
    /// * the orphan timeout is non-zero;
    /// * the sweep interval is non-zero.
    pub fn build(self) -> TailSamplingConfig {
        let orphan_timeout = if self.orphan_timeout.is_zero() {
            Duration::from_millis(OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT_DEFAULT)
        } else {
            self.orphan_timeout
        };
        let sweep_interval = self
            .sweep_interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(orphan_timeout);

        TailSamplingConfig {
            sampling_ratios: self.sampling_ratios.map(clamp_ratio),
            slow_thresholds: self.slow_thresholds,
            orphan_timeout,
            sweep_interval,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(ratios) = env::var(OTEL_TAIL_SAMPLING_RATIOS) {
            for entry in parse_category_values::<f64>(&ratios) {
                match entry {
                    Ok((category, ratio)) => self.sampling_ratios.set(category, ratio),
                    Err(err) => warn_invalid_entry(OTEL_TAIL_SAMPLING_RATIOS, &err),
                }
            }
        }

        if let Ok(thresholds) = env::var(OTEL_TAIL_SAMPLING_SLOW_THRESHOLDS) {
            for entry in parse_category_values::<u64>(&thresholds) {
                match entry {
                    Ok((category, millis)) => self
                        .slow_thresholds
                        .set(category, Duration::from_millis(millis)),
                    Err(err) => warn_invalid_entry(OTEL_TAIL_SAMPLING_SLOW_THRESHOLDS, &err),
                }
            }
        }

        if let Some(orphan_timeout) = env::var(OTEL_TAIL_SAMPLING_ORPHAN_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(timeout.trim()).ok())
        {
            self.orphan_timeout = Duration::from_millis(orphan_timeout);
        }

        if let Some(sweep_interval) = env::var(OTEL_TAIL_SAMPLING_SWEEP_INTERVAL)
            .ok()
            .and_then(|interval| u64::from_str(interval.trim()).ok())
        {
            self.sweep_interval = Some(Duration::from_millis(sweep_interval));
        }

        self
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

fn warn_invalid_entry(variable: &'static str, err: &ConfigError) {
    otel_warn!(
        name: "TailSampling.Config.InvalidEntry",
        message = "Ignoring invalid tail sampling configuration entry; the default value stays in effect.",
        variable = variable,
        reason = err.to_string()
    );
}

/// Parses a comma separated `category=value` list. Empty entries are ignored.
pub(crate) fn parse_category_values<T: FromStr>(
    raw: &str,
) -> impl Iterator<Item = Result<(SpanCategory, T), ConfigError>> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<(SpanCategory, T), ConfigError> {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedEntry(entry.to_string()))?;
            let category = SpanCategory::from_str(key)?;
            let value = value.trim();
            let parsed = T::from_str(value).map_err(|_| ConfigError::InvalidValue {
                key: category.as_str().to_string(),
                value: value.to_string(),
            })?;
            Ok((category, parsed))
        })
}
