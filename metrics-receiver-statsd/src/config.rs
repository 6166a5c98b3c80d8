//! Aggregation settings, and the mappings that decide how timing and histogram samples are
//! aggregated.
use std::{fmt, str::FromStr};

use crate::{
    builder::BuildError,
    histogram::{DEFAULT_MAX_SIZE, MAXIMUM_MAX_SIZE, MIN_MAX_SIZE},
    identity::MetricType,
    summary::DEFAULT_PERCENTILES,
};

/// Strategy for turning timing, histogram, and distribution samples into series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObserverType {
    /// Every sample becomes its own gauge series.
    #[default]
    Gauge,

    /// Samples are collected into a weighted summary with configurable percentiles.
    Summary,

    /// Samples are folded into a base-2 exponential histogram.
    Histogram,

    /// Samples are dropped.
    Disabled,
}

impl ObserverType {
    /// Returns the configuration name of the observer.
    pub const fn as_str(self) -> &'static str {
        match self {
            ObserverType::Gauge => "gauge",
            ObserverType::Summary => "summary",
            ObserverType::Histogram => "histogram",
            ObserverType::Disabled => "disabled",
        }
    }
}

impl FromStr for ObserverType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(ObserverType::Gauge),
            "summary" => Ok(ObserverType::Summary),
            "histogram" => Ok(ObserverType::Histogram),
            "disabled" => Ok(ObserverType::Disabled),
            _ => Err(BuildError::UnknownObserverType(s.to_string())),
        }
    }
}

impl fmt::Display for ObserverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sample types whose aggregation can be configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsdType {
    /// Timings (`ms`). Configured as `timing` or `timer`.
    Timing,

    /// Histograms (`h`).
    Histogram,

    /// Distributions (`d`).
    Distribution,
}

impl FromStr for StatsdType {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timing" | "timer" => Ok(StatsdType::Timing),
            "histogram" => Ok(StatsdType::Histogram),
            "distribution" => Ok(StatsdType::Distribution),
            "counter" | "gauge" => Err(BuildError::UnsupportedMapping(s.to_string())),
            _ => Err(BuildError::UnknownStatsdType(s.to_string())),
        }
    }
}

/// Maps a statsd type onto an observer.
///
/// Histograms and distributions share an observer, so the last mapping given for either of them
/// applies to both.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerHistogramMapping {
    /// Statsd type the mapping applies to.
    pub statsd_type: StatsdType,

    /// Observer used for the statsd type.
    pub observer_type: ObserverType,

    /// Maximum number of buckets per range for the histogram observer, or zero for the default.
    pub histogram_max_size: u32,

    /// Percentiles reported by the summary observer, or empty for the default set.
    pub percentiles: Vec<f64>,
}

impl TimerHistogramMapping {
    /// Creates a new `TimerHistogramMapping` with default observer settings.
    pub fn new(statsd_type: StatsdType, observer_type: ObserverType) -> Self {
        Self { statsd_type, observer_type, histogram_max_size: 0, percentiles: Vec::new() }
    }

    /// Sets the maximum number of buckets per range for the histogram observer.
    #[must_use]
    pub fn with_histogram_max_size(mut self, max_size: u32) -> Self {
        self.histogram_max_size = max_size;
        self
    }

    /// Sets the percentiles reported by the summary observer.
    #[must_use]
    pub fn with_percentiles<I>(mut self, percentiles: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        self.percentiles = percentiles.into_iter().collect();
        self
    }

    /// Checks that the observer settings are consistent with the observer type.
    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.histogram_max_size != 0 {
            if self.observer_type != ObserverType::Histogram {
                return Err(BuildError::HistogramConfigRequiresHistogramObserver(self.observer_type));
            }
            if !(MIN_MAX_SIZE..=MAXIMUM_MAX_SIZE).contains(&self.histogram_max_size) {
                return Err(BuildError::InvalidHistogramMaxSize(self.histogram_max_size));
            }
        }

        if !self.percentiles.is_empty() {
            if self.observer_type != ObserverType::Summary {
                return Err(BuildError::SummaryConfigRequiresSummaryObserver(self.observer_type));
            }
            if let Some(p) = self.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
                return Err(BuildError::InvalidPercentile(*p));
            }
        }

        Ok(())
    }
}

/// Resolved observer settings for a group of statsd types.
#[derive(Clone, Debug, PartialEq)]
pub struct ObserverCategory {
    /// Observer used for the group.
    pub observer_type: ObserverType,

    /// Maximum number of buckets per range for the histogram observer.
    pub histogram_max_size: u32,

    /// Percentiles reported by the summary observer.
    pub percentiles: Vec<f64>,
}

impl ObserverCategory {
    fn from_mapping(mapping: &TimerHistogramMapping) -> Self {
        let histogram_max_size = if mapping.histogram_max_size >= MIN_MAX_SIZE {
            mapping.histogram_max_size
        } else {
            DEFAULT_MAX_SIZE
        };
        let percentiles = if mapping.percentiles.is_empty() {
            DEFAULT_PERCENTILES.to_vec()
        } else {
            mapping.percentiles.clone()
        };

        Self { observer_type: mapping.observer_type, histogram_max_size, percentiles }
    }
}

impl Default for ObserverCategory {
    fn default() -> Self {
        Self {
            observer_type: ObserverType::Gauge,
            histogram_max_size: DEFAULT_MAX_SIZE,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }
}

/// Aggregator settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatorConfig {
    /// Whether to add a `metric_type` label holding the type name to every series.
    pub enable_metric_type: bool,

    /// Whether to accept tags without a value.
    pub enable_simple_tags: bool,

    /// Whether counters are reported as monotonic sums.
    pub monotonic_counters: bool,

    /// Whether to aggregate by source IP only, merging traffic from all ports of a host.
    pub ip_only_aggregation: bool,

    /// Observer settings for timings.
    pub timer: ObserverCategory,

    /// Observer settings for histograms and distributions.
    pub histogram: ObserverCategory,
}

impl AggregatorConfig {
    /// Applies the given mappings, in order, on top of the default gauge observers.
    ///
    /// # Errors
    ///
    /// If a mapping has observer settings that do not match its observer type, or that are out of
    /// range, an error is returned.
    pub fn with_mappings<'a, I>(mut self, mappings: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = &'a TimerHistogramMapping>,
    {
        for mapping in mappings {
            mapping.validate()?;

            let category = ObserverCategory::from_mapping(mapping);
            match mapping.statsd_type {
                StatsdType::Timing => self.timer = category,
                StatsdType::Histogram | StatsdType::Distribution => self.histogram = category,
            }
        }

        Ok(self)
    }

    /// Returns the observer settings that apply to the given metric type, if any.
    pub(crate) fn observer_for(&self, metric_type: MetricType) -> Option<&ObserverCategory> {
        match metric_type {
            MetricType::Timing => Some(&self.timer),
            MetricType::Histogram | MetricType::Distribution => Some(&self.histogram),
            MetricType::Counter | MetricType::Gauge => None,
        }
    }
}
