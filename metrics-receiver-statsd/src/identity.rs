use std::{fmt, str::FromStr};

use metrics::{Key, Label};

/// StatsD metric type, as carried on the wire after the first `|`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricType {
    /// `c`
    Counter,
    /// `g`
    Gauge,
    /// `h`
    Histogram,
    /// `ms`
    Timing,
    /// `d`
    Distribution,
}

impl MetricType {
    /// Returns the short wire code for this type, such as `c` or `ms`.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Histogram => "h",
            MetricType::Timing => "ms",
            MetricType::Distribution => "d",
        }
    }

    /// Returns the human-readable name of this type, such as `counter` or `timing`.
    pub const fn full_name(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Timing => "timing",
            MetricType::Distribution => "distribution",
        }
    }

    /// Returns `true` if the type accepts an explicit `T<seconds>` timestamp.
    pub const fn supports_timestamp(self) -> bool {
        matches!(self, MetricType::Counter | MetricType::Gauge)
    }

    /// Returns the unit implied by the type, if any.
    pub(crate) const fn unit(self) -> &'static str {
        match self {
            MetricType::Timing => "ms",
            _ => "",
        }
    }
}

impl FromStr for MetricType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(MetricType::Counter),
            "g" => Ok(MetricType::Gauge),
            "h" => Ok(MetricType::Histogram),
            "ms" => Ok(MetricType::Timing),
            "d" => Ok(MetricType::Distribution),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name())
    }
}

/// Identity of an aggregated series: name, metric type, and attribute set.
///
/// The attribute set is unordered on the wire, so labels are normalized at construction: they are
/// sorted by key, and when a key is repeated the last value wins. Two identities built from the
/// same tags in a different order are therefore equal and hash identically, and an identity with
/// no tags is equal to any other identity with no tags.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricIdentity {
    key: Key,
    metric_type: MetricType,
}

impl MetricIdentity {
    /// Creates a new `MetricIdentity`.
    pub fn new<N>(name: N, metric_type: MetricType, mut labels: Vec<Label>) -> Self
    where
        N: Into<String>,
    {
        // Reversing before the stable sort puts the last occurrence of a key first, so that
        // `dedup_by` keeps it.
        labels.reverse();
        labels.sort_by(|a, b| a.key().cmp(b.key()));
        labels.dedup_by(|a, b| a.key() == b.key());

        Self { key: Key::from_parts(name.into(), labels), metric_type }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        self.key.name()
    }

    /// Returns the metric type.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Returns the normalized attribute set.
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.key.labels()
    }

    /// Returns the underlying key (name and normalized labels).
    pub fn key(&self) -> &Key {
        &self.key
    }
}
