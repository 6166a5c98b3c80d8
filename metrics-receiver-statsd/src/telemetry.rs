use metrics::{counter, Counter};

use crate::identity::MetricType;

/// Receiver telemetry.
///
/// `Telemetry` describes the receiver's own behavior through the [`metrics`] facade: how many lines were received and
/// rejected, how many points were aggregated per type, and how many batches were flushed. When no global recorder is
/// installed, these are no-ops.
pub(crate) struct Telemetry {
    lines_received: Counter,
    lines_rejected: Counter,
    counter_points: Counter,
    gauge_points: Counter,
    timing_points: Counter,
    histogram_points: Counter,
    distribution_points: Counter,
    batches_flushed: Counter,
    batches_rejected: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new() -> Self {
        let base_labels = telemetry_tags!();
        let counter_labels = telemetry_tags!("metric_type" => "counter");
        let gauge_labels = telemetry_tags!("metric_type" => "gauge");
        let timing_labels = telemetry_tags!("metric_type" => "timing");
        let histogram_labels = telemetry_tags!("metric_type" => "histogram");
        let distribution_labels = telemetry_tags!("metric_type" => "distribution");

        Self {
            lines_received: counter!("statsd.receiver.lines_received", base_labels.iter()),
            lines_rejected: counter!("statsd.receiver.lines_rejected", base_labels.iter()),
            counter_points: counter!("statsd.receiver.points_by_type", counter_labels.iter()),
            gauge_points: counter!("statsd.receiver.points_by_type", gauge_labels.iter()),
            timing_points: counter!("statsd.receiver.points_by_type", timing_labels.iter()),
            histogram_points: counter!("statsd.receiver.points_by_type", histogram_labels.iter()),
            distribution_points: counter!(
                "statsd.receiver.points_by_type",
                distribution_labels.iter()
            ),
            batches_flushed: counter!("statsd.receiver.batches_flushed", base_labels.iter()),
            batches_rejected: counter!("statsd.receiver.batches_rejected", base_labels.iter()),
        }
    }

    /// Records a line that was aggregated, holding `points` values of the given type.
    pub fn line_accepted(&self, metric_type: MetricType, points: usize) {
        self.lines_received.increment(1);

        let counter = match metric_type {
            MetricType::Counter => &self.counter_points,
            MetricType::Gauge => &self.gauge_points,
            MetricType::Timing => &self.timing_points,
            MetricType::Histogram => &self.histogram_points,
            MetricType::Distribution => &self.distribution_points,
        };
        counter.increment(points as u64);
    }

    /// Records a line that failed to parse.
    pub fn line_rejected(&self) {
        self.lines_received.increment(1);
        self.lines_rejected.increment(1);
    }

    /// Records batches produced by a flush.
    pub fn batches_flushed(&self, batches: usize) {
        self.batches_flushed.increment(batches as u64);
    }

    /// Records a batch the downstream consumer failed to accept.
    pub fn batch_rejected(&self) {
        self.batches_rejected.increment(1);
    }
}

/// Records a connection accepted by a stream listener.
pub(crate) fn connection_accepted() {
    counter!("statsd.receiver.connections_accepted", telemetry_tags!().iter()).increment(1);
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("receiver", "statsd"),
            ::metrics::Label::from_static_parts("receiver_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;
