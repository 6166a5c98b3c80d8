use std::net::SocketAddr;

use indexmap::IndexMap;
use tracing::trace;

use crate::{
    clock::{Clock, SystemClock},
    config::{AggregatorConfig, ObserverType},
    data::{GaugePoint, Interval, Metric, MetricBatch, MetricData, Scope, SourceAddr, SumPoint},
    histogram::ExponentialHistogram,
    identity::{MetricIdentity, MetricType},
    parser::{parse_line, ParseError, RawSample},
    summary::WeightedSummary,
    telemetry::Telemetry,
};

#[derive(Clone, Copy, Debug)]
struct CounterState {
    value: i64,
    timestamp: Option<u64>,
}

/// Per-source aggregation state for the current interval.
#[derive(Default)]
struct SourceBucket {
    gauges: IndexMap<MetricIdentity, GaugePoint>,
    counters: IndexMap<MetricIdentity, CounterState>,
    observations: Vec<(MetricIdentity, GaugePoint)>,
    summaries: IndexMap<MetricIdentity, WeightedSummary>,
    histograms: IndexMap<MetricIdentity, ExponentialHistogram>,
}

impl SourceBucket {
    fn into_metrics(self, config: &AggregatorConfig, interval: Interval) -> Vec<Metric> {
        let SourceBucket { gauges, counters, observations, summaries, histograms } = self;

        let mut metrics = Vec::with_capacity(
            gauges.len() + observations.len() + counters.len() + summaries.len() + histograms.len(),
        );

        for (identity, point) in gauges.into_iter().chain(observations) {
            metrics.push(series(&identity, MetricData::Gauge(point)));
        }

        for (identity, counter) in counters {
            let point = SumPoint {
                value: counter.value,
                start_timestamp: interval.start,
                timestamp: counter.timestamp.unwrap_or(interval.end),
                is_monotonic: config.monotonic_counters,
            };
            metrics.push(series(&identity, MetricData::Sum(point)));
        }

        for (identity, summary) in summaries {
            let percentiles = config
                .observer_for(identity.metric_type())
                .map_or(&[][..], |category| category.percentiles.as_slice());
            let point = summary.to_point(percentiles, interval.start, interval.end);
            metrics.push(series(&identity, MetricData::Summary(point)));
        }

        for (identity, histogram) in histograms {
            let point = histogram.to_point(interval.start, interval.end);
            metrics.push(series(&identity, MetricData::ExponentialHistogram(point)));
        }

        metrics
    }
}

fn series(identity: &MetricIdentity, data: MetricData) -> Metric {
    Metric { key: identity.key().clone(), unit: identity.metric_type().unit(), data }
}

/// Aggregates decoded lines into per-source series.
///
/// The aggregator is not synchronized: a single task owns it, and both ingestion and flushing go
/// through that task.
pub struct Aggregator<C = SystemClock> {
    config: AggregatorConfig,
    clock: C,
    interval_start: u64,
    sources: IndexMap<SourceAddr, SourceBucket>,
    telemetry: Telemetry,
}

impl Aggregator<SystemClock> {
    /// Creates a new `Aggregator` using the system clock.
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C> Aggregator<C>
where
    C: Clock,
{
    /// Creates a new `Aggregator` using the given clock.
    ///
    /// The first interval starts now.
    pub fn with_clock(config: AggregatorConfig, clock: C) -> Self {
        let interval_start = clock.now();

        Self {
            config,
            clock,
            interval_start,
            sources: IndexMap::new(),
            telemetry: Telemetry::new(),
        }
    }

    /// Returns the aggregator configuration.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the start of the current interval, in unix nanoseconds.
    pub fn interval_start(&self) -> u64 {
        self.interval_start
    }

    /// Returns `true` if nothing has been aggregated since the last flush.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Parses `line` and aggregates its values under the source `addr`.
    ///
    /// # Errors
    ///
    /// If the line is malformed, an error is returned and nothing is aggregated.
    pub fn ingest(&mut self, line: &str, addr: SocketAddr) -> Result<(), ParseError> {
        let config = &self.config;
        let parsed = match parse_line(line, config.enable_metric_type, config.enable_simple_tags) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.telemetry.line_rejected();
                return Err(e);
            }
        };

        let source = if self.config.ip_only_aggregation {
            SourceAddr::Ip(addr.ip())
        } else {
            SourceAddr::Socket(addr)
        };

        let now = self.clock.now();
        let bucket = self.sources.entry(source).or_insert_with(|| {
            trace!(%source, "Tracking new source.");
            SourceBucket::default()
        });

        for sample in parsed.samples() {
            aggregate(&self.config, bucket, &sample, now);
        }

        self.telemetry.line_accepted(parsed.identity().metric_type(), parsed.len());

        Ok(())
    }

    /// Materializes every series aggregated since the last flush, one batch per source, and starts
    /// a new interval.
    pub fn flush(&mut self) -> Vec<MetricBatch> {
        let now = self.clock.now();
        let interval = Interval { start: self.interval_start, end: now };

        let sources = std::mem::take(&mut self.sources);
        let batches = sources
            .into_iter()
            .map(|(addr, bucket)| MetricBatch {
                addr,
                scope: Scope::RECEIVER,
                metrics: bucket.into_metrics(&self.config, interval),
            })
            .collect::<Vec<_>>();

        self.interval_start = now;
        self.telemetry.batches_flushed(batches.len());

        batches
    }
}

fn aggregate(
    config: &AggregatorConfig,
    bucket: &mut SourceBucket,
    sample: &RawSample<'_>,
    now: u64,
) {
    let identity = sample.identity;

    match identity.metric_type() {
        MetricType::Gauge => {
            let timestamp = sample.timestamp.unwrap_or(now);
            match bucket.gauges.get_mut(identity) {
                Some(point) if sample.is_delta => point.value += sample.value,
                Some(point) => *point = GaugePoint { value: sample.value, timestamp },
                None => {
                    let point = GaugePoint { value: sample.value, timestamp };
                    bucket.gauges.insert(identity.clone(), point);
                }
            }
        }
        MetricType::Counter => {
            let value = sample.counter_value();
            match bucket.counters.get_mut(identity) {
                Some(counter) => {
                    counter.value = counter.value.saturating_add(value);
                    if sample.timestamp.is_some() {
                        counter.timestamp = sample.timestamp;
                    }
                }
                None => {
                    bucket.counters.insert(
                        identity.clone(),
                        CounterState { value, timestamp: sample.timestamp },
                    );
                }
            }
        }
        MetricType::Timing | MetricType::Histogram | MetricType::Distribution => {
            let Some(category) = config.observer_for(identity.metric_type()) else {
                return;
            };

            match category.observer_type {
                ObserverType::Gauge => {
                    let point = GaugePoint { value: sample.value, timestamp: now };
                    bucket.observations.push((identity.clone(), point));
                }
                ObserverType::Summary => {
                    bucket
                        .summaries
                        .entry(identity.clone())
                        .or_default()
                        .add(sample.value, sample.weight());
                }
                ObserverType::Histogram => {
                    // Only whole repeat counts are recorded, so a rate that rounds to zero drops the value.
                    let increment = sample.weight().round() as u64;
                    bucket
                        .histograms
                        .entry(identity.clone())
                        .or_insert_with(|| ExponentialHistogram::new(category.histogram_max_size))
                        .update(sample.value, increment);
                }
                ObserverType::Disabled => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use approx::assert_relative_eq;
    use metrics::{Key, Label};
    use proptest::prelude::*;

    use super::Aggregator;
    use crate::{
        clock::MockClock,
        config::{AggregatorConfig, ObserverType, StatsdType, TimerHistogramMapping},
        data::{Metric, MetricBatch, MetricData, Scope, SourceAddr},
        parser::ParseError,
    };

    const START: u64 = 1_000_000_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    fn new_aggregator(config: AggregatorConfig) -> (Aggregator<MockClock>, MockClock) {
        let clock = MockClock::new(START);
        (Aggregator::with_clock(config, clock.clone()), clock)
    }

    fn mapped(mapping: TimerHistogramMapping) -> AggregatorConfig {
        AggregatorConfig::default().with_mappings([&mapping]).expect("mapping should be valid")
    }

    fn ingest_all(aggregator: &mut Aggregator<MockClock>, lines: &[&str], from: SocketAddr) {
        for line in lines {
            aggregator
                .ingest(line, from)
                .unwrap_or_else(|e| panic!("failed to ingest {line:?}: {e}"));
        }
    }

    fn single_batch(mut batches: Vec<MetricBatch>) -> MetricBatch {
        assert_eq!(batches.len(), 1, "expected a single batch");
        batches.remove(0)
    }

    fn find<'a>(batch: &'a MetricBatch, name: &str) -> Vec<&'a Metric> {
        batch.metrics.iter().filter(|m| m.key.name() == name).collect()
    }

    fn gauge_value(metric: &Metric) -> f64 {
        match &metric.data {
            MetricData::Gauge(point) => point.value,
            other => panic!("expected gauge, got {other:?}"),
        }
    }

    #[test]
    fn counters_accumulate() {
        let (mut aggregator, clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["foo:1|c", "foo:2|c", "foo:3|c|@0.5"], addr(5000));

        clock.increment(Duration::from_secs(10));
        let batch = single_batch(aggregator.flush());
        assert_eq!(batch.addr, SourceAddr::Socket(addr(5000)));
        assert_eq!(batch.scope, Scope::RECEIVER);

        let metrics = find(&batch, "foo");
        assert_eq!(metrics.len(), 1);
        match &metrics[0].data {
            MetricData::Sum(point) => {
                assert_eq!(point.value, 6);
                assert_eq!(point.start_timestamp, START);
                assert_eq!(point.timestamp, START + 10_000_000_000);
                assert!(!point.is_monotonic);
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn counter_explicit_timestamp_and_monotonic_flag() {
        let config = AggregatorConfig { monotonic_counters: true, ..Default::default() };
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["foo:1|c|T1656581400", "foo:2|c"], addr(5000));

        let batch = single_batch(aggregator.flush());
        match &find(&batch, "foo")[0].data {
            MetricData::Sum(point) => {
                assert_eq!(point.value, 3);
                assert_eq!(point.timestamp, 1_656_581_400_000_000_000);
                assert!(point.is_monotonic);
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn gauge_delta_and_replace() {
        let (mut aggregator, clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["added:5|g", "replaced:5|g"], addr(5000));

        clock.increment(Duration::from_secs(1));
        ingest_all(&mut aggregator, &["added:+3|g", "replaced:3|g", "dropped:-2|g"], addr(5000));

        let batch = single_batch(aggregator.flush());

        let added = find(&batch, "added");
        assert_relative_eq!(gauge_value(added[0]), 8.0);
        match &added[0].data {
            MetricData::Gauge(point) => assert_eq!(point.timestamp, START),
            other => panic!("expected gauge, got {other:?}"),
        }

        let replaced = find(&batch, "replaced");
        assert_relative_eq!(gauge_value(replaced[0]), 3.0);
        match &replaced[0].data {
            MetricData::Gauge(point) => assert_eq!(point.timestamp, START + 1_000_000_000),
            other => panic!("expected gauge, got {other:?}"),
        }

        assert_relative_eq!(gauge_value(find(&batch, "dropped")[0]), -2.0);
    }

    #[test]
    fn gauge_explicit_timestamp() {
        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["temp:21.5|g|T1656581400"], addr(5000));

        let batch = single_batch(aggregator.flush());
        match &find(&batch, "temp")[0].data {
            MetricData::Gauge(point) => assert_eq!(point.timestamp, 1_656_581_400_000_000_000),
            other => panic!("expected gauge, got {other:?}"),
        }
    }

    #[test]
    fn tags_separate_series() {
        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(
            &mut aggregator,
            &["hits:1|c|#a:1,b:2", "hits:1|c|#b:2,a:1", "hits:1|c|#a:2", "hits:1|g"],
            addr(5000),
        );

        let batch = single_batch(aggregator.flush());
        let hits = find(&batch, "hits");
        assert_eq!(hits.len(), 3);

        let key = Key::from_parts("hits", vec![Label::new("a", "1"), Label::new("b", "2")]);
        let tagged =
            hits.iter().find(|m| m.key == key).expect("tagged counter should be present");
        assert!(matches!(tagged.data, MetricData::Sum(ref point) if point.value == 2));
    }

    #[test]
    fn ip_only_aggregation() {
        let lines = ["foo:1|c"];

        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &lines, addr(5000));
        ingest_all(&mut aggregator, &lines, addr(5001));
        assert_eq!(aggregator.flush().len(), 2);

        let config = AggregatorConfig { ip_only_aggregation: true, ..Default::default() };
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &lines, addr(5000));
        ingest_all(&mut aggregator, &lines, addr(5001));

        let batch = single_batch(aggregator.flush());
        assert_eq!(batch.addr, SourceAddr::Ip(addr(5000).ip()));
        assert!(matches!(find(&batch, "foo")[0].data, MetricData::Sum(ref point) if point.value == 2));
    }

    #[test]
    fn flush_resets_state() {
        let (mut aggregator, clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["foo:1|c", "bar:1|g"], addr(5000));
        assert!(!aggregator.is_empty());

        clock.increment(Duration::from_secs(60));
        assert_eq!(aggregator.flush().len(), 1);
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.interval_start(), START + 60_000_000_000);
        assert!(aggregator.flush().is_empty());

        ingest_all(&mut aggregator, &["foo:5|c"], addr(5000));
        clock.increment(Duration::from_secs(60));
        let batch = single_batch(aggregator.flush());
        match &find(&batch, "foo")[0].data {
            MetricData::Sum(point) => {
                assert_eq!(point.value, 5);
                assert_eq!(point.start_timestamp, START + 60_000_000_000);
                assert_eq!(point.timestamp, START + 120_000_000_000);
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn invalid_line_aggregates_nothing() {
        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        assert_eq!(
            aggregator.ingest("foo:1:bar|c", addr(5000)),
            Err(ParseError::InvalidValue("bar".into()))
        );
        assert!(aggregator.is_empty());
    }

    #[test]
    fn timings_as_gauges() {
        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["latency:10|ms", "latency:20:30|ms", "size:5|d"], addr(5000));

        let batch = single_batch(aggregator.flush());
        let latency = find(&batch, "latency");
        assert_eq!(latency.len(), 3);
        assert!(latency.iter().all(|m| m.unit == "ms"));

        let values = latency.iter().map(|m| gauge_value(m)).collect::<Vec<_>>();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);

        let size = find(&batch, "size");
        assert_eq!(size.len(), 1);
        assert_eq!(size[0].unit, "");
    }

    #[test]
    fn timings_as_summary() {
        let config = mapped(TimerHistogramMapping::new(StatsdType::Timing, ObserverType::Summary));
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["latency:1|ms", "latency:2|ms|@2", "latency:3|ms"], addr(5000));

        let batch = single_batch(aggregator.flush());
        let latency = find(&batch, "latency");
        assert_eq!(latency.len(), 1);
        match &latency[0].data {
            MetricData::Summary(point) => {
                assert_eq!(point.count, 4);
                assert_relative_eq!(point.sum, 8.0);
                assert_eq!(point.quantiles.len(), 6);
                assert_relative_eq!(point.quantiles[0].value, 1.0);
                assert_relative_eq!(point.quantiles[2].value, 2.0);
                assert_relative_eq!(point.quantiles[5].value, 3.0);
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn fractional_rates_weigh_summaries_down() {
        let config = mapped(TimerHistogramMapping::new(StatsdType::Timing, ObserverType::Summary));
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["t:2|ms|@0.5", "u:10|ms", "u:20|ms|@0.5"], addr(5000));

        let batch = single_batch(aggregator.flush());
        match &find(&batch, "t")[0].data {
            MetricData::Summary(point) => {
                assert_eq!(point.count, 0);
                assert_relative_eq!(point.sum, 1.0);
            }
            other => panic!("expected summary, got {other:?}"),
        }
        match &find(&batch, "u")[0].data {
            MetricData::Summary(point) => {
                assert_eq!(point.count, 1);
                assert_relative_eq!(point.sum, 20.0);
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn histogram_rate_rounding_to_zero_drops_value() {
        let config = mapped(TimerHistogramMapping::new(
            StatsdType::Distribution,
            ObserverType::Histogram,
        ));
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["x:8|d|@0.3", "y:8|d|@0.5"], addr(5000));

        let batch = single_batch(aggregator.flush());
        match &find(&batch, "x")[0].data {
            MetricData::ExponentialHistogram(point) => {
                assert_eq!(point.count, 0);
                assert!(point.positive.counts.is_empty());
            }
            other => panic!("expected histogram, got {other:?}"),
        }
        match &find(&batch, "y")[0].data {
            MetricData::ExponentialHistogram(point) => assert_eq!(point.count, 1),
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn counters_ignore_sample_rate() {
        let (mut aggregator, _clock) = new_aggregator(AggregatorConfig::default());
        ingest_all(&mut aggregator, &["foo:3|c|@0.1", "foo:2|c|@4", "foo:1.9|c|@0.5"], addr(5000));

        let batch = single_batch(aggregator.flush());
        assert!(matches!(find(&batch, "foo")[0].data, MetricData::Sum(ref point) if point.value == 6));
    }

    #[test]
    fn distributions_as_histogram() {
        let config = mapped(
            TimerHistogramMapping::new(StatsdType::Distribution, ObserverType::Histogram)
                .with_histogram_max_size(4),
        );
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(
            &mut aggregator,
            &["size:1|d", "size:2|h", "size:4|d|@2", "size:8|d|@3.2", "size:16|d|@0.3", "size:0|d"],
            addr(5000),
        );

        let batch = single_batch(aggregator.flush());
        let size = find(&batch, "size");
        assert_eq!(size.len(), 2);

        let histogram = size
            .iter()
            .find_map(|m| match &m.data {
                MetricData::ExponentialHistogram(point) if point.count == 7 => Some(point),
                _ => None,
            })
            .expect("distribution histogram should be present");
        assert_eq!(histogram.scale, 0);
        assert_eq!(histogram.zero_count, 1);
        assert_eq!(histogram.positive.offset, -1);
        assert_eq!(histogram.positive.counts, vec![1, 0, 2, 3]);
    }

    #[test]
    fn disabled_observer_drops_samples() {
        let config = mapped(TimerHistogramMapping::new(StatsdType::Timing, ObserverType::Disabled));
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["latency:1|ms", "hits:1|c"], addr(5000));

        let batch = single_batch(aggregator.flush());
        assert!(find(&batch, "latency").is_empty());
        assert_eq!(find(&batch, "hits").len(), 1);
    }

    #[test]
    fn metric_type_label() {
        let config = AggregatorConfig { enable_metric_type: true, ..Default::default() };
        let (mut aggregator, _clock) = new_aggregator(config);
        ingest_all(&mut aggregator, &["hits:1|c|#env:prod"], addr(5000));

        let batch = single_batch(aggregator.flush());
        let labels = batch.metrics[0].key.labels().map(|l| (l.key(), l.value())).collect::<Vec<_>>();
        assert_eq!(labels, vec![("env", "prod"), ("metric_type", "counter")]);
    }

    proptest! {
        #[test]
        fn counter_sum_is_order_independent(mut values in prop::collection::vec(-1000i64..1000, 1..50)) {
            let expected = values.iter().sum::<i64>();

            let (mut forward, _clock) = new_aggregator(AggregatorConfig::default());
            for value in &values {
                forward.ingest(&format!("foo:{value}|c"), addr(5000)).expect("line should parse");
            }

            values.reverse();
            let (mut backward, _clock) = new_aggregator(AggregatorConfig::default());
            for value in &values {
                backward.ingest(&format!("foo:{value}|c"), addr(5000)).expect("line should parse");
            }

            for batches in [forward.flush(), backward.flush()] {
                let batch = single_batch(batches);
                let matched = matches!(batch.metrics[0].data, MetricData::Sum(ref point) if point.value == expected);
                prop_assert!(matched);
            }
        }
    }
}
