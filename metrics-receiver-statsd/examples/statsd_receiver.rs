use std::time::Duration;

use metrics_receiver_statsd::{
    ConsumeError, MetricBatch, MetricData, ObserverType, StatsdReceiverBuilder, StatsdType,
    TimerHistogramMapping,
};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let handle = StatsdReceiverBuilder::default()
        .with_endpoint("localhost:8125")
        .expect("failed to parse endpoint")
        .with_transport("udp")
        .expect("failed to parse transport")
        .with_aggregation_interval(Duration::from_secs(10))
        .expect("invalid aggregation interval")
        .with_simple_tags(true)
        .with_timer_histogram_mapping(
            TimerHistogramMapping::new(StatsdType::Timing, ObserverType::Summary)
                .with_percentiles([50.0, 90.0, 99.0]),
        )
        .expect("invalid timer mapping")
        .with_timer_histogram_mapping(
            TimerHistogramMapping::new(StatsdType::Distribution, ObserverType::Histogram)
                .with_histogram_max_size(64),
        )
        .expect("invalid distribution mapping")
        .start(|batch: MetricBatch| -> Result<(), ConsumeError> {
            for metric in &batch.metrics {
                match &metric.data {
                    MetricData::Gauge(point) => {
                        info!(source = %batch.addr, key = ?metric.key, value = point.value, "gauge");
                    }
                    MetricData::Sum(point) => {
                        info!(source = %batch.addr, key = ?metric.key, value = point.value, "sum");
                    }
                    MetricData::Summary(point) => {
                        info!(source = %batch.addr, key = ?metric.key, count = point.count, sum = point.sum, "summary");
                    }
                    MetricData::ExponentialHistogram(point) => {
                        info!(source = %batch.addr, key = ?metric.key, count = point.count, scale = point.scale, "histogram");
                    }
                }
            }
            Ok(())
        })
        .await
        .expect("failed to start receiver");

    info!(addr = %handle.local_addr(), "Listening. Send lines with `echo 'foo:1|c' | nc -u -w0 localhost 8125`.");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    handle.shutdown().await.expect("failed to shut down receiver");
}
