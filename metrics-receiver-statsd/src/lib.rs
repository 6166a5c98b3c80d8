//! A receiver that ingests [StatsD][statsd] and [DogStatsD][dsd] lines over TCP or UDP, and aggregates them into
//! per-source metric batches.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/datagram_shell/
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_receiver_statsd::{ConsumeError, MetricBatch, StatsdReceiverBuilder};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // First, create a builder.
//! //
//! // The builder configures the listen address, the transport, how often series are flushed, and how timings and
//! // histograms are aggregated.
//! let builder = StatsdReceiverBuilder::default()
//!     .with_endpoint("0.0.0.0:8125")?
//!     .with_transport("udp")?
//!     .with_mapping_names("timer", "summary")?;
//!
//! // Starting the receiver binds the listener and spawns the listener and ingestion tasks on the current runtime.
//! // Every aggregation interval, one batch per source address is handed to the consumer.
//! let handle = builder
//!     .start(|batch: MetricBatch| -> Result<(), ConsumeError> {
//!         println!("{} series from {}", batch.metrics.len(), batch.addr);
//!         Ok(())
//!     })
//!     .await?;
//!
//! // Shutting down closes the listener, and flushes whatever was aggregated since the last interval.
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Line format
//!
//! Each line has the form `<name>:<value>[:<value>...]|<type>[|@<rate>][|#<tags>][|c:<container>][|T<seconds>]`.
//!
//! Supported types are counters (`c`), gauges (`g`), timings (`ms`), histograms (`h`) and distributions (`d`). Gauge
//! values with a leading sign are applied as deltas to the current value. Tags are `key:value` pairs, and may be
//! given without a value when simple tags are enabled.
//!
//! # Aggregation
//!
//! Series are keyed by source address, name, type and sorted tags, and are reported once per aggregation interval:
//!
//! - counters become delta sums, and ignore the sample rate
//! - gauges become the last (or accumulated) value
//! - timings, histograms and distributions are aggregated according to their mapping, which is one of: a gauge per
//!   sample, a weighted summary with configurable percentiles, a base-2 exponential histogram, or dropped entirely
//!
//! The sample rate of a timing, histogram or distribution value is used as its weight. Exponential histograms
//! record the rate rounded to a whole repeat count, so values with a rate below 0.5 are dropped.
//!
//! # Telemetry
//!
//! The receiver records its own counters through the [`metrics`] facade, such as lines received and rejected, and
//! batches flushed. All internal telemetry is under the `statsd.receiver` namespace. Without a global recorder
//! installed, these are no-ops.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod aggregator;
pub use self::aggregator::Aggregator;

mod builder;
pub use self::builder::{BuildError, StatsdReceiverBuilder};

mod clock;
pub use self::clock::{Clock, MockClock, SystemClock};

mod config;
pub use self::config::{
    AggregatorConfig, ObserverCategory, ObserverType, StatsdType, TimerHistogramMapping,
};

mod data;
pub use self::data::{
    Buckets, ExponentialHistogramPoint, GaugePoint, Interval, Metric, MetricBatch, MetricData,
    QuantileValue, Scope, SourceAddr, SumPoint, SummaryPoint,
};

mod histogram;
pub use self::histogram::{
    DEFAULT_MAX_SIZE, MAXIMUM_MAX_SIZE, MAX_SCALE, MIN_MAX_SIZE, MIN_SCALE,
};

mod identity;
pub use self::identity::{MetricIdentity, MetricType};

pub mod mapping;

mod parser;
pub use self::parser::{parse_line, ParseError, ParsedLine, RawSample};

mod receiver;
pub use self::receiver::{BatchConsumer, ConsumeError, ReceiverHandle, StatsdReceiver};

mod summary;
mod telemetry;

pub mod transport;
pub use self::transport::{RawMetric, Reporter, ServerError, TracingReporter, Transport};
