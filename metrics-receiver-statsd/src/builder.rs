use std::{
    net::{SocketAddr, ToSocketAddrs as _},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    aggregator::Aggregator,
    clock::{Clock, SystemClock},
    config::{AggregatorConfig, ObserverType, StatsdType, TimerHistogramMapping},
    receiver::{BatchConsumer, ReceiverHandle, StatsdReceiver},
    transport::{Reporter, Server, ServerError, TracingReporter, Transport},
};

const DEFAULT_AGGREGATION_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors that could occur while building or starting a receiver.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse or resolve the listen address.
    #[error("invalid endpoint: {reason}")]
    InvalidEndpoint {
        /// Details about the failure.
        reason: String,
    },

    /// The transport name is not supported.
    #[error("unsupported transport: {0:?}")]
    UnsupportedTransport(String),

    /// The aggregation interval is zero.
    #[error("aggregation interval must be greater than zero")]
    InvalidAggregationInterval,

    /// The hand-off queue capacity is zero.
    #[error("queue capacity must be greater than zero")]
    InvalidQueueCapacity,

    /// The statsd type of a mapping is not known.
    #[error("unknown statsd type {0:?}, expected one of timing, timer, histogram or distribution")]
    UnknownStatsdType(String),

    /// The observer type of a mapping is not known.
    #[error("unknown observer type {0:?}, expected one of gauge, summary, histogram or disabled")]
    UnknownObserverType(String),

    /// The statsd type of a mapping is known, but its aggregation cannot be configured.
    #[error("aggregation of {0} metrics cannot be configured")]
    UnsupportedMapping(String),

    /// The histogram maximum size is out of range.
    #[error("histogram max size {0} is out of range, expected a value between 2 and 16384")]
    InvalidHistogramMaxSize(u32),

    /// Histogram settings were given for an observer that is not a histogram.
    #[error("histogram settings require the histogram observer, got {0}")]
    HistogramConfigRequiresHistogramObserver(ObserverType),

    /// Summary settings were given for an observer that is not a summary.
    #[error("summary settings require the summary observer, got {0}")]
    SummaryConfigRequiresSummaryObserver(ObserverType),

    /// A summary percentile is out of range.
    #[error("percentile {0} is out of range, expected a value between 0 and 100")]
    InvalidPercentile(f64),

    /// Failed to bind the listener.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Builder for a StatsD receiver.
pub struct StatsdReceiverBuilder<C = SystemClock> {
    endpoint: SocketAddr,
    transport: Transport,
    aggregation_interval: Duration,
    queue_capacity: usize,
    enable_metric_type: bool,
    enable_simple_tags: bool,
    monotonic_counters: bool,
    ip_only_aggregation: bool,
    mappings: Vec<TimerHistogramMapping>,
    reporter: Arc<dyn Reporter>,
    clock: C,
}

impl<C> StatsdReceiverBuilder<C>
where
    C: Clock,
{
    /// Set the address to listen on.
    ///
    /// The address needs to be in the format of `<host>:<port>`. Host names are resolved, and the first address is
    /// used.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address cannot be parsed or resolved, an error will be returned indicating the reason.
    pub fn with_endpoint<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let addr = addr.as_ref();
        self.endpoint = addr
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidEndpoint { reason: e.to_string() })?
            .next()
            .ok_or_else(|| BuildError::InvalidEndpoint {
                reason: format!("{addr} did not resolve to any address"),
            })?;
        Ok(self)
    }

    /// Set the transport to listen with.
    ///
    /// Valid names are `tcp`, `tcp4`, `tcp6`, `udp`, `udp4` and `udp6`. The IP version follows the endpoint.
    ///
    /// Defaults to `tcp`.
    ///
    /// # Errors
    ///
    /// If the transport name is not supported, an error will be returned.
    pub fn with_transport<T>(mut self, transport: T) -> Result<Self, BuildError>
    where
        T: AsRef<str>,
    {
        self.transport = transport.as_ref().parse().map_err(|e| match e {
            ServerError::UnsupportedTransport(name) => BuildError::UnsupportedTransport(name),
            other => BuildError::Server(other),
        })?;
        Ok(self)
    }

    /// Set the aggregation interval.
    ///
    /// Series are aggregated over this interval, and flushed to the consumer at the end of it. Counters, summaries
    /// and histograms are reported as deltas over the interval.
    ///
    /// Defaults to 60 seconds.
    ///
    /// # Errors
    ///
    /// If the interval is zero, an error will be returned.
    pub fn with_aggregation_interval(mut self, interval: Duration) -> Result<Self, BuildError> {
        if interval.is_zero() {
            return Err(BuildError::InvalidAggregationInterval);
        }
        self.aggregation_interval = interval;
        Ok(self)
    }

    /// Set the capacity of the queue between the listener and the aggregator.
    ///
    /// When the queue is full, connections stop being read from until the aggregator catches up.
    ///
    /// Defaults to 1,024 lines.
    ///
    /// # Errors
    ///
    /// If the capacity is zero, an error will be returned.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self, BuildError> {
        if capacity == 0 {
            return Err(BuildError::InvalidQueueCapacity);
        }
        self.queue_capacity = capacity;
        Ok(self)
    }

    /// Sets whether to add a `metric_type` label, holding the statsd type name, to every series.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_metric_type_tag(mut self, enabled: bool) -> Self {
        self.enable_metric_type = enabled;
        self
    }

    /// Sets whether to accept tags without a value, such as `#canary`.
    ///
    /// Such tags get an empty value.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_simple_tags(mut self, enabled: bool) -> Self {
        self.enable_simple_tags = enabled;
        self
    }

    /// Sets whether counters are reported as monotonic sums.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_monotonic_counters(mut self, enabled: bool) -> Self {
        self.monotonic_counters = enabled;
        self
    }

    /// Sets whether to aggregate by source IP only.
    ///
    /// Clients commonly send from ephemeral ports, so aggregating by full address can split a single client into
    /// many sources. When enabled, all ports of a host are aggregated together.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_ip_only_aggregation(mut self, enabled: bool) -> Self {
        self.ip_only_aggregation = enabled;
        self
    }

    /// Adds a mapping that selects how a statsd type is aggregated.
    ///
    /// Mappings are applied in order, so a later mapping for the same type replaces an earlier one.
    ///
    /// Defaults to `timer` and `histogram` both being mapped to the gauge observer.
    ///
    /// # Errors
    ///
    /// If the mapping's observer settings don't match its observer type, or are out of range, an error will be
    /// returned.
    pub fn with_timer_histogram_mapping(
        mut self,
        mapping: TimerHistogramMapping,
    ) -> Result<Self, BuildError> {
        mapping.validate()?;
        self.mappings.push(mapping);
        Ok(self)
    }

    /// Adds a mapping given by name, such as `("timer", "summary")`.
    ///
    /// See [`with_timer_histogram_mapping`][Self::with_timer_histogram_mapping].
    ///
    /// # Errors
    ///
    /// If either name is not known, an error will be returned.
    pub fn with_mapping_names<S, O>(self, statsd_type: S, observer_type: O) -> Result<Self, BuildError>
    where
        S: AsRef<str>,
        O: AsRef<str>,
    {
        let statsd_type = statsd_type.as_ref().parse::<StatsdType>()?;
        let observer_type = observer_type.as_ref().parse::<ObserverType>()?;
        self.with_timer_histogram_mapping(TimerHistogramMapping::new(statsd_type, observer_type))
    }

    /// Set the reporter that receives notifications about dropped lines and connection problems.
    ///
    /// Defaults to [`TracingReporter`].
    #[must_use]
    pub fn with_reporter<R>(mut self, reporter: R) -> Self
    where
        R: Reporter,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Set the clock used to timestamp series.
    ///
    /// Defaults to the system clock.
    #[must_use]
    pub fn with_clock<C2>(self, clock: C2) -> StatsdReceiverBuilder<C2>
    where
        C2: Clock,
    {
        StatsdReceiverBuilder {
            endpoint: self.endpoint,
            transport: self.transport,
            aggregation_interval: self.aggregation_interval,
            queue_capacity: self.queue_capacity,
            enable_metric_type: self.enable_metric_type,
            enable_simple_tags: self.enable_simple_tags,
            monotonic_counters: self.monotonic_counters,
            ip_only_aggregation: self.ip_only_aggregation,
            mappings: self.mappings,
            reporter: self.reporter,
            clock,
        }
    }

    /// Returns the aggregator configuration described by the builder.
    ///
    /// # Errors
    ///
    /// If a mapping is invalid, an error will be returned.
    pub fn aggregator_config(&self) -> Result<AggregatorConfig, BuildError> {
        AggregatorConfig {
            enable_metric_type: self.enable_metric_type,
            enable_simple_tags: self.enable_simple_tags,
            monotonic_counters: self.monotonic_counters,
            ip_only_aggregation: self.ip_only_aggregation,
            ..Default::default()
        }
        .with_mappings(&self.mappings)
    }

    /// Builds the aggregator without any networking, for feeding lines directly.
    ///
    /// # Errors
    ///
    /// If a mapping is invalid, an error will be returned.
    pub fn build_aggregator(self) -> Result<Aggregator<C>, BuildError> {
        let config = self.aggregator_config()?;
        Ok(Aggregator::with_clock(config, self.clock))
    }

    /// Binds the listener and starts the receiver.
    ///
    /// The listener and the ingestion loop are spawned as tasks on the current runtime. Batches are handed to
    /// `consumer` at the end of every aggregation interval, and once more when the receiver is shut down.
    ///
    /// # Errors
    ///
    /// If a mapping is invalid, or the listener cannot be bound, an error will be returned.
    pub async fn start<B>(self, consumer: B) -> Result<ReceiverHandle, BuildError>
    where
        B: BatchConsumer,
    {
        let config = self.aggregator_config()?;
        let server = Arc::new(Server::bind(self.transport, self.endpoint).await?);
        let (sender, queue) = mpsc::channel(self.queue_capacity);

        let receiver = StatsdReceiver::new(
            Aggregator::with_clock(config, self.clock),
            consumer,
            Arc::clone(&self.reporter),
            self.aggregation_interval,
        );
        let ingesting = tokio::spawn(async move {
            receiver.run(queue).await;
        });

        let serving = {
            let server = Arc::clone(&server);
            let reporter = self.reporter;
            tokio::spawn(async move {
                let result = server.serve(sender, reporter).await;
                if let Err(e) = &result {
                    error!(error = %e, "Listener stopped unexpectedly.");
                }
                result
            })
        };

        info!(
            addr = %server.local_addr(),
            transport = %server.transport(),
            interval_secs = self.aggregation_interval.as_secs_f64(),
            "StatsD receiver started."
        );

        Ok(ReceiverHandle::new(server, serving, ingesting))
    }
}

impl Default for StatsdReceiverBuilder<SystemClock> {
    fn default() -> Self {
        StatsdReceiverBuilder {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 8125)),
            transport: Transport::Tcp,
            aggregation_interval: DEFAULT_AGGREGATION_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enable_metric_type: false,
            enable_simple_tags: false,
            monotonic_counters: false,
            ip_only_aggregation: false,
            mappings: vec![
                TimerHistogramMapping::new(StatsdType::Timing, ObserverType::Gauge),
                TimerHistogramMapping::new(StatsdType::Histogram, ObserverType::Gauge),
            ],
            reporter: Arc::new(TracingReporter),
            clock: SystemClock,
        }
    }
}
