use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error};

use crate::{
    aggregator::Aggregator,
    clock::{Clock, SystemClock},
    data::MetricBatch,
    transport::{RawMetric, Reporter, Server, ServerError},
};

/// Error returned by a [`BatchConsumer`] that could not accept a batch.
#[derive(Debug, Error)]
#[error("failed to consume batch: {reason}")]
pub struct ConsumeError {
    reason: String,
}

impl ConsumeError {
    /// Creates a new `ConsumeError`.
    pub fn new<R>(reason: R) -> Self
    where
        R: Into<String>,
    {
        Self { reason: reason.into() }
    }

    /// Returns the reason the batch was not accepted.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Downstream consumer of aggregated batches.
pub trait BatchConsumer: Send + 'static {
    /// Consumes a batch.
    ///
    /// # Errors
    ///
    /// If the batch could not be accepted, an error is returned. The batch is dropped.
    fn consume(&mut self, batch: MetricBatch) -> Result<(), ConsumeError>;
}

impl<F> BatchConsumer for F
where
    F: FnMut(MetricBatch) -> Result<(), ConsumeError> + Send + 'static,
{
    fn consume(&mut self, batch: MetricBatch) -> Result<(), ConsumeError> {
        self(batch)
    }
}

impl BatchConsumer for std::sync::mpsc::Sender<MetricBatch> {
    fn consume(&mut self, batch: MetricBatch) -> Result<(), ConsumeError> {
        self.send(batch).map_err(|_| ConsumeError::new("batch receiver disconnected"))
    }
}

/// Ingestion loop.
///
/// `StatsdReceiver` is the single owner of the aggregation state: it drains the hand-off queue
/// into the aggregator, and periodically flushes the aggregator into the consumer.
pub struct StatsdReceiver<B, C = SystemClock> {
    aggregator: Aggregator<C>,
    consumer: B,
    reporter: Arc<dyn Reporter>,
    flush_interval: Duration,
}

impl<B, C> StatsdReceiver<B, C>
where
    B: BatchConsumer,
    C: Clock,
{
    /// Creates a new `StatsdReceiver`.
    ///
    /// A zero `flush_interval` disables periodic flushing, leaving only the final flush when the
    /// queue closes.
    pub fn new(
        aggregator: Aggregator<C>,
        consumer: B,
        reporter: Arc<dyn Reporter>,
        flush_interval: Duration,
    ) -> Self {
        Self { aggregator, consumer, reporter, flush_interval }
    }

    /// Returns a reference to the aggregator.
    pub fn aggregator(&self) -> &Aggregator<C> {
        &self.aggregator
    }

    /// Aggregates a single line.
    ///
    /// Malformed lines are reported and skipped.
    pub fn ingest(&mut self, metric: &RawMetric) {
        if let Err(e) = self.aggregator.ingest(&metric.raw, metric.addr) {
            self.reporter.on_warning(format_args!(
                "Failed to parse line {:?} from {}: {}",
                metric.raw, metric.addr, e
            ));
        }
    }

    /// Flushes the aggregator, handing every batch to the consumer.
    pub fn flush(&mut self) {
        for batch in self.aggregator.flush() {
            let addr = batch.addr;
            let series = batch.metrics.len();

            if let Err(e) = self.consumer.consume(batch) {
                self.aggregator.telemetry().batch_rejected();
                error!(%addr, series, error = %e, "Failed to hand off batch.");
            }
        }
    }

    /// Drains `receiver` until it closes, flushing on every interval tick.
    ///
    /// Once the queue closes, a final flush is done and the receiver is returned.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<RawMetric>) -> Self {
        let mut ticker = (!self.flush_interval.is_zero()).then(|| {
            let mut ticker =
                time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                metric = receiver.recv() => match metric {
                    Some(metric) => self.ingest(&metric),
                    None => break,
                },
                () = tick(&mut ticker), if ticker.is_some() => self.flush(),
            }
        }

        debug!("Hand-off queue closed. Flushing remaining series.");
        self.flush();

        self
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle to a running receiver.
pub struct ReceiverHandle {
    server: Arc<Server>,
    local_addr: SocketAddr,
    serving: JoinHandle<Result<(), ServerError>>,
    ingesting: JoinHandle<()>,
}

impl ReceiverHandle {
    pub(crate) fn new(
        server: Arc<Server>,
        serving: JoinHandle<Result<(), ServerError>>,
        ingesting: JoinHandle<()>,
    ) -> Self {
        let local_addr = server.local_addr();
        Self { server, local_addr, serving, ingesting }
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the receiver.
    ///
    /// The listener is closed, open connections are waited on, and the remaining series are
    /// flushed to the consumer before returning.
    ///
    /// # Errors
    ///
    /// If the listener had failed before being stopped, its error is returned.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.server.close().await;

        let served = match self.serving.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Listener task failed.");
                Ok(())
            }
        };

        if let Err(e) = self.ingesting.await {
            error!(error = %e, "Ingestion task failed.");
        }

        served
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::{ConsumeError, StatsdReceiver};
    use crate::{
        aggregator::Aggregator,
        clock::MockClock,
        config::AggregatorConfig,
        data::{MetricBatch, MetricData},
        transport::{RawMetric, TracingReporter},
    };

    fn raw(line: &str) -> RawMetric {
        RawMetric {
            raw: line.to_string(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
        }
    }

    fn aggregator() -> Aggregator<MockClock> {
        Aggregator::with_clock(AggregatorConfig::default(), MockClock::new(0))
    }

    #[tokio::test]
    async fn final_flush_when_queue_closes() {
        let batches = Arc::new(Mutex::new(Vec::<MetricBatch>::new()));
        let consumer = {
            let batches = Arc::clone(&batches);
            move |batch: MetricBatch| -> Result<(), ConsumeError> {
                batches.lock().expect("lock").push(batch);
                Ok(())
            }
        };

        let receiver = StatsdReceiver::new(
            aggregator(),
            consumer,
            Arc::new(TracingReporter),
            Duration::from_secs(3600),
        );

        let (sender, queue) = mpsc::channel(8);
        for line in ["foo:1|c", "not a metric", "foo:2|c"] {
            sender.send(raw(line)).await.expect("send");
        }
        drop(sender);

        let receiver = receiver.run(queue).await;
        assert!(receiver.aggregator().is_empty());

        let batches = batches.lock().expect("lock");
        assert_eq!(batches.len(), 1);
        assert!(matches!(batches[0].metrics[0].data, MetricData::Sum(ref point) if point.value == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush() {
        let (batch_tx, batch_rx) = std::sync::mpsc::channel();
        let receiver = StatsdReceiver::new(
            aggregator(),
            batch_tx,
            Arc::new(TracingReporter),
            Duration::from_secs(10),
        );

        let (sender, queue) = mpsc::channel(8);
        let running = tokio::spawn(receiver.run(queue));

        sender.send(raw("foo:1|g")).await.expect("send");
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(batch_rx.try_iter().count(), 1);

        drop(sender);
        running.await.expect("receiver task");
        assert_eq!(batch_rx.try_iter().count(), 0);
    }

    #[tokio::test]
    async fn rejected_batches_are_dropped() {
        let mut receiver = StatsdReceiver::new(
            aggregator(),
            |_batch: MetricBatch| -> Result<(), ConsumeError> { Err(ConsumeError::new("full")) },
            Arc::new(TracingReporter),
            Duration::ZERO,
        );

        receiver.ingest(&raw("foo:1|c"));
        receiver.flush();
        assert!(receiver.aggregator().is_empty());
    }
}
