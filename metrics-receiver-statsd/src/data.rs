//! Aggregated output handed to the downstream consumer.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use metrics::Key;

/// Address that a set of series was aggregated under.
///
/// Either the full peer address, or only its IP when traffic from all ports of a host is merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceAddr {
    /// Full socket address of the peer.
    Socket(SocketAddr),

    /// IP address of the peer, with the port stripped.
    Ip(IpAddr),
}

impl SourceAddr {
    /// Returns the IP address of the source.
    pub fn ip(&self) -> IpAddr {
        match self {
            SourceAddr::Socket(addr) => addr.ip(),
            SourceAddr::Ip(ip) => *ip,
        }
    }
}

impl fmt::Display for SourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceAddr::Socket(addr) => addr.fmt(f),
            SourceAddr::Ip(ip) => ip.fmt(f),
        }
    }
}

/// Instrumentation scope that produced a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scope {
    /// Scope name.
    pub name: &'static str,

    /// Scope version.
    pub version: &'static str,
}

impl Scope {
    /// Scope of this receiver.
    pub const RECEIVER: Scope =
        Scope { name: env!("CARGO_PKG_NAME"), version: env!("CARGO_PKG_VERSION") };
}

/// Wall-clock bounds of an accumulation window, in unix nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interval {
    /// When the window started: the previous flush, or aggregator creation.
    pub start: u64,

    /// When the window ended: the flush time.
    pub end: u64,
}

/// All series aggregated for one source during one interval.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricBatch {
    /// Source the series were received from.
    pub addr: SourceAddr,

    /// Scope that produced the batch.
    pub scope: Scope,

    /// Aggregated series.
    pub metrics: Vec<Metric>,
}

/// A single aggregated series.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Name and normalized labels.
    pub key: Key,

    /// Unit of the values, or the empty string.
    pub unit: &'static str,

    /// Aggregated data point.
    pub data: MetricData,
}

/// Aggregated data point of a series.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricData {
    /// Last known value.
    Gauge(GaugePoint),

    /// Delta sum over the interval.
    Sum(SumPoint),

    /// Weighted quantile summary over the interval.
    Summary(SummaryPoint),

    /// Delta exponential histogram over the interval.
    ExponentialHistogram(ExponentialHistogramPoint),
}

/// A gauge value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaugePoint {
    /// Value.
    pub value: f64,

    /// When the value was observed, in unix nanoseconds.
    pub timestamp: u64,
}

/// A delta sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SumPoint {
    /// Accumulated value.
    pub value: i64,

    /// Start of the interval, in unix nanoseconds.
    pub start_timestamp: u64,

    /// End of the interval, or the explicit timestamp of the last sample, in unix nanoseconds.
    pub timestamp: u64,

    /// Whether the sum is flagged as monotonic.
    pub is_monotonic: bool,
}

/// A quantile and its value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantileValue {
    /// Quantile, between 0.0 and 1.0 inclusive.
    pub quantile: f64,

    /// Value at the quantile.
    pub value: f64,
}

/// A weighted summary.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryPoint {
    /// Number of events, accounting for sample rates.
    pub count: u64,

    /// Sum of all events, accounting for sample rates.
    pub sum: f64,

    /// Configured quantiles, in ascending order.
    pub quantiles: Vec<QuantileValue>,

    /// Start of the interval, in unix nanoseconds.
    pub start_timestamp: u64,

    /// End of the interval, in unix nanoseconds.
    pub timestamp: u64,
}

/// A base-2 exponential histogram.
#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialHistogramPoint {
    /// Number of events, including the zero bucket.
    pub count: u64,

    /// Sum of all events.
    pub sum: f64,

    /// Smallest recorded value.
    pub min: f64,

    /// Largest recorded value.
    pub max: f64,

    /// Resolution: bucket boundaries are powers of `2^(2^-scale)`.
    pub scale: i32,

    /// Number of events exactly equal to zero.
    pub zero_count: u64,

    /// Buckets for positive values.
    pub positive: Buckets,

    /// Buckets for negative values, indexed by absolute value.
    pub negative: Buckets,

    /// Start of the interval, in unix nanoseconds.
    pub start_timestamp: u64,

    /// End of the interval, in unix nanoseconds.
    pub timestamp: u64,
}

/// A dense run of exponential histogram buckets.
///
/// `counts[i]` holds the count of bucket index `offset + i`, whose boundaries are
/// `(base^(offset + i), base^(offset + i + 1)]`. There are no gaps: every index between the first
/// and the last populated bucket has an entry, possibly zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buckets {
    /// Index of the first bucket.
    pub offset: i32,

    /// Bucket counts, starting at `offset`.
    pub counts: Vec<u64>,
}

impl Buckets {
    /// Returns `true` if no bucket has been allocated.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Returns the sum of all bucket counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Returns the index of the last allocated bucket, if any.
    pub(crate) fn last_index(&self) -> Option<i32> {
        let len = i32::try_from(self.counts.len()).ok()?;
        (len > 0).then(|| self.offset + len - 1)
    }

    /// Adds `count` to the bucket at `index`.
    ///
    /// The first increment of an empty set sets the offset. Afterwards, the run is extended with
    /// zero buckets in either direction so that `index` is covered.
    pub(crate) fn increment(&mut self, index: i32, count: u64) {
        if self.counts.is_empty() {
            self.offset = index;
            self.counts.push(count);
            return;
        }

        if index < self.offset {
            let missing = (i64::from(self.offset) - i64::from(index)) as usize;
            self.counts.splice(0..0, std::iter::repeat(0).take(missing));
            self.offset = index;
        }

        let position = (i64::from(index) - i64::from(self.offset)) as usize;
        if position >= self.counts.len() {
            self.counts.resize(position + 1, 0);
        }
        self.counts[position] += count;
    }

    /// Merges adjacent buckets so that each new bucket covers `2^by` old ones.
    pub(crate) fn downscale(&mut self, by: u32) {
        if by == 0 || self.counts.is_empty() {
            return;
        }

        let old = std::mem::take(&mut self.counts);
        let old_offset = self.offset;
        for (i, count) in (old_offset..).zip(old) {
            self.increment(i >> by, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::{Buckets, SourceAddr};

    #[test]
    fn increment_densifies_forward() {
        let mut buckets = Buckets::default();
        buckets.increment(3, 1);
        buckets.increment(6, 2);
        buckets.increment(3, 4);

        assert_eq!(buckets.offset, 3);
        assert_eq!(buckets.counts, vec![5, 0, 0, 2]);
        assert_eq!(buckets.last_index(), Some(6));
        assert_eq!(buckets.total(), 7);
    }

    #[test]
    fn increment_densifies_backward() {
        let mut buckets = Buckets::default();
        buckets.increment(5, 1);
        buckets.increment(2, 3);

        assert_eq!(buckets.offset, 2);
        assert_eq!(buckets.counts, vec![3, 0, 0, 1]);
    }

    #[test]
    fn downscale_merges_neighbours() {
        // Cases are defined as: offset, counts, downscale by, expected offset, expected counts.
        let cases: [(i32, Vec<u64>, u32, i32, Vec<u64>); 4] = [
            (0, vec![1, 2, 3, 4], 1, 0, vec![3, 7]),
            (1, vec![1, 2, 3, 4], 1, 0, vec![1, 5, 4]),
            (-3, vec![1, 1, 1, 1, 1], 2, -1, vec![3, 2]),
            (4, vec![7], 0, 4, vec![7]),
        ];

        for (offset, counts, by, expected_offset, expected_counts) in cases {
            let mut buckets = Buckets { offset, counts };
            buckets.downscale(by);

            assert_eq!(buckets.offset, expected_offset);
            assert_eq!(buckets.counts, expected_counts);
        }
    }

    #[test]
    fn source_addr_display() {
        let socket = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8125);
        assert_eq!(SourceAddr::Socket(socket).to_string(), "127.0.0.1:8125");
        assert_eq!(SourceAddr::Ip(socket.ip()).to_string(), "127.0.0.1");
        assert_eq!(SourceAddr::Socket(socket).ip(), SourceAddr::Ip(socket.ip()).ip());
    }
}
