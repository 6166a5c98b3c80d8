use crate::data::{QuantileValue, SummaryPoint};

/// Percentiles reported by a summary when none are configured.
pub const DEFAULT_PERCENTILES: [f64; 6] = [0.0, 10.0, 50.0, 90.0, 95.0, 100.0];

/// Weighted points collected for a summary over one interval.
///
/// Every point is kept until the interval ends, so that quantiles are exact rather than estimated.
#[derive(Clone, Debug, Default)]
pub(crate) struct WeightedSummary {
    points: Vec<(f64, f64)>,
}

impl WeightedSummary {
    /// Adds `value` with the given weight.
    pub(crate) fn add(&mut self, value: f64, weight: f64) {
        self.points.push((value, weight));
    }

    /// Materializes the summary, reporting the given percentiles.
    ///
    /// Percentiles are in `[0, 100]` and are reported as quantiles in `[0, 1]`.
    pub(crate) fn to_point(
        &self,
        percentiles: &[f64],
        start_timestamp: u64,
        timestamp: u64,
    ) -> SummaryPoint {
        let mut points = self.points.clone();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let total_weight = points.iter().map(|(_, w)| w).sum::<f64>();
        let sum = points.iter().map(|(v, w)| v * w).sum::<f64>();

        let quantiles = percentiles
            .iter()
            .map(|p| {
                let quantile = p / 100.0;
                QuantileValue { quantile, value: empirical_quantile(&points, quantile, total_weight) }
            })
            .collect();

        SummaryPoint { count: total_weight as u64, sum, quantiles, start_timestamp, timestamp }
    }
}

/// Returns the first value, in sorted order, whose cumulative weight reaches `q * total_weight`.
fn empirical_quantile(sorted: &[(f64, f64)], q: f64, total_weight: f64) -> f64 {
    let target = q * total_weight;

    let mut cumulative = 0.0;
    for (value, weight) in sorted {
        cumulative += weight;
        if cumulative >= target {
            return *value;
        }
    }

    sorted.last().map_or(0.0, |(value, _)| *value)
}
