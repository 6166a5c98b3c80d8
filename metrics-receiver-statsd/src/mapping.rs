//! Mapping of externally labeled histogram buckets onto base-2 exponential buckets.
//!
//! Some producers export histograms as a set of buckets each labeled with a value range, such as
//! `vmrange="4.084e+02...4.642e+02"`. When the ranges grow geometrically, they line up with the
//! buckets of a base-2 exponential histogram at some scale, which this module derives.
use thiserror::Error;

use crate::{
    data::Buckets,
    histogram::{scale_change, MAXIMUM_MAX_SIZE, MAX_SCALE, MIN_SCALE},
};

const RANGE_SEPARATOR: &str = "...";

/// Error for a malformed bucket range label.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid bucket range: {0:?}")]
pub struct InvalidRange(pub String);

/// Bounds of a labeled bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketRange {
    /// Lower bound.
    pub start: f64,

    /// Upper bound.
    pub end: f64,
}

impl BucketRange {
    /// Returns the exponential histogram scale whose base best approximates `end / start`.
    ///
    /// See [`scale_for_range`].
    pub fn scale(&self) -> i32 {
        scale_for_range(self.start, self.end)
    }
}

/// Parses a bucket range label of the form `<start>...<end>`.
///
/// Both bounds are floating-point numbers, and may be `Inf`, `+Inf`, or `-Inf`.
///
/// # Errors
///
/// If the separator is missing, or either bound is not a number, an error is returned.
pub fn parse_range(s: &str) -> Result<BucketRange, InvalidRange> {
    let invalid = || InvalidRange(s.to_string());

    let (start, end) = s.split_once(RANGE_SEPARATOR).ok_or_else(invalid)?;
    let start = parse_bound(start).ok_or_else(invalid)?;
    let end = parse_bound(end).ok_or_else(invalid)?;

    Ok(BucketRange { start, end })
}

fn parse_bound(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Returns the exponential histogram scale whose base best approximates `end / start`.
///
/// The base of scale `n` is `2^(2^-n)`, so the scale is `round(-log2(log2(end / start)))`. Ratios
/// that don't describe a growing range (zero or infinite bounds, `end <= start`) don't map to a
/// meaningful scale; the result is clamped to the supported scale range.
pub fn scale_for_range(start: f64, end: f64) -> i32 {
    let scale = -(end / start).log2().log2().round();
    if scale.is_nan() {
        return 0;
    }

    scale.clamp(f64::from(MIN_SCALE), f64::from(MAX_SCALE)) as i32
}

/// Dense exponential histogram buckets for positive values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExponentialHistogramState {
    /// Resolution of the buckets.
    pub scale: i32,

    /// Count of values exactly equal to zero.
    pub zero_count: u64,

    /// Positive buckets.
    pub positive: Buckets,
}

/// Folds `(upper boundary, count)` pairs into dense exponential buckets at `scale`.
///
/// A boundary of zero holds the zero count. Every other boundary `b` is taken to be the upper
/// bound of bucket `index`, where `b = base^(index + 1)`. The first such bucket sets the offset.
/// When boundaries are not exact powers of the base, several source buckets may land on the same
/// index, in which case their counts are summed. Counts are truncated to integers, and buckets
/// with a negative or non-finite boundary are skipped.
///
/// `scale` is clamped to the supported scale range. The dense buckets never span more than
/// [`MAXIMUM_MAX_SIZE`] indexes: when boundaries are too far apart for that, the buckets are merged
/// down to a coarser scale, which is reflected in the returned state.
pub fn convert_buckets<I>(scale: i32, buckets: I) -> ExponentialHistogramState
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let scale = scale.clamp(MIN_SCALE, MAX_SCALE);

    let mut state = ExponentialHistogramState { scale, ..Default::default() };
    for (boundary, count) in buckets {
        if boundary == 0.0 {
            state.zero_count = count as u64;
            continue;
        }
        if !boundary.is_finite() || boundary < 0.0 {
            continue;
        }

        let mut index = boundary_index(boundary, state.scale);
        while let Some(last) = state.positive.last_index() {
            let low = index.min(state.positive.offset);
            let high = index.max(last);
            let change = scale_change(low, high, MAXIMUM_MAX_SIZE)
                .min((state.scale - MIN_SCALE) as u32);
            if change == 0 {
                break;
            }

            state.positive.downscale(change);
            state.scale -= change as i32;
            index = boundary_index(boundary, state.scale);
        }

        state.positive.increment(index, count as u64);
    }

    state
}

/// Returns the index of the bucket whose upper bound is `boundary`.
///
/// `boundary` must be positive and finite, and `scale` within the supported range, which keeps
/// the index well inside `i32`.
fn boundary_index(boundary: f64, scale: i32) -> i32 {
    // log_base(x) = log2(x) / log2(base), and log2(base) = 2^-scale.
    (boundary.log2() * 2f64.powi(scale) - 1.0).round() as i32
}

/// Estimates the sum of a histogram from its labeled buckets.
///
/// Each bucket contributes its count times the midpoint of its range. Buckets with an infinite
/// upper bound, or with no width, contribute nothing.
pub fn estimate_sum<I>(buckets: I) -> f64
where
    I: IntoIterator<Item = (BucketRange, f64)>,
{
    buckets
        .into_iter()
        .filter(|(range, _)| range.end.is_finite() && range.end > range.start)
        .map(|(range, count)| count * (range.start + range.end) / 2.0)
        .sum()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::{
        convert_buckets, estimate_sum, parse_range, scale_for_range, BucketRange, InvalidRange,
    };
    use crate::histogram::{MAXIMUM_MAX_SIZE, MAX_SCALE, MIN_SCALE};

    #[test]
    fn parse_valid_ranges() {
        let cases = [
            ("4.084e+02...4.642e+02", 408.4, 464.2),
            ("0...0.000e+00", 0.0, 0.0),
            ("-Inf...0", f64::NEG_INFINITY, 0.0),
            ("1.000e+18...+Inf", 1.0e18, f64::INFINITY),
            ("1...Inf", 1.0, f64::INFINITY),
        ];

        for (input, start, end) in cases {
            let range = parse_range(input).unwrap_or_else(|e| panic!("{e}"));
            assert_relative_eq!(range.start, start);
            assert_relative_eq!(range.end, end);
        }
    }

    #[test]
    fn parse_invalid_ranges() {
        for input in ["", "1...", "...1", "1.0e...10", "1..2", "a...b", "NaN...1"] {
            assert_eq!(parse_range(input), Err(InvalidRange(input.to_string())), "input: {input}");
        }
    }

    #[test]
    fn scale_from_range() {
        let cases = [
            ("4.642e+01...5.275e+01", 2),
            ("4.084e+02...4.642e+02", 2),
            ("1...4", -1),
            ("1...2", 0),
            ("1...1.41421", 1),
            ("1...1.18921", 2),
            ("1...1.09051", 3),
        ];

        for (input, scale) in cases {
            let range = parse_range(input).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(range.scale(), scale, "input: {input}");
        }
    }

    #[test]
    fn scale_is_clamped_for_degenerate_ranges() {
        assert_eq!(scale_for_range(1.0e18, f64::INFINITY), -10);
        assert_eq!(scale_for_range(0.0, 1.0), -10);
        assert_eq!(scale_for_range(1.0, 1.0 + 1e-12), 20);
        assert_eq!(scale_for_range(2.0, 1.0), 0);
    }

    #[test]
    fn convert_to_dense_buckets() {
        // Cases are defined as: scale, source buckets, zero count, offset, counts.
        let cases: [(i32, Vec<(f64, f64)>, u64, i32, Vec<u64>); 4] = [
            (0, vec![(0.0, 5.0), (2.0, 10.0), (4.0, 15.0)], 5, 0, vec![10, 15]),
            (3, vec![(0.0, 5.0), (1.54221, 10.0), (1.83401, 15.0)], 5, 4, vec![10, 0, 15]),
            (
                2,
                vec![(0.0, 5.0), (464.2, 10.0), (599.5, 15.0), (1000.0, 20.0)],
                5,
                34,
                vec![10, 0, 15, 0, 0, 20],
            ),
            // Both boundaries round to the same index at this scale.
            (0, vec![(2.0, 1.0), (2.1, 2.0), (f64::INFINITY, 7.0)], 0, 0, vec![3]),
        ];

        for (scale, source, zero_count, offset, counts) in cases {
            let state = convert_buckets(scale, source);
            assert_eq!(state.scale, scale);
            assert_eq!(state.zero_count, zero_count);
            assert_eq!(state.positive.offset, offset);
            assert_eq!(state.positive.counts, counts);
        }
    }

    #[test]
    fn convert_out_of_order_buckets() {
        let state = convert_buckets(0, vec![(8.0, 1.0), (2.0, 4.0)]);
        assert_eq!(state.positive.offset, 0);
        assert_eq!(state.positive.counts, vec![4, 0, 1]);
    }

    #[test]
    fn convert_far_apart_buckets_stays_bounded() {
        // Cases are defined as: scale, source buckets, expected scale.
        let cases: [(i32, Vec<(f64, f64)>, i32); 4] = [
            (20, vec![(1.0e-300, 1.0), (1.0e300, 1.0)], 3),
            (20, vec![(1.0e300, 1.0), (1.0e-300, 1.0)], 3),
            (MAX_SCALE, vec![(f64::MIN_POSITIVE, 1.0), (f64::MAX, 1.0), (1.0, 3.0)], 3),
            (i32::MAX, vec![(1.0e-300, 1.0), (1.0e300, 1.0)], 3),
        ];

        for (scale, source, expected_scale) in cases {
            let total = source.iter().map(|(_, count)| *count as u64).sum::<u64>();
            let state = convert_buckets(scale, source);

            assert_eq!(state.scale, expected_scale, "scale: {scale}");
            assert!(state.positive.counts.len() <= MAXIMUM_MAX_SIZE as usize);
            assert_eq!(state.positive.total(), total);
        }

        // Out of range scales are clamped before any bucket is placed.
        assert_eq!(convert_buckets(-40, vec![(2.0, 1.0)]).scale, MIN_SCALE);
        assert_eq!(convert_buckets(40, vec![(2.0, 1.0)]).scale, MAX_SCALE);
    }

    #[test]
    fn estimate_sum_from_ranges() {
        let bucket = |start: f64, end: f64, count: f64| (BucketRange { start, end }, count);

        let cases = [
            (vec![bucket(0.0, 1.0, 5.0), bucket(1.0, 2.0, 10.0), bucket(2.0, 4.0, 15.0)], 62.5),
            (vec![bucket(0.0, 0.0, 5.0), bucket(0.0, 1.0, 10.0), bucket(1.0, 2.0, 15.0)], 27.5),
            (
                vec![
                    bucket(0.0, 1.0, 5.0),
                    bucket(1.0, 2.0, 10.0),
                    bucket(2.0, 4.0, 15.0),
                    bucket(4.0, f64::INFINITY, 20.0),
                ],
                62.5,
            ),
            (vec![bucket(1.0, 2.0, 5.0), bucket(4.0, 8.0, 10.0)], 67.5),
            (vec![], 0.0),
        ];

        for (buckets, expected) in cases {
            assert_relative_eq!(estimate_sum(buckets), expected);
        }
    }
}
