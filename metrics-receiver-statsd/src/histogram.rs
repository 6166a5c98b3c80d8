//! Base-2 exponential histogram aggregation.
//!
//! Values are placed in buckets whose boundaries are consecutive powers of `base = 2^(2^-scale)`.
//! Bucket `i` covers `(base^i, base^(i+1)]`. The histogram starts at the finest supported scale and
//! merges neighbouring buckets, halving the resolution each time, whenever a new value would make
//! the positive or negative range span more than the configured maximum number of buckets.
use std::f64::consts::LOG2_E;

use crate::data::{Buckets, ExponentialHistogramPoint};

/// Finest supported scale.
pub const MAX_SCALE: i32 = 20;

/// Coarsest supported scale.
pub const MIN_SCALE: i32 = -10;

/// Default maximum number of buckets per range.
pub const DEFAULT_MAX_SIZE: u32 = 160;

/// Smallest accepted maximum number of buckets per range.
pub const MIN_MAX_SIZE: u32 = 2;

/// Largest accepted maximum number of buckets per range.
pub const MAXIMUM_MAX_SIZE: u32 = 16_384;

/// Splits a positive finite value into a mantissa in `[0.5, 1)` and a binary exponent, such that
/// `f = mantissa * 2^exponent`.
fn frexp(f: f64) -> (f64, i32) {
    if f == 0.0 || !f.is_finite() {
        return (f, 0);
    }

    let bits = f.to_bits();
    let sign_bit = bits & (1u64 << 63);
    let exp_bits = ((bits >> 52) & 0x7FF) as i32;
    let mut mantissa_bits = bits & 0x000F_FFFF_FFFF_FFFF;

    let exponent = if exp_bits == 0 {
        // Subnormal: shift the leading one into the implicit bit position.
        let shift = mantissa_bits.leading_zeros() - 11;
        mantissa_bits = (mantissa_bits << shift) & 0x000F_FFFF_FFFF_FFFF;
        -1021 - shift as i32
    } else {
        exp_bits - 1022
    };

    (f64::from_bits(sign_bit | (1022u64 << 52) | mantissa_bits), exponent)
}

/// Maps a positive finite value to its bucket index at `scale`.
///
/// Exact powers of the base belong to the bucket they close, so that boundaries are upper-inclusive.
fn map_to_index(value: f64, scale: i32) -> i32 {
    let (frac, exp) = frexp(value);
    let is_power_of_two = frac == 0.5;

    if scale <= 0 {
        let base2_exponent = if is_power_of_two { exp - 2 } else { exp - 1 };
        return base2_exponent >> -scale;
    }

    if is_power_of_two {
        return ((exp - 1) << scale) - 1;
    }

    let scale_factor = LOG2_E * f64::from(1u32 << scale);
    (value.ln() * scale_factor).floor() as i32
}

/// Returns how many times the resolution must be halved so that `low..=high` spans fewer than
/// `max_size` buckets.
pub(crate) fn scale_change(mut low: i32, mut high: i32, max_size: u32) -> u32 {
    let mut change = 0;
    while i64::from(high) - i64::from(low) >= i64::from(max_size) {
        low >>= 1;
        high >>= 1;
        change += 1;
    }
    change
}

/// Exponential histogram over positive and negative values with a shared scale.
#[derive(Clone, Debug)]
pub(crate) struct ExponentialHistogram {
    max_size: u32,
    scale: i32,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    zero_count: u64,
    positive: Buckets,
    negative: Buckets,
}

impl ExponentialHistogram {
    /// Creates a new `ExponentialHistogram` holding at most `max_size` buckets per range.
    ///
    /// `max_size` is expected to be validated by the caller; smaller values are raised to the
    /// minimum.
    pub(crate) fn new(max_size: u32) -> Self {
        Self {
            max_size: max_size.max(MIN_MAX_SIZE),
            scale: MAX_SCALE,
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            zero_count: 0,
            positive: Buckets::default(),
            negative: Buckets::default(),
        }
    }

    /// Records `value` as if it had been observed `increment` times.
    ///
    /// Non-finite values and zero increments are ignored.
    pub(crate) fn update(&mut self, value: f64, increment: u64) {
        if increment == 0 || !value.is_finite() {
            return;
        }

        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += increment;
        self.sum += value * increment as f64;

        if value == 0.0 {
            self.zero_count += increment;
        } else if value > 0.0 {
            self.record(value, increment, true);
        } else {
            self.record(-value, increment, false);
        }
    }

    fn record(&mut self, magnitude: f64, increment: u64, positive: bool) {
        let mut index = map_to_index(magnitude, self.scale);

        let buckets = if positive { &self.positive } else { &self.negative };
        if let Some(last) = buckets.last_index() {
            let low = index.min(buckets.offset);
            let high = index.max(last);
            let change = scale_change(low, high, self.max_size).min((self.scale - MIN_SCALE) as u32);

            if change > 0 {
                self.downscale(change);
                index = map_to_index(magnitude, self.scale);
            }
        }

        let buckets = if positive { &mut self.positive } else { &mut self.negative };
        buckets.increment(index, increment);
    }

    fn downscale(&mut self, change: u32) {
        self.positive.downscale(change);
        self.negative.downscale(change);
        self.scale -= change as i32;
    }

    /// Materializes the histogram as a data point covering `start..end`.
    pub(crate) fn to_point(&self, start_timestamp: u64, timestamp: u64) -> ExponentialHistogramPoint {
        ExponentialHistogramPoint {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            scale: self.scale,
            zero_count: self.zero_count,
            positive: self.positive.clone(),
            negative: self.negative.clone(),
            start_timestamp,
            timestamp,
        }
    }
}
