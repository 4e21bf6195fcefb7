//! Numeric helpers shared by the trace-rate tuning and the sweep estimates.

use num_traits::Float;

/// Blend a new sample into a running value. `weight` is the share kept from history, so a
/// weight of 0.8 moves the average 20% of the way towards the new sample.
pub fn weighted_average<T: Float>(current: T, new_value: T, weight: T) -> T {
    current * weight + new_value * (T::one() - weight)
}

/// Interpolate a value calibrated at concurrent levels 1, 8 and 10.
///
/// Between 1 and 8 the value moves linearly from `at_1` to `at_8`; above 8 it moves from
/// `at_8` towards `at_10`. Levels past 10 extrapolate along the upper segment. The
/// calibration points themselves are returned exactly.
pub fn interpolate_in_range(at_1: f32, at_8: f32, at_10: f32, level: usize) -> f32 {
    match level {
        1 => at_1,
        8 => at_8,
        10 => at_10,
        l if l > 8 => at_8 + ((at_10 - at_8) / 2.0) * (l as f32 - 8.0),
        l => at_1 + ((at_8 - at_1) / 7.0) * (l as f32 - 1.0),
    }
}

/// Multiply a byte count by a factor, truncating towards zero. Negative or NaN products give 0.
pub fn scale(bytes: usize, factor: f32) -> usize {
    let scaled = bytes as f64 * factor as f64;
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else if scaled >= usize::MAX as f64 {
        usize::MAX
    } else {
        scaled as usize
    }
}
