//! Hysteresis test for high-water-mark updates.

/// Whether `new` is a large enough increase over `current` to act on.
///
/// From zero any positive value counts. Otherwise the relative increase,
/// in percent, must be strictly above `threshold_percent`. Decreases never
/// count.
pub fn exceeds(current: f64, new: f64, threshold_percent: f64) -> bool {
    if current == 0.0 {
        return new > 0.0;
    }
    (new - current) / current * 100.0 > threshold_percent
}
