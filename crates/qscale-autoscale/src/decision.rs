//! Scaling decision: queue depth in, replica count out.

/// Replicas wanted for `queue_depth` items, clamped to `[min, max]`.
///
/// Saturates instead of overflowing on huge depths. A `scaling_factor` of
/// zero pins the result to `min`. Callers validate `min <= max`; if that
/// does not hold the result is `max`.
pub fn desired_replicas(queue_depth: u64, min: u32, max: u32, scaling_factor: u32) -> u32 {
    let raw = queue_depth.saturating_mul(u64::from(scaling_factor));
    let raw = u32::try_from(raw).unwrap_or(u32::MAX);
    raw.max(min).min(max)
}

/// What convergence has to do to go from `current` to `desired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Create this many instances.
    ScaleUp(u32),
    /// Signal this many instances to shut down.
    ScaleDown(u32),
    Steady,
}

impl ScaleAction {
    pub fn plan(current: u32, desired: u32) -> Self {
        match desired.cmp(&current) {
            std::cmp::Ordering::Greater => ScaleAction::ScaleUp(desired - current),
            std::cmp::Ordering::Less => ScaleAction::ScaleDown(current - desired),
            std::cmp::Ordering::Equal => ScaleAction::Steady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_bounds() {
        assert_eq!(desired_replicas(5, 1, 5, 1), 5);
        assert_eq!(desired_replicas(0, 1, 5, 1), 1);
        assert_eq!(desired_replicas(100, 1, 5, 2), 5);
        assert_eq!(desired_replicas(3, 1, 10, 2), 6);
    }

    #[test]
    fn result_always_within_bounds() {
        for depth in [0u64, 1, 7, 1_000, u64::MAX] {
            for factor in [0u32, 1, 3, u32::MAX] {
                let d = desired_replicas(depth, 2, 9, factor);
                assert!((2..=9).contains(&d), "depth={depth} factor={factor} -> {d}");
            }
        }
    }

    #[test]
    fn zero_factor_pins_to_min() {
        assert_eq!(desired_replicas(1_000, 3, 10, 0), 3);
    }

    #[test]
    fn zero_min_allows_scale_to_zero() {
        assert_eq!(desired_replicas(0, 0, 10, 1), 0);
    }

    #[test]
    fn plan_actions() {
        assert_eq!(ScaleAction::plan(2, 5), ScaleAction::ScaleUp(3));
        assert_eq!(ScaleAction::plan(5, 1), ScaleAction::ScaleDown(4));
        assert_eq!(ScaleAction::plan(3, 3), ScaleAction::Steady);
    }
}
