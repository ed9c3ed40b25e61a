//! Adaptive batch sizing shared by the database and file engines.
//!
//! The engines self-throttle: after each batch the next batch size is the
//! previous one scaled by a memory factor and a time factor, then clamped to
//! the configured bounds.

use crate::config::MemorySettings;
use crate::memory::{classify, Pressure};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Inclusive bounds for a batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBounds {
    pub min: usize,
    pub max: usize,
}

impl BatchBounds {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn clamp(&self, value: usize) -> usize {
        value.clamp(self.min, self.max)
    }
}

/// Largest growth or shrink applied by the time factor in one step.
const MAX_TIME_FACTOR: f64 = 2.0;
const MIN_TIME_FACTOR: f64 = 0.5;
const LOW_PRESSURE_GROWTH: f64 = 1.25;
const HIGH_PRESSURE_SHRINK: f64 = 0.5;

/// Factor derived from memory usage alone.
pub fn memory_factor(memory_ratio: f64, settings: &MemorySettings) -> f64 {
    match classify(memory_ratio, settings) {
        Pressure::High => HIGH_PRESSURE_SHRINK,
        Pressure::Low => LOW_PRESSURE_GROWTH,
        Pressure::Normal => 1.0,
    }
}

/// Factor derived from the ratio of target to actual batch time.
pub fn time_factor(target: Duration, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return MAX_TIME_FACTOR;
    }
    let ratio = target.as_secs_f64() / elapsed.as_secs_f64();
    if ratio.is_finite() {
        ratio.clamp(MIN_TIME_FACTOR, MAX_TIME_FACTOR)
    } else {
        1.0
    }
}

/// Compute the next batch size.
///
/// Under high memory pressure the time factor may only shrink the batch, so a
/// fast batch can never cancel a memory-driven halving.
pub fn next_batch_size(
    current: usize,
    bounds: BatchBounds,
    memory_ratio: f64,
    memory: &MemorySettings,
    target: Duration,
    elapsed: Duration,
) -> usize {
    let mem = memory_factor(memory_ratio, memory);
    let mut time = time_factor(target, elapsed);
    if mem < 1.0 {
        time = time.min(1.0);
    }
    let scaled = (current.max(1) as f64 * mem * time).round();
    let scaled = if scaled.is_finite() && scaled > 0.0 {
        scaled.min(usize::MAX as f64) as usize
    } else {
        bounds.min
    };
    bounds.clamp(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn memory() -> MemorySettings {
        MemorySettings::default()
    }

    #[test]
    fn test_high_pressure_halves() {
        let bounds = BatchBounds::new(10, 500);
        let next = next_batch_size(
            100,
            bounds,
            0.9,
            &memory(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        assert_eq!(next, 50);
    }

    #[test]
    fn test_high_pressure_ignores_fast_batches() {
        let bounds = BatchBounds::new(10, 500);
        let next = next_batch_size(
            100,
            bounds,
            0.9,
            &memory(),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(next, 50);
    }

    #[test]
    fn test_low_pressure_fast_batch_grows() {
        let bounds = BatchBounds::new(10, 500);
        let next = next_batch_size(
            100,
            bounds,
            0.1,
            &memory(),
            Duration::from_secs(4),
            Duration::from_secs(2),
        );
        assert_eq!(next, 250);
    }

    #[test]
    fn test_slow_batch_shrinks() {
        let bounds = BatchBounds::new(10, 500);
        let next = next_batch_size(
            100,
            bounds,
            0.6,
            &memory(),
            Duration::from_secs(2),
            Duration::from_secs(8),
        );
        assert_eq!(next, 50);
    }

    #[test]
    fn test_bounds_normalise() {
        let bounds = BatchBounds::new(0, 0);
        assert_eq!(bounds, BatchBounds { min: 1, max: 1 });
        let bounds = BatchBounds::new(20, 5);
        assert_eq!(bounds.clamp(1), 20);
        assert_eq!(bounds.clamp(100), 20);
    }

    proptest! {
        #[test]
        fn batch_size_never_leaves_bounds(
            min in 1usize..1_000,
            span in 0usize..10_000,
            start in 0usize..50_000,
            steps in proptest::collection::vec((0.0f64..2.0, 0u64..120_000), 1..40),
        ) {
            let bounds = BatchBounds::new(min, min + span);
            let mut size = start;
            for (ratio, elapsed_ms) in steps {
                size = next_batch_size(
                    size,
                    bounds,
                    ratio,
                    &memory(),
                    Duration::from_secs(5),
                    Duration::from_millis(elapsed_ms),
                );
                prop_assert!(size >= bounds.min && size <= bounds.max);
            }
        }
    }
}
