//! Linear gain ramps
//!
//! A ramp is defined on the engine clock (seconds). Before `start` it reports
//! `from`, after `start + duration` it reports `to`, and in between the value
//! moves at a constant rate.

use serde::{Deserialize, Serialize};

/// Scheduled linear automation from one gain value to another
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearRamp {
    pub from: f32,
    pub to: f32,
    /// Clock time the ramp begins (seconds)
    pub start: f64,
    /// Ramp length (seconds)
    pub duration: f64,
}

impl LinearRamp {
    pub fn new(from: f32, to: f32, start: f64, duration: f64) -> Self {
        Self {
            from,
            to,
            start,
            duration: duration.max(0.0),
        }
    }

    /// Clock time the ramp reaches `to`
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Normalized progress through the ramp (0.0 to 1.0)
    pub fn progress(&self, now: f64) -> f32 {
        if self.duration <= 0.0 {
            return 1.0;
        }
        (((now - self.start) / self.duration).clamp(0.0, 1.0)) as f32
    }

    /// Gain value at clock time `now`
    pub fn value_at(&self, now: f64) -> f32 {
        let t = self.progress(now);
        self.from + (self.to - self.from) * t
    }

    pub fn is_complete(&self, now: f64) -> bool {
        now >= self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_linear_ramp_values() {
        let ramp = LinearRamp::new(1.0, 0.0, 10.0, 2.0);

        assert!((ramp.value_at(9.0) - 1.0).abs() < EPSILON);
        assert!((ramp.value_at(10.0) - 1.0).abs() < EPSILON);
        assert!((ramp.value_at(10.5) - 0.75).abs() < EPSILON);
        assert!((ramp.value_at(11.0) - 0.5).abs() < EPSILON);
        assert!((ramp.value_at(12.0) - 0.0).abs() < EPSILON);
        assert!((ramp.value_at(20.0) - 0.0).abs() < EPSILON);
    }

    #[test]
    fn test_zero_duration_ramp_is_immediate() {
        let ramp = LinearRamp::new(0.2, 0.9, 5.0, 0.0);
        assert!(ramp.is_complete(5.0));
        assert!((ramp.value_at(5.0) - 0.9).abs() < EPSILON);
    }

    #[test]
    fn test_negative_duration_clamped() {
        let ramp = LinearRamp::new(0.0, 1.0, 0.0, -4.0);
        assert_eq!(ramp.duration, 0.0);
        assert_eq!(ramp.end(), 0.0);
    }
}
