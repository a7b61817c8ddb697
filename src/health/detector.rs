//! Two-threshold hysteresis over a stream of probe results.

/// Turns pass/fail observations into edge-triggered health transitions.
///
/// Failures push a counter up to `threshold` and passes pull it back to 0.
/// The container turns unhealthy when the counter reaches `threshold` and
/// healthy again only once it drains to 0; anything in between keeps the
/// previous state. Starts unhealthy with the counter at 0, so the first
/// pass reports healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthDetector {
    current: u32,
    threshold: u32,
    healthy: bool,
}

impl HealthDetector {
    /// `threshold` is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            current: 0,
            threshold: threshold.max(1),
            healthy: false,
        }
    }

    /// Record one probe. Returns the new state only when it flipped.
    pub fn observe(&mut self, passed: bool) -> Option<bool> {
        if passed {
            self.current = self.current.saturating_sub(1);
        } else if self.current < self.threshold {
            self.current += 1;
        }

        let was_healthy = self.healthy;
        if self.current == self.threshold {
            self.healthy = false;
        } else if self.current == 0 {
            self.healthy = true;
        }

        (self.healthy != was_healthy).then_some(self.healthy)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Consecutive-failure counter, in `[0, threshold]`.
    pub fn failures(&self) -> u32 {
        self.current
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for HealthDetector {
    fn default() -> Self {
        Self::new(5)
    }
}
