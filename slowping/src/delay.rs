use std::time::Duration;

/// Per-source exponential delay.
///
/// Starts at 1 ms. Each call to [`DelayPolicy::next_delay`] hands out the
/// current value and then doubles it, or resets to 1 ms once the value handed
/// out had reached the ceiling.
#[derive(Debug, Clone)]
pub struct DelayPolicy {
    delay_ms: u64,
    ceiling_ms: u64,
}

impl DelayPolicy {
    pub fn new(ceiling_ms: u64) -> Self {
        Self {
            delay_ms: 1,
            ceiling_ms: ceiling_ms.max(1),
        }
    }

    /// Take the delay for this request and advance the state for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay_ms;
        self.delay_ms = if current >= self.ceiling_ms {
            1
        } else {
            current.saturating_mul(2)
        };
        Duration::from_millis(current)
    }
}
