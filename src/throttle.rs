use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

/// Minimum spacing between injections into one PTY. Failures back the
/// delay off along a fixed ladder; three consecutive successes halve it
/// again, floored at the base delay.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleState {
    delay: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

const BASE_DELAY: Duration = Duration::from_millis(100);

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            delay: BASE_DELAY,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

impl ThrottleState {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= 3 {
                    self.consecutive_successes = 0;
                    self.delay = Duration::from_millis(self.delay.as_millis() as u64 / 2)
                        .max(BASE_DELAY);
                }
            }
            DeliveryOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.delay = match self.consecutive_failures {
                    1 => Duration::from_millis(100),
                    2 => Duration::from_millis(200),
                    3 => Duration::from_millis(500),
                    4 => Duration::from_millis(1_000),
                    5 => Duration::from_millis(2_000),
                    _ => Duration::from_millis(5_000),
                };
            }
        }
    }
}
