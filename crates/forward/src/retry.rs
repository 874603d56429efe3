use std::time::Duration;

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// `initial * factor^(attempt-1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

/// How a session recovers from a failed cycle.
///
/// Attempts count consecutive failures; a session that reaches the
/// listening state starts counting from zero again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(60),
                factor: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max,
                factor: 2.0,
            },
        }
    }

    /// Whether the `attempt`-th consecutive retry (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay to wait before the `attempt`-th consecutive retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                if exponent == 0 {
                    return initial.min(max);
                }
                let scaled = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}
