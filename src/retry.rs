use std::time::Duration;

use crate::models::DeliveryOutcome;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total sends allowed per channel, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) attempt failed transiently.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Delivered,
    RetryAfter(Duration),
    Exhausted,
}

/// Per-channel delivery bookkeeping: attempt count and the next delay.
#[derive(Debug, Clone)]
pub struct ChannelRetry {
    policy: RetryPolicy,
    attempts: u32,
    done: bool,
}

impl ChannelRetry {
    #[cfg(test)]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::resume(policy, 0)
    }

    /// Continue a channel that already used `attempts` sends.
    pub fn resume(policy: RetryPolicy, attempts: u32) -> Self {
        let done = attempts >= policy.max_attempts;
        Self {
            policy,
            attempts,
            done,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Number of the attempt about to be made, or `None` once the channel is finished.
    pub fn next_attempt(&self) -> Option<u32> {
        (!self.done).then_some(self.attempts + 1)
    }

    pub fn record(&mut self, outcome: DeliveryOutcome) -> RetryStep {
        self.attempts += 1;
        match outcome {
            DeliveryOutcome::Success => {
                self.done = true;
                RetryStep::Delivered
            }
            DeliveryOutcome::PermanentFailure => {
                self.done = true;
                RetryStep::Exhausted
            }
            DeliveryOutcome::TransientFailure if self.attempts >= self.policy.max_attempts => {
                self.done = true;
                RetryStep::Exhausted
            }
            DeliveryOutcome::TransientFailure => {
                RetryStep::RetryAfter(self.policy.delay_after(self.attempts))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(700),
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let policy = policy(10);
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_after(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 700, 700]);
    }

    #[test]
    fn transient_failures_exhaust_at_the_cap() {
        let mut retry = ChannelRetry::new(policy(3));
        assert_eq!(retry.next_attempt(), Some(1));
        assert_eq!(
            retry.record(DeliveryOutcome::TransientFailure),
            RetryStep::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            retry.record(DeliveryOutcome::TransientFailure),
            RetryStep::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            retry.record(DeliveryOutcome::TransientFailure),
            RetryStep::Exhausted
        );
        assert_eq!(retry.next_attempt(), None);
        assert_eq!(retry.attempts(), 3);
    }

    #[test]
    fn permanent_failure_stops_immediately() {
        let mut retry = ChannelRetry::new(policy(5));
        assert_eq!(
            retry.record(DeliveryOutcome::PermanentFailure),
            RetryStep::Exhausted
        );
        assert_eq!(retry.next_attempt(), None);
    }

    #[test]
    fn success_after_a_retry() {
        let mut retry = ChannelRetry::new(policy(3));
        retry.record(DeliveryOutcome::TransientFailure);
        assert_eq!(retry.next_attempt(), Some(2));
        assert_eq!(retry.record(DeliveryOutcome::Success), RetryStep::Delivered);
        assert_eq!(retry.next_attempt(), None);
    }

    #[test]
    fn resumed_channel_keeps_its_budget() {
        let retry = ChannelRetry::resume(policy(3), 2);
        assert_eq!(retry.next_attempt(), Some(3));
        assert_eq!(ChannelRetry::resume(policy(3), 3).next_attempt(), None);
    }
}
