//! Backoff schedules and the lock scopes operations escalate into.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: delay = initial * multiplier^(attempt - 1), capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that is randomised, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let nanos = (self.initial.as_nanos() as f64 * factor).min(self.max.as_nanos() as f64);
        Duration::from_nanos(nanos as u64)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Scales the delay down by a random share of at most `jitter`.
    pub fn jittered_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = 1.0 - rng.gen_range(0.0..=jitter);
        delay.mul_f64(scale)
    }
}

/// Bounds on retrying transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub budget: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            budget: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Advisory lock an operation takes when it escalates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Main,
    Statistics,
    Named(String),
}

impl LockScope {
    pub fn name(&self) -> &str {
        match self {
            LockScope::Main => "docqueue.main",
            LockScope::Statistics => "docqueue.statistics",
            LockScope::Named(name) => name,
        }
    }
}
