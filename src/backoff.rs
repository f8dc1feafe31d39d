//! Backoff strategies for retry policies

use std::time::Duration;

/// Backoff strategy for retries.
///
/// `Linear`, `Exponential`, and `Fibonacci` all accept an optional cap; `delay()` never
/// exceeds it once a cap is set.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// No delay between attempts at all.
    Immediate,
    /// Fixed delay between retries (formerly `Constant`).
    Fixed { delay: Duration },
    /// Linearly increasing delay: `base * attempt`.
    Linear { base: Duration, cap: Option<Duration> },
    /// Exponentially increasing delay: `base * multiplier^(attempt-1)`.
    Exponential { base: Duration, multiplier: f64, cap: Option<Duration> },
    /// Delay follows the Fibonacci sequence scaled by `base`.
    Fibonacci { base: Duration, cap: Option<Duration> },
}

impl Backoff {
    /// No backoff at all; every attempt fires immediately.
    pub fn immediate() -> Self {
        Backoff::Immediate
    }

    /// Create a constant (fixed) backoff strategy.
    pub fn constant(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    /// Alias for [`Backoff::constant`] matching the generalized naming.
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    /// Create a linear backoff strategy with no cap.
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, cap: None }
    }

    /// Create an exponential backoff strategy with the default doubling multiplier and no cap.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2.0, cap: None }
    }

    /// Create an exponential backoff strategy with a custom multiplier.
    pub fn exponential_with_multiplier(base: Duration, multiplier: f64) -> Self {
        Backoff::Exponential { base, multiplier, cap: None }
    }

    /// Create a Fibonacci backoff strategy with no cap.
    pub fn fibonacci(base: Duration) -> Self {
        Backoff::Fibonacci { base, cap: None }
    }

    /// Set a maximum delay. No-op for `Immediate`/`Fixed`, which have nothing to cap.
    pub fn with_max(mut self, max: Duration) -> Self {
        match &mut self {
            Backoff::Linear { cap, .. } => *cap = Some(max),
            Backoff::Exponential { cap, .. } => *cap = Some(max),
            Backoff::Fibonacci { cap, .. } => *cap = Some(max),
            Backoff::Immediate | Backoff::Fixed { .. } => {}
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { base, cap } => {
                let raw = base
                    .checked_mul(attempt as u32)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                cap_at(raw, *cap)
            }
            Backoff::Exponential { base, multiplier, cap } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let scale = multiplier.max(0.0).powi(exponent);
                let raw_millis = (base.as_millis() as f64) * scale;
                let raw = if raw_millis.is_finite() && raw_millis >= 0.0 {
                    Duration::from_millis(raw_millis.min(u64::MAX as f64) as u64)
                } else {
                    Duration::from_secs(u64::MAX)
                };
                cap_at(raw, *cap)
            }
            Backoff::Fibonacci { base, cap } => {
                let fib = fibonacci(attempt.max(1));
                let raw = base
                    .checked_mul(fib)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                cap_at(raw, *cap)
            }
        }
    }
}

fn cap_at(delay: Duration, cap: Option<Duration>) -> Duration {
    match cap {
        Some(max) => delay.min(max),
        None => delay,
    }
}

/// 1-indexed Fibonacci (fib(1) = 1, fib(2) = 1, fib(3) = 2, ...), saturating on overflow.
fn fibonacci(n: usize) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_backoff_is_always_zero() {
        let backoff = Backoff::immediate();
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(50), Duration::ZERO);
    }

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn linear_backoff_respects_cap() {
        let backoff = Backoff::linear(Duration::from_millis(100)).with_max(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_with_custom_multiplier() {
        let backoff = Backoff::exponential_with_multiplier(Duration::from_millis(100), 1.5);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(150));
        assert_eq!(backoff.delay(3), Duration::from_millis(225));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }

    #[test]
    fn linear_backoff_handles_overflow() {
        let backoff = Backoff::linear(Duration::from_secs(u64::MAX / 2));
        let delay = backoff.delay(10);
        assert!(delay >= Duration::from_secs(u64::MAX / 2));
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let backoff = Backoff::fibonacci(Duration::from_millis(100));
        // fib: 1, 1, 2, 3, 5, 8
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(300));
        assert_eq!(backoff.delay(5), Duration::from_millis(500));
        assert_eq!(backoff.delay(6), Duration::from_millis(800));
    }

    #[test]
    fn fibonacci_backoff_respects_cap() {
        let backoff = Backoff::fibonacci(Duration::from_millis(100)).with_max(Duration::from_millis(300));
        assert_eq!(backoff.delay(6), Duration::from_millis(300));
    }

    #[test]
    fn with_max_is_noop_for_immediate_and_fixed() {
        let fixed = Backoff::constant(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(fixed.delay(1), Duration::from_secs(5));

        let immediate = Backoff::immediate().with_max(Duration::from_secs(1));
        assert_eq!(immediate.delay(1), Duration::ZERO);
    }

    #[test]
    fn linear_unaffected_without_cap() {
        let linear = Backoff::linear(Duration::from_secs(5));
        assert_eq!(linear.delay(2), Duration::from_secs(10));
    }
}
