use std::time::Duration;

use rand::Rng;

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// Source of the multiplicative jitter applied after the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// Uniform in `[0.8, 1.2]`.
    #[default]
    Random,
    Fixed(f64),
}

impl Jitter {
    fn sample(self) -> f64 {
        match self {
            Jitter::Random => rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH),
            Jitter::Fixed(factor) => factor,
        }
    }
}

/// Exponential backoff with jitter, capped at `max`.
///
/// The first delay is exactly `min`; delay `n` is
/// `min(max, min * 2^(n-1) * jitter)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: Jitter,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            jitter: Jitter::Random,
            attempts: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Records a failed attempt and returns the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts == 1 {
            return self.min.min(self.max);
        }
        let exponent = (self.attempts - 1).min(32) as i32;
        let scaled = self.min.as_nanos() as f64 * 2f64.powi(exponent) * self.jitter.sample();
        let capped = scaled.round().min(self.max.as_nanos() as f64);
        Duration::from_nanos(capped.max(0.0) as u64)
    }

    /// Failed attempts recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn delays_grow_and_cap_at_max() {
        for _ in 0..50 {
            let mut backoff = Backoff::new(ms(10), ms(100));
            let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
            assert_eq!(delays[0], ms(10));
            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "{delays:?}");
            assert_eq!(delays[4], ms(100));
        }
    }

    #[test]
    fn fixed_jitter_is_exact_doubling() {
        let mut backoff = Backoff::new(ms(10), ms(1_000)).with_jitter(Jitter::Fixed(1.0));
        let delays: Vec<Duration> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, vec![ms(10), ms(20), ms(40), ms(80)]);
    }

    #[test]
    fn reset_restarts_at_min() {
        let mut backoff = Backoff::new(ms(10), ms(100));
        for _ in 0..3 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), ms(10));
    }
}
