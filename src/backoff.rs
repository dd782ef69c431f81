//! Exponential reconnect backoff, shared by the hub and cloud session
//! managers: a configurable start/cap doubling schedule plus a hard
//! attempt ceiling after which the session gives up until an external
//! restart.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempt: u32,
    start_ms: u64,
    cap_ms: u64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(start_ms: u64, cap_ms: u64, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            start_ms,
            cap_ms,
            max_attempts,
        }
    }

    /// Attempts made so far within the current disconnected span.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `true` once `max_attempts` consecutive failures have been recorded
    /// and no further automatic connect should be scheduled.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Resets the attempt counter. Called on every successful authentication.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay to sleep before the *next* attempt, and records that an
    /// attempt is about to be made.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        let delay_ms = self.start_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        self.attempt += 1;
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_schedule_doubles_then_caps_then_gives_up() {
        // 1000, 2000, 4000, 8000, 16000, 30000 x5, then give up.
        let mut b = Backoff::new(1_000, 30_000, 10);
        let expected_ms = [1_000u64, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000, 30_000];
        for expected in expected_ms {
            assert!(!b.exhausted());
            assert_eq!(b.next_delay().as_millis() as u64, expected);
        }
        assert!(b.exhausted());
    }

    #[test]
    fn cloud_schedule_caps_at_60s_with_10_attempts() {
        let mut b = Backoff::new(1_000, 60_000, 10);
        for _ in 0..10 {
            b.next_delay();
        }
        assert!(b.exhausted());
    }

    #[test]
    fn reset_allows_a_fresh_run_of_attempts() {
        let mut b = Backoff::new(1_000, 30_000, 2);
        b.next_delay();
        b.next_delay();
        assert!(b.exhausted());
        b.reset();
        assert!(!b.exhausted());
        assert_eq!(b.next_delay().as_millis(), 1_000);
    }
}
