//! The retry schedule for waiting on a new Tor process's control port.

use std::time::{Duration, Instant};

use crate::config::BackoffConfig;

/// A doubling delay schedule with a cap and an overall deadline.
///
/// The first delay is the configured initial delay; each later delay is
/// twice the one before, but never more than the configured maximum.
#[derive(Clone, Debug)]
pub struct ControlPortBackoff {
    /// The next delay to hand out.
    next: Duration,
    /// The largest delay we hand out.
    max: Duration,
    /// When we started waiting.
    started: Instant,
    /// How long to wait in total.
    give_up_after: Duration,
}

impl ControlPortBackoff {
    /// Return a new schedule, counting from `started`.
    pub fn new(config: &BackoffConfig, started: Instant) -> Self {
        ControlPortBackoff {
            next: config.initial_delay(),
            max: config.max_delay(),
            started,
            give_up_after: config.give_up_after(),
        }
    }

    /// Return the next delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.next.saturating_mul(2), self.max);
        delay
    }

    /// Return how long we've been waiting, as of `now`.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Return true if we should give up, as of `now`.
    pub fn is_exhausted(&self, now: Instant) -> bool {
        self.elapsed(now) > self.give_up_after
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use itertools::Itertools as _;

    #[test]
    fn schedule() {
        let now = Instant::now();
        let mut b = ControlPortBackoff::new(&BackoffConfig::default(), now);
        let delays: Vec<_> = (0..7).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![25, 50, 100, 200, 400, 500, 500]);
    }

    #[test]
    fn monotonic_and_bounded() {
        let mut bld = BackoffConfig::builder();
        bld.initial_delay(Duration::from_millis(7))
            .max_delay(Duration::from_millis(1000));
        let cfg = bld.build().unwrap();
        let mut b = ControlPortBackoff::new(&cfg, Instant::now());
        let delays: Vec<_> = (0..40).map(|_| b.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(7));
        assert!(delays.iter().tuple_windows().all(|(a, b)| a <= b));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        assert_eq!(delays.last(), Some(&Duration::from_millis(1000)));
    }

    #[test]
    fn deadline() {
        let start = Instant::now();
        let b = ControlPortBackoff::new(&BackoffConfig::default(), start);
        assert!(!b.is_exhausted(start));
        assert!(!b.is_exhausted(start + Duration::from_secs(30)));
        assert!(b.is_exhausted(start + Duration::from_millis(30_001)));
        assert_eq!(b.elapsed(start + Duration::from_secs(3)), Duration::from_secs(3));
    }
}
