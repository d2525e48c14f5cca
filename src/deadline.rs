use std::time::{Duration, Instant};

/// A monotonic end time for one exchange.
///
/// Every suspension point of an exchange (header reads, dials, body I/O,
/// semaphore acquisition) is bounded by [`Deadline::budget`], never by a
/// bare fixed timeout, so a slow step early in the exchange eats into the
/// time left for later steps instead of stacking on top of them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    end: Instant,
}

impl Deadline {
    pub(crate) fn new(total: Duration) -> Self {
        Self {
            end: Instant::now() + total,
        }
    }

    /// Time remaining, floored at zero. Never negative.
    pub(crate) fn left(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }

    /// The smaller of the time left and an operation-specific cap.
    pub(crate) fn budget(&self, op_cap: Duration) -> Duration {
        self.left().min(op_cap)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.left().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_shrinks_toward_zero() {
        let d = Deadline::new(Duration::from_millis(50));
        assert!(d.left() <= Duration::from_millis(50));
        assert!(!d.is_expired());
    }

    #[test]
    fn budget_is_the_smaller_of_left_and_cap() {
        let d = Deadline::new(Duration::from_secs(10));
        assert_eq!(d.budget(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn expired_deadline_has_zero_left() {
        let d = Deadline::new(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.is_expired());
        assert_eq!(d.left(), Duration::ZERO);
    }
}
