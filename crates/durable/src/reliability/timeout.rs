//! Deadline arithmetic for step and transaction timeouts
//!
//! Deadlines are wall-clock instants so they survive a restart: a transaction
//! resumed from its checkpoint recomputes them from the persisted
//! `started_at` / `last_attempt_at` timestamps.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::duration_serde::to_chrono;

/// Point in time after which a step or transaction is considered timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: DateTime<Utc>,
}

impl Deadline {
    /// Deadline `timeout` after `started_at`
    pub fn after(started_at: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            at: started_at + to_chrono(timeout),
        }
    }

    /// Deadline at an absolute instant
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    /// The instant of this deadline
    pub fn instant(&self) -> DateTime<Utc> {
        self.at
    }

    /// Time left until the deadline, zero once it has passed
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time left until the deadline, measured from the current time
    pub fn remaining(&self) -> Duration {
        self.remaining_at(Utc::now())
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.at
    }

    /// Earliest of two optional deadlines
    pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

/// Sleep until the deadline, or forever when there is none
pub(crate) async fn sleep_until(deadline: Option<Deadline>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline.remaining()).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_before_and_after() {
        let start = Utc::now();
        let deadline = Deadline::after(start, Duration::from_secs(10));

        assert_eq!(deadline.remaining_at(start), Duration::from_secs(10));
        assert!(!deadline.is_expired_at(start));

        let later = start + chrono::Duration::seconds(11);
        assert_eq!(deadline.remaining_at(later), Duration::ZERO);
        assert!(deadline.is_expired_at(later));
    }

    #[test]
    fn test_earliest() {
        let now = Utc::now();
        let near = Deadline::after(now, Duration::from_secs(1));
        let far = Deadline::after(now, Duration::from_secs(5));

        assert_eq!(Deadline::earliest(Some(far), Some(near)), Some(near));
        assert_eq!(Deadline::earliest(None, Some(far)), Some(far));
        assert_eq!(Deadline::earliest(Some(near), None), Some(near));
        assert_eq!(Deadline::earliest(None, None), None);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_returns() {
        let deadline = Deadline::at(Utc::now() - chrono::Duration::seconds(1));
        tokio::time::timeout(Duration::from_millis(100), sleep_until(Some(deadline)))
            .await
            .unwrap();
    }
}
