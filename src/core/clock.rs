use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Session clock: wall time derived from a monotonic instant.
///
/// Zone timestamps are UTC wall times (they are persisted), while timers run
/// on tokio's monotonic clock. Anchoring both at session start keeps them in
/// step, and lets paused-time tests drive wall time through `tokio::time::advance`.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.anchor_wall + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// The monotonic instant at which the session reaches `at`.
    /// Times before the anchor map to the anchor itself.
    pub fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.anchor_wall).to_std() {
            Ok(offset) => self.anchor + offset,
            Err(_) => self.anchor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let start = Utc::now();
        let clock = SessionClock::starting_at(start);
        assert_eq!(clock.now(), start);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at_round_trips() {
        let start = Utc::now();
        let clock = SessionClock::starting_at(start);
        let due = start + chrono::Duration::seconds(10);

        let instant = clock.instant_at(due);
        assert_eq!(instant.duration_since(Instant::now()), Duration::from_secs(10));
        assert_eq!(clock.instant_at(start - chrono::Duration::seconds(5)), Instant::now());
    }
}
