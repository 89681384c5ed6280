//! Per-zone deadlines for the post-trigger lifecycle.
//!
//! Deadlines are plain data: the coordinator sleeps until [`TimerRegistry::next_due`]
//! and drains [`TimerRegistry::take_due`]. Deleting a zone cancels its entries,
//! so nothing stale can fire against a removed id.

use chrono::{DateTime, Utc};

use super::zones::model::ZoneId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Return a Triggered zone to Armed
    CooldownReset,
    /// Remove a OneTime zone once its trigger has been visible long enough
    OneTimeDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub zone_id: ZoneId,
    pub kind: TimerKind,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    pending: Vec<Deadline>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a deadline, replacing any pending one of the same kind for the zone.
    pub fn schedule(&mut self, zone_id: ZoneId, kind: TimerKind, due: DateTime<Utc>) {
        self.cancel(zone_id, kind);
        self.pending.push(Deadline { zone_id, kind, due });
    }

    pub fn cancel(&mut self, zone_id: ZoneId, kind: TimerKind) -> bool {
        let before = self.pending.len();
        self.pending.retain(|d| !(d.zone_id == zone_id && d.kind == kind));
        self.pending.len() != before
    }

    /// Cancel everything pending for a zone. Returns how many were dropped.
    pub fn cancel_zone(&mut self, zone_id: ZoneId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|d| d.zone_id != zone_id);
        before - self.pending.len()
    }

    pub fn is_pending(&self, zone_id: ZoneId, kind: TimerKind) -> bool {
        self.pending.iter().any(|d| d.zone_id == zone_id && d.kind == kind)
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().map(|d| d.due).min()
    }

    /// Remove and return every deadline at or before `now`, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Deadline> {
        let mut due: Vec<Deadline> = self.pending.iter().filter(|d| d.due <= now).copied().collect();
        if due.is_empty() {
            return due;
        }
        self.pending.retain(|d| d.due > now);
        due.sort_by_key(|d| d.due);
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all deadlines (session teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_take_due_in_order() {
        let now = Utc::now();
        let (a, b) = (ZoneId::new(), ZoneId::new());
        let mut timers = TimerRegistry::new();
        timers.schedule(a, TimerKind::OneTimeDeletion, now + Duration::seconds(8));
        timers.schedule(b, TimerKind::CooldownReset, now + Duration::seconds(3));

        assert_eq!(timers.next_due(), Some(now + Duration::seconds(3)));
        assert!(timers.take_due(now + Duration::seconds(2)).is_empty());

        let due = timers.take_due(now + Duration::seconds(10));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].zone_id, b);
        assert_eq!(due[1].zone_id, a);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_schedule_replaces_same_kind() {
        let now = Utc::now();
        let id = ZoneId::new();
        let mut timers = TimerRegistry::new();
        timers.schedule(id, TimerKind::CooldownReset, now + Duration::seconds(3));
        timers.schedule(id, TimerKind::CooldownReset, now + Duration::seconds(5));
        timers.schedule(id, TimerKind::OneTimeDeletion, now + Duration::seconds(8));

        assert_eq!(timers.len(), 2);
        assert_eq!(timers.next_due(), Some(now + Duration::seconds(5)));
    }

    #[test]
    fn test_cancel_zone_drops_all_kinds() {
        let now = Utc::now();
        let (a, b) = (ZoneId::new(), ZoneId::new());
        let mut timers = TimerRegistry::new();
        timers.schedule(a, TimerKind::CooldownReset, now);
        timers.schedule(a, TimerKind::OneTimeDeletion, now);
        timers.schedule(b, TimerKind::CooldownReset, now);

        assert_eq!(timers.cancel_zone(a), 2);
        assert_eq!(timers.cancel_zone(a), 0);
        assert!(!timers.is_pending(a, TimerKind::CooldownReset));
        assert!(timers.is_pending(b, TimerKind::CooldownReset));

        timers.clear();
        assert_eq!(timers.next_due(), None);
    }
}
