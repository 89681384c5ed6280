// Trigger evaluator - decides zone transitions for each location sample and
// owns the post-trigger lifecycle (cool-down reset, OneTime deletion).
// Every triggered zone re-arms after the cool-down; OneTime zones are then
// removed once the longer grace window runs out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::model::{DeleteReason, TriggerEvent, ZoneEvent};
use super::triggers::{self, ZoneCheck};
use crate::core::error::SampleError;
use crate::core::location::model::LocationSample;
use crate::core::timers::{Deadline, TimerKind, TimerRegistry};
use crate::core::zones::model::{ZoneId, ZoneKind};
use crate::core::zones::store::ZoneStore;

/// Evaluator tunables - persisted in settings.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Minimum seconds between two triggers of one zone (default: 10)
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Seconds a zone stays Triggered before re-arming (default: 3)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Seconds a triggered OneTime zone stays visible before removal (default: 8)
    #[serde(default = "default_one_time_grace_secs")]
    pub one_time_grace_secs: u64,
    /// Samples less accurate than this are treated as noise
    #[serde(default = "default_accuracy_ceiling_m")]
    pub accuracy_ceiling_m: f64,
    #[serde(default = "default_accuracy_buffer_ratio")]
    pub accuracy_buffer_ratio: f64,
    #[serde(default = "default_max_accuracy_buffer_m")]
    pub max_accuracy_buffer_m: f64,
    /// Buffer used when a sample carries no accuracy
    #[serde(default = "default_unknown_accuracy_buffer_m")]
    pub unknown_accuracy_buffer_m: f64,
}

fn default_debounce_secs() -> u64 {
    10
}

fn default_cooldown_secs() -> u64 {
    3
}

fn default_one_time_grace_secs() -> u64 {
    8
}

fn default_accuracy_ceiling_m() -> f64 {
    500.0
}

fn default_accuracy_buffer_ratio() -> f64 {
    0.5
}

fn default_max_accuracy_buffer_m() -> f64 {
    20.0
}

fn default_unknown_accuracy_buffer_m() -> f64 {
    10.0
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            cooldown_secs: default_cooldown_secs(),
            one_time_grace_secs: default_one_time_grace_secs(),
            accuracy_ceiling_m: default_accuracy_ceiling_m(),
            accuracy_buffer_ratio: default_accuracy_buffer_ratio(),
            max_accuracy_buffer_m: default_max_accuracy_buffer_m(),
            unknown_accuracy_buffer_m: default_unknown_accuracy_buffer_m(),
        }
    }
}

impl EvaluatorConfig {
    pub fn debounce(&self) -> Duration {
        secs(self.debounce_secs)
    }

    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }

    pub fn one_time_grace(&self) -> Duration {
        secs(self.one_time_grace_secs)
    }
}

// Windows longer than a year are clamped so deadline arithmetic cannot overflow
const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(MAX_WINDOW_SECS)).unwrap_or_default())
}

/// Trigger evaluator state
pub struct TriggerEvaluator {
    config: EvaluatorConfig,
}

impl TriggerEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Update the evaluator configuration (hot-reload friendly)
    pub fn update_config(&mut self, config: EvaluatorConfig) {
        self.config = config;
    }

    /// Evaluate one sample against every zone.
    ///
    /// A rejected sample returns `Err` and leaves the store untouched.
    /// Otherwise expiry runs first, then stuck Triggered zones are re-armed,
    /// then Armed zones are checked. A zone that fails validation is skipped
    /// on its own. Cool-down and deletion are scheduled on `timers`, never
    /// applied inline.
    pub fn evaluate(
        &self,
        sample: &LocationSample,
        store: &mut ZoneStore,
        timers: &mut TimerRegistry,
        now: DateTime<Utc>,
    ) -> Result<Vec<ZoneEvent>, SampleError> {
        triggers::validate_sample(sample, self.config.accuracy_ceiling_m)?;

        let mut events = expire(store, timers, now);

        let cooldown = self.config.cooldown();
        let mut overdue = Vec::new();
        let mut fired = Vec::new();

        for zone in store.zones() {
            if zone.is_triggered() {
                if triggers::cooldown_overdue(zone, now, cooldown) {
                    overdue.push(zone.id);
                }
                continue;
            }

            match triggers::check_zone(zone, sample, now, &self.config) {
                Ok(ZoneCheck::Enter {
                    distance_m,
                    effective_radius_m,
                }) => fired.push(TriggerEvent {
                    zone_id: zone.id,
                    zone_name: zone.name.clone(),
                    distance_m,
                    effective_radius_m,
                    sample_accuracy_m: sample.accuracy_m,
                    at: now,
                }),
                Ok(ZoneCheck::Debounced { distance_m }) => {
                    log::debug!(
                        "Zone '{}' inside at {:.1}m but still debounced",
                        zone.name,
                        distance_m
                    );
                }
                Ok(ZoneCheck::Outside { .. }) | Ok(ZoneCheck::Unknown) => {}
                Err(e) => {
                    log::warn!("Skipping zone '{}' ({}): {}", zone.name, zone.id, e);
                }
            }
        }

        for zone_id in overdue {
            if store.mark_reset(zone_id) {
                timers.cancel(zone_id, TimerKind::CooldownReset);
                log::info!("Re-armed zone {} stuck past its cool-down", zone_id);
                events.push(ZoneEvent::Reset { zone_id, at: now });
            }
        }

        for trigger in fired {
            let zone_id = trigger.zone_id;
            let Some(kind) = store.get(zone_id).map(|z| z.kind) else {
                continue;
            };
            if !store.mark_triggered(zone_id, now) {
                continue;
            }
            timers.schedule(zone_id, TimerKind::CooldownReset, now + cooldown);
            if kind == ZoneKind::OneTime {
                timers.schedule(zone_id, TimerKind::OneTimeDeletion, now + self.config.one_time_grace());
            }
            log::info!(
                "Zone '{}' triggered: {:.1}m from center (limit {:.1}m, accuracy {:?})",
                trigger.zone_name,
                trigger.distance_m,
                trigger.effective_radius_m,
                trigger.sample_accuracy_m
            );
            events.push(ZoneEvent::Triggered(trigger));
        }

        Ok(events)
    }

    /// Apply one elapsed deadline. A deadline for a zone that is gone, or no
    /// longer in the expected state, is a silent no-op.
    pub fn fire_timer(
        &self,
        deadline: &Deadline,
        store: &mut ZoneStore,
        timers: &mut TimerRegistry,
        now: DateTime<Utc>,
    ) -> Option<ZoneEvent> {
        let zone_id = deadline.zone_id;
        match deadline.kind {
            TimerKind::CooldownReset => {
                if !store.mark_reset(zone_id) {
                    return None;
                }
                log::info!("Zone {} re-armed after cool-down", zone_id);
                Some(ZoneEvent::Reset { zone_id, at: now })
            }
            TimerKind::OneTimeDeletion => {
                let zone = store.delete(zone_id)?;
                timers.cancel_zone(zone_id);
                log::info!("One-time zone '{}' ({}) completed and removed", zone.name, zone_id);
                Some(ZoneEvent::Deleted {
                    zone_id,
                    reason: DeleteReason::OneTimeCompleted,
                    at: now,
                })
            }
        }
    }

    /// Drain and apply every deadline due at `now`.
    pub fn fire_due(&self, store: &mut ZoneStore, timers: &mut TimerRegistry, now: DateTime<Utc>) -> Vec<ZoneEvent> {
        timers
            .take_due(now)
            .iter()
            .filter_map(|deadline| self.fire_timer(deadline, store, timers, now))
            .collect()
    }
}

/// Remove expired zones, cancel their timers and report them.
pub fn expire(store: &mut ZoneStore, timers: &mut TimerRegistry, now: DateTime<Utc>) -> Vec<ZoneEvent> {
    store
        .apply_expiry(now)
        .into_iter()
        .map(|zone_id| {
            timers.cancel_zone(zone_id);
            log::info!("Zone {} expired", zone_id);
            ZoneEvent::Expired { zone_id, at: now }
        })
        .collect()
}

/// Ids of zones referenced by `events`, in order, without repeats.
pub fn touched_zones(events: &[ZoneEvent]) -> Vec<ZoneId> {
    let mut ids: Vec<ZoneId> = Vec::new();
    for event in events {
        let id = event.zone_id();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Coordinate;
    use crate::core::zones::model::{ZoneSpec, ZoneState};

    const TORONTO: (f64, f64) = (43.6532, -79.3832);

    struct Harness {
        evaluator: TriggerEvaluator,
        store: ZoneStore,
        timers: TimerRegistry,
        start: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                evaluator: TriggerEvaluator::new(EvaluatorConfig::default()),
                store: ZoneStore::new(),
                timers: TimerRegistry::new(),
                start: Utc::now(),
            }
        }

        fn at(&self, secs: i64) -> DateTime<Utc> {
            self.start + Duration::seconds(secs)
        }

        fn add(&mut self, spec: ZoneSpec) -> ZoneId {
            self.store.create(spec, self.start).unwrap().id
        }

        fn sample(&mut self, secs: i64, lat: f64, lon: f64, accuracy: Option<f64>) -> Result<Vec<ZoneEvent>, SampleError> {
            let now = self.at(secs);
            let sample = LocationSample::new(Coordinate::new(lat, lon), accuracy, now);
            self.evaluator.evaluate(&sample, &mut self.store, &mut self.timers, now)
        }

        fn tick(&mut self, secs: i64) -> Vec<ZoneEvent> {
            let now = self.at(secs);
            self.evaluator.fire_due(&mut self.store, &mut self.timers, now)
        }
    }

    fn toronto_zone() -> ZoneSpec {
        ZoneSpec::new("Nathan Phillips Square", Coordinate::new(TORONTO.0, TORONTO.1), 100.0)
    }

    fn triggers(events: &[ZoneEvent]) -> usize {
        events.iter().filter(|e| e.is_trigger()).count()
    }

    fn resets(events: &[ZoneEvent]) -> usize {
        events.iter().filter(|e| matches!(e, ZoneEvent::Reset { .. })).count()
    }

    #[test]
    fn test_trigger_debounce_then_reset() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone());

        let first = h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap();
        assert_eq!(triggers(&first), 1);
        assert_eq!(first[0].zone_id(), id);
        assert_eq!(h.store.get(id).unwrap().state, ZoneState::Triggered);

        let second = h.sample(1, TORONTO.0, TORONTO.1, Some(10.0)).unwrap();
        assert!(second.is_empty(), "debounced");

        assert!(h.tick(2).is_empty());
        let reset = h.tick(3);
        assert_eq!(resets(&reset), 1);
        assert!(h.store.get(id).unwrap().is_armed());
        assert!(h.tick(4).is_empty(), "reset fires once");
    }

    #[test]
    fn test_no_retrigger_until_debounce_clears() {
        let mut h = Harness::new();
        h.add(toronto_zone());

        assert_eq!(triggers(&h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap()), 1);
        h.tick(3);
        // Armed again, but still inside the 10 s debounce window
        assert!(h.sample(5, TORONTO.0, TORONTO.1, Some(10.0)).unwrap().is_empty());
        assert!(h.sample(10, TORONTO.0, TORONTO.1, Some(10.0)).unwrap().is_empty());
        assert_eq!(triggers(&h.sample(11, TORONTO.0, TORONTO.1, Some(10.0)).unwrap()), 1);
    }

    #[test]
    fn test_identical_sample_twice_is_noop() {
        let mut h = Harness::new();
        h.add(toronto_zone());
        let first = h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap();
        let second = h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap();
        assert_eq!(triggers(&first), 1);
        assert!(second.is_empty());
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn test_inaccurate_sample_never_transitions() {
        let mut h = Harness::new();
        let a = h.add(toronto_zone());
        let b = h.add(toronto_zone().one_time());
        let c = h.add(ZoneSpec::new("Wide", Coordinate::new(TORONTO.0, TORONTO.1), 5_000.0));

        let result = h.sample(0, TORONTO.0, TORONTO.1, Some(600.0));
        assert!(matches!(result, Err(SampleError::AccuracyOverCeiling { .. })));
        for id in [a, b, c] {
            assert!(h.store.get(id).unwrap().is_armed());
        }
        assert!(h.timers.is_empty());
    }

    #[test]
    fn test_malformed_sample_skips_expiry() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone().expiring_at(h.at(1)));
        assert!(h.sample(5, f64::NAN, TORONTO.1, Some(5.0)).is_err());
        assert!(h.store.get(id).is_some(), "no state change on a rejected sample");
    }

    #[test]
    fn test_one_time_zone_removed_after_grace() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone().one_time());

        assert_eq!(triggers(&h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap()), 1);
        assert_eq!(resets(&h.tick(3)), 1);
        assert!(h.store.get(id).unwrap().is_armed());
        assert!(h.tick(7).is_empty());
        assert!(h.store.get(id).is_some(), "not removed before the grace window");

        let done = h.tick(8);
        assert_eq!(done.len(), 1);
        assert!(matches!(
            done[0],
            ZoneEvent::Deleted {
                reason: DeleteReason::OneTimeCompleted,
                ..
            }
        ));
        assert!(h.store.get(id).is_none());
    }

    #[test]
    fn test_rearmed_one_time_zone_stays_debounced_until_removed() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone().one_time());
        h.sample(0, TORONTO.0, TORONTO.1, Some(10.0)).unwrap();
        assert!(h.timers.is_pending(id, TimerKind::CooldownReset));
        assert!(h.timers.is_pending(id, TimerKind::OneTimeDeletion));

        h.tick(3);
        assert!(h.sample(5, TORONTO.0, TORONTO.1, Some(10.0)).unwrap().is_empty());
        assert_eq!(h.tick(8).len(), 1);
        assert!(h.sample(12, TORONTO.0, TORONTO.1, Some(10.0)).unwrap().is_empty());
    }

    #[test]
    fn test_expired_zone_removed_before_evaluation() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone().expiring_at(h.at(2)));

        let events = h.sample(3, TORONTO.0, TORONTO.1, Some(5.0)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ZoneEvent::Expired { .. }));
        assert_eq!(events[0].zone_id(), id);
        assert!(h.store.snapshot().is_empty());
    }

    #[test]
    fn test_expiry_cancels_pending_timers() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone().expiring_at(h.at(2)));
        assert_eq!(triggers(&h.sample(0, TORONTO.0, TORONTO.1, Some(5.0)).unwrap()), 1);
        assert!(h.timers.is_pending(id, TimerKind::CooldownReset));

        // Expires while Triggered; evaluate at t=2.5 via a far-away sample
        let now = h.at(2) + Duration::milliseconds(500);
        let far = LocationSample::new(Coordinate::new(45.0, -75.0), Some(5.0), now);
        let events = h.evaluator.evaluate(&far, &mut h.store, &mut h.timers, now).unwrap();
        assert!(matches!(events[0], ZoneEvent::Expired { .. }));
        assert!(h.timers.is_empty());
        assert!(h.tick(10).is_empty());
    }

    #[test]
    fn test_corrupt_zone_does_not_block_others() {
        let mut h = Harness::new();
        let good = h.add(toronto_zone());
        let mut broken = toronto_zone().into_zone(h.start).unwrap();
        broken.center = Coordinate::new(f64::NAN, 0.0);
        let mut zones = vec![broken];
        zones.extend(h.store.snapshot());
        h.store = ZoneStore::restore(zones);

        let events = h.sample(0, TORONTO.0, TORONTO.1, Some(5.0)).unwrap();
        assert_eq!(triggers(&events), 1);
        assert_eq!(events[0].zone_id(), good);
    }

    #[test]
    fn test_stuck_triggered_zone_is_rearmed_on_next_sample() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone());
        h.sample(0, TORONTO.0, TORONTO.1, Some(5.0)).unwrap();

        // Simulate a lost reset timer
        h.timers.clear();
        let events = h.sample(4, 45.0, -75.0, Some(5.0)).unwrap();
        assert_eq!(resets(&events), 1);
        assert!(h.store.get(id).unwrap().is_armed());
    }

    #[test]
    fn test_stale_timer_for_deleted_zone_is_noop() {
        let mut h = Harness::new();
        let id = h.add(toronto_zone());
        h.sample(0, TORONTO.0, TORONTO.1, Some(5.0)).unwrap();

        h.store.delete(id);
        let stale = Deadline {
            zone_id: id,
            kind: TimerKind::CooldownReset,
            due: h.at(3),
        };
        let now = h.at(3);
        assert!(h.evaluator.fire_timer(&stale, &mut h.store, &mut h.timers, now).is_none());
    }

    #[test]
    fn test_unknown_accuracy_uses_fixed_buffer() {
        let mut h = Harness::new();
        h.add(toronto_zone());
        // ~105.6 m north: inside 100 + 10 only because accuracy is unknown
        let events = h.sample(0, TORONTO.0 + 0.00095, TORONTO.1, None).unwrap();
        assert_eq!(triggers(&events), 1);
        if let ZoneEvent::Triggered(t) = &events[0] {
            assert_eq!(t.effective_radius_m, 110.0);
            assert_eq!(t.sample_accuracy_m, None);
        }
    }

    #[test]
    fn test_touched_zones_dedup() {
        let id = ZoneId::new();
        let now = Utc::now();
        let events = vec![
            ZoneEvent::Reset { zone_id: id, at: now },
            ZoneEvent::Expired { zone_id: id, at: now },
        ];
        assert_eq!(touched_zones(&events), vec![id]);
    }
}
