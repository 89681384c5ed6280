//! Authoritative in-memory zone set.
//!
//! Every mutation flips a dirty flag; the coordinator drains it with
//! [`ZoneStore::take_dirty`] and schedules a debounced persistence write.

use chrono::{DateTime, Utc};

use super::model::{Zone, ZoneId, ZonePatch, ZoneSpec, ZoneState};
use crate::core::error::ZoneError;

/// Ordered set of zones (insertion order).
#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: Vec<Zone>,
    dirty: bool,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with zones loaded from persistence.
    ///
    /// Zones are taken as-is (a corrupt entry is skipped later by the
    /// evaluator, not dropped here). Duplicate ids keep the first copy.
    pub fn restore(zones: Vec<Zone>) -> Self {
        let mut store = Self::new();
        for zone in zones {
            if store.get(zone.id).is_some() {
                log::warn!("Ignoring duplicate stored zone {}", zone.id);
                continue;
            }
            store.zones.push(zone);
        }
        store
    }

    /// Validate and insert a new zone.
    pub fn create(&mut self, spec: ZoneSpec, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        let zone = spec.into_zone(now)?;
        log::info!(
            "Created {:?} zone '{}' ({}) at {} r={}m",
            zone.kind,
            zone.name,
            zone.id,
            zone.center,
            zone.radius_m
        );
        self.zones.push(zone.clone());
        self.dirty = true;
        Ok(zone)
    }

    pub fn update(&mut self, id: ZoneId, patch: &ZonePatch, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        let zone = self.get_mut(id).ok_or(ZoneError::NotFound(id))?;
        if patch.is_empty() {
            return Ok(zone.clone());
        }
        let updated = patch.apply(zone, now)?;
        *zone = updated.clone();
        self.dirty = true;
        Ok(updated)
    }

    /// Remove a zone. Unknown ids are a no-op.
    pub fn delete(&mut self, id: ZoneId) -> Option<Zone> {
        let index = self.zones.iter().position(|z| z.id == id)?;
        let zone = self.zones.remove(index);
        self.dirty = true;
        Some(zone)
    }

    pub fn get(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    fn get_mut(&mut self, id: ZoneId) -> Option<&mut Zone> {
        self.zones.iter_mut().find(|z| z.id == id)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Copy of all zones in insertion order.
    pub fn snapshot(&self) -> Vec<Zone> {
        self.zones.clone()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Remove every zone whose expiry is before `now`, whatever its state.
    pub fn apply_expiry(&mut self, now: DateTime<Utc>) -> Vec<ZoneId> {
        let mut removed = Vec::new();
        self.zones.retain(|zone| {
            if zone.is_expired(now) {
                removed.push(zone.id);
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.dirty = true;
        }
        removed
    }

    /// Earliest pending expiry, if any zone has one.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.zones.iter().filter_map(|z| z.expires_at).min()
    }

    /// Armed -> Triggered. Returns false if the zone is missing or already triggered.
    pub fn mark_triggered(&mut self, id: ZoneId, now: DateTime<Utc>) -> bool {
        let Some(zone) = self.get_mut(id) else {
            return false;
        };
        if zone.state == ZoneState::Triggered {
            return false;
        }
        zone.state = ZoneState::Triggered;
        zone.last_triggered_at = Some(now);
        self.dirty = true;
        true
    }

    /// Triggered -> Armed. Returns false if the zone is missing or already armed.
    pub fn mark_reset(&mut self, id: ZoneId) -> bool {
        let Some(zone) = self.get_mut(id) else {
            return false;
        };
        if zone.state == ZoneState::Armed {
            return false;
        }
        zone.state = ZoneState::Armed;
        self.dirty = true;
        true
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Coordinate;
    use crate::core::zones::model::ZoneKind;
    use chrono::Duration;

    fn spec(name: &str) -> ZoneSpec {
        ZoneSpec::new(name, Coordinate::new(43.6532, -79.3832), 100.0)
    }

    #[test]
    fn test_create_and_snapshot_order() {
        let now = Utc::now();
        let mut store = ZoneStore::new();
        store.create(spec("A"), now).unwrap();
        store.create(spec("B"), now).unwrap();
        store.create(spec("C").one_time(), now).unwrap();

        let names: Vec<_> = store.snapshot().into_iter().map(|z| z.name).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(store.zones()[2].kind, ZoneKind::OneTime);
        assert!(store.take_dirty());
        assert!(!store.take_dirty());
    }

    #[test]
    fn test_invalid_spec_never_enters_store() {
        let mut store = ZoneStore::new();
        let mut bad = spec("Bad");
        bad.radius_m = 0.0;
        assert!(store.create(bad, Utc::now()).is_err());
        assert!(store.is_empty());
        assert!(!store.take_dirty());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut store = ZoneStore::new();
        assert!(store.delete(ZoneId::new()).is_none());
        assert!(!store.take_dirty());
    }

    #[test]
    fn test_apply_expiry_removes_regardless_of_state() {
        let now = Utc::now();
        let mut store = ZoneStore::new();
        let keep = store.create(spec("Keep"), now).unwrap();
        let a = store
            .create(spec("Expiring").expiring_at(now + Duration::seconds(5)), now)
            .unwrap();
        let b = store
            .create(spec("Triggered").expiring_at(now + Duration::seconds(5)), now)
            .unwrap();
        assert!(store.mark_triggered(b.id, now));
        store.take_dirty();

        // Not yet past the expiry
        assert!(store.apply_expiry(now + Duration::seconds(5)).is_empty());

        let removed = store.apply_expiry(now + Duration::seconds(6));
        assert_eq!(removed, vec![a.id, b.id]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.zones()[0].id, keep.id);
        assert!(store.take_dirty());
    }

    #[test]
    fn test_trigger_and_reset_transitions() {
        let now = Utc::now();
        let mut store = ZoneStore::new();
        let zone = store.create(spec("A"), now).unwrap();

        assert!(store.mark_triggered(zone.id, now));
        assert!(!store.mark_triggered(zone.id, now), "already triggered");
        assert_eq!(store.get(zone.id).unwrap().last_triggered_at, Some(now));

        assert!(store.mark_reset(zone.id));
        assert!(!store.mark_reset(zone.id), "already armed");
        assert!(store.get(zone.id).unwrap().is_armed());

        assert!(!store.mark_reset(ZoneId::new()));
    }

    #[test]
    fn test_update_zone() {
        let now = Utc::now();
        let mut store = ZoneStore::new();
        let zone = store.create(spec("A"), now).unwrap();
        store.take_dirty();

        let patch = ZonePatch {
            radius_m: Some(250.0),
            ..Default::default()
        };
        let updated = store.update(zone.id, &patch, now).unwrap();
        assert_eq!(updated.radius_m, 250.0);
        assert!(store.take_dirty());

        let missing = ZoneId::new();
        assert_eq!(
            store.update(missing, &patch, now),
            Err(ZoneError::NotFound(missing))
        );
    }

    #[test]
    fn test_restore_skips_duplicates() {
        let now = Utc::now();
        let zone = spec("A").into_zone(now).unwrap();
        let store = ZoneStore::restore(vec![zone.clone(), zone.clone()]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.next_expiry(), None);
    }
}
