//! Zone (geofence) definitions and their lifecycle fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::ZoneError;
use crate::core::geo::Coordinate;

/// Opaque zone identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(Uuid);

impl ZoneId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ZoneId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Whether a zone survives its own trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ZoneKind {
    /// Deleted after the post-trigger grace window
    OneTime,
    /// Re-arms after the cool-down and stays until deleted or expired
    #[default]
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ZoneState {
    #[default]
    Armed,
    Triggered,
}

/// A named circular region monitored for entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub center: Coordinate,
    pub radius_m: f64,
    pub kind: ZoneKind,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: ZoneState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Zone {
    /// Check the geometry fields. Zones restored from storage skip
    /// [`ZoneSpec::validate`], so the evaluator re-checks them here.
    pub fn validate(&self) -> Result<(), ZoneError> {
        check_geometry(&self.center, self.radius_m)
    }

    pub fn is_armed(&self) -> bool {
        self.state == ZoneState::Armed
    }

    pub fn is_triggered(&self) -> bool {
        self.state == ZoneState::Triggered
    }

    /// Expired strictly after `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// User-supplied definition of a new zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub name: String,
    pub center: Coordinate,
    pub radius_m: f64,
    #[serde(default)]
    pub kind: ZoneKind,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ZoneSpec {
    /// A persistent, non-expiring zone.
    pub fn new(name: impl Into<String>, center: Coordinate, radius_m: f64) -> Self {
        Self {
            name: name.into(),
            center,
            radius_m,
            kind: ZoneKind::Persistent,
            expires_at: None,
        }
    }

    pub fn one_time(mut self) -> Self {
        self.kind = ZoneKind::OneTime;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ZoneError> {
        if self.name.trim().is_empty() {
            return Err(ZoneError::EmptyName);
        }
        check_geometry(&self.center, self.radius_m)?;
        if self.expires_at.is_some_and(|at| at <= now) {
            return Err(ZoneError::InvalidExpiry);
        }
        Ok(())
    }

    /// Build the zone, assigning its id and creation time.
    pub fn into_zone(self, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        self.validate(now)?;
        Ok(Zone {
            id: ZoneId::new(),
            name: self.name.trim().to_string(),
            center: self.center,
            radius_m: self.radius_m,
            kind: self.kind,
            expires_at: self.expires_at,
            state: ZoneState::Armed,
            created_at: now,
            last_triggered_at: None,
        })
    }
}

/// Partial edit of an existing zone. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZonePatch {
    pub name: Option<String>,
    pub center: Option<Coordinate>,
    pub radius_m: Option<f64>,
    /// `Some(None)` clears the expiry
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl ZonePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.center.is_none() && self.radius_m.is_none() && self.expires_at.is_none()
    }

    /// Apply onto a copy of `zone`, validating the result as a fresh spec.
    pub fn apply(&self, zone: &Zone, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        let spec = ZoneSpec {
            name: self.name.clone().unwrap_or_else(|| zone.name.clone()),
            center: self.center.unwrap_or(zone.center),
            radius_m: self.radius_m.unwrap_or(zone.radius_m),
            kind: zone.kind,
            expires_at: self.expires_at.unwrap_or(zone.expires_at),
        };
        spec.validate(now)?;

        let mut updated = zone.clone();
        updated.name = spec.name.trim().to_string();
        updated.center = spec.center;
        updated.radius_m = spec.radius_m;
        updated.expires_at = spec.expires_at;
        Ok(updated)
    }
}

fn check_geometry(center: &Coordinate, radius_m: f64) -> Result<(), ZoneError> {
    if !center.is_valid() {
        return Err(ZoneError::InvalidCenter {
            lat: center.lat,
            lon: center.lon,
        });
    }
    if !(radius_m.is_finite() && radius_m > 0.0) {
        return Err(ZoneError::InvalidRadius(radius_m));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spec() -> ZoneSpec {
        ZoneSpec::new("Union Station", Coordinate::new(43.6453, -79.3806), 150.0)
    }

    #[test]
    fn test_into_zone_assigns_lifecycle_fields() {
        let now = Utc::now();
        let zone = spec().into_zone(now).unwrap();
        assert_eq!(zone.state, ZoneState::Armed);
        assert_eq!(zone.created_at, now);
        assert_eq!(zone.kind, ZoneKind::Persistent);
        assert!(zone.last_triggered_at.is_none());
    }

    #[test]
    fn test_rejects_bad_radius() {
        let now = Utc::now();
        for radius in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            let mut s = spec();
            s.radius_m = radius;
            assert!(matches!(s.into_zone(now), Err(ZoneError::InvalidRadius(_))));
        }
    }

    #[test]
    fn test_rejects_bad_center_and_name() {
        let now = Utc::now();
        let mut s = spec();
        s.center = Coordinate::new(f64::NAN, 0.0);
        assert!(matches!(s.validate(now), Err(ZoneError::InvalidCenter { .. })));

        let mut s = spec();
        s.name = "   ".to_string();
        assert_eq!(s.validate(now), Err(ZoneError::EmptyName));
    }

    #[test]
    fn test_rejects_expiry_in_the_past() {
        let now = Utc::now();
        let s = spec().expiring_at(now - Duration::seconds(1));
        assert_eq!(s.validate(now), Err(ZoneError::InvalidExpiry));
        assert!(spec().expiring_at(now + Duration::hours(1)).validate(now).is_ok());
    }

    #[test]
    fn test_patch_keeps_identity() {
        let now = Utc::now();
        let mut zone = spec().into_zone(now).unwrap();
        zone.state = ZoneState::Triggered;

        let patch = ZonePatch {
            name: Some("Platform 3".to_string()),
            radius_m: Some(80.0),
            ..Default::default()
        };
        let updated = patch.apply(&zone, now).unwrap();
        assert_eq!(updated.id, zone.id);
        assert_eq!(updated.created_at, zone.created_at);
        assert_eq!(updated.state, ZoneState::Triggered);
        assert_eq!(updated.name, "Platform 3");
        assert_eq!(updated.radius_m, 80.0);

        let bad = ZonePatch {
            radius_m: Some(0.0),
            ..Default::default()
        };
        assert!(bad.apply(&zone, now).is_err());
    }

    #[test]
    fn test_zone_id_parse() {
        let id = ZoneId::new();
        assert_eq!(id.to_string().parse::<ZoneId>().unwrap(), id);
        assert!("not-an-id".parse::<ZoneId>().is_err());
    }
}
