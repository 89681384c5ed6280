//! Background sync: mirrors zone-set changes and triggers to a background
//! execution context so alarms keep working while the foreground is idle.
//!
//! Best effort. Failures are logged by the caller and never propagated.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::core::alerts::model::TriggerEvent;
use crate::core::error::SyncError;
use crate::core::location::model::LocationSample;
use crate::core::zones::model::Zone;

pub const ZONES_UPDATED: &str = "zones-updated";
pub const ZONE_TRIGGERED: &str = "zone-triggered";
pub const LOCATION_UPDATED: &str = "location-updated";

pub trait BackgroundSync: Send + Sync {
    fn notify(&self, event_type: &str, payload: Value) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub event_type: String,
    pub payload: Value,
}

/// Fans messages out to in-process subscribers.
pub struct BroadcastSync {
    tx: broadcast::Sender<SyncMessage>,
}

impl BroadcastSync {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}

impl BackgroundSync for BroadcastSync {
    fn notify(&self, event_type: &str, payload: Value) -> Result<(), SyncError> {
        self.tx
            .send(SyncMessage {
                event_type: event_type.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }
}

/// For sessions with no background context.
pub struct NoopSync;

impl BackgroundSync for NoopSync {
    fn notify(&self, _event_type: &str, _payload: Value) -> Result<(), SyncError> {
        Ok(())
    }
}

pub fn zones_payload(zones: &[Zone]) -> Value {
    json!({ "zones": zones })
}

pub fn trigger_payload(event: &TriggerEvent) -> Value {
    serde_json::to_value(event).unwrap_or(Value::Null)
}

pub fn location_payload(sample: &LocationSample) -> Value {
    json!({
        "lat": sample.coordinate.lat,
        "lon": sample.coordinate.lon,
        "accuracy_m": sample.accuracy_m,
        "timestamp": sample.timestamp,
    })
}

/// Send and log on failure.
pub fn notify_best_effort(sync: &dyn BackgroundSync, event_type: &str, payload: Value) {
    if let Err(e) = sync.notify(event_type, payload) {
        log::debug!("Background sync of '{}' skipped: {}", event_type, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Coordinate;
    use crate::core::zones::model::ZoneSpec;
    use chrono::Utc;

    #[tokio::test]
    async fn test_broadcast_sync() {
        let sync = BroadcastSync::new(4);
        assert_eq!(sync.notify(ZONES_UPDATED, Value::Null), Err(SyncError::Closed));

        let mut rx = sync.subscribe();
        let zone = ZoneSpec::new("Home", Coordinate::new(1.0, 2.0), 50.0)
            .into_zone(Utc::now())
            .unwrap();
        sync.notify(ZONES_UPDATED, zones_payload(&[zone.clone()])).unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.event_type, ZONES_UPDATED);
        assert_eq!(message.payload["zones"][0]["name"], "Home");
        assert_eq!(message.payload["zones"][0]["id"], zone.id.to_string());
    }

    #[test]
    fn test_location_payload() {
        let sample = LocationSample::new(Coordinate::new(43.5, -79.25), None, Utc::now());
        let payload = location_payload(&sample);
        assert_eq!(payload["lat"], 43.5);
        assert_eq!(payload["lon"], -79.25);
        assert!(payload["accuracy_m"].is_null());
    }
}
