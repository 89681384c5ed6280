// Zone lifecycle events emitted by the evaluator and coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::zones::model::ZoneId;

/// A zone fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub zone_id: ZoneId,
    pub zone_name: String,
    /// Distance from the sample to the zone center
    pub distance_m: f64,
    /// Radius plus accuracy buffer the distance was compared against
    pub effective_radius_m: f64,
    pub sample_accuracy_m: Option<f64>,
    pub at: DateTime<Utc>,
}

/// Why a zone left the store other than by expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteReason {
    /// Explicit user action
    UserRequest,
    /// OneTime zone removed after its grace window
    OneTimeCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneEvent {
    Triggered(TriggerEvent),
    Reset {
        zone_id: ZoneId,
        at: DateTime<Utc>,
    },
    Deleted {
        zone_id: ZoneId,
        reason: DeleteReason,
        at: DateTime<Utc>,
    },
    Expired {
        zone_id: ZoneId,
        at: DateTime<Utc>,
    },
}

impl ZoneEvent {
    pub fn zone_id(&self) -> ZoneId {
        match self {
            Self::Triggered(event) => event.zone_id,
            Self::Reset { zone_id, .. } | Self::Deleted { zone_id, .. } | Self::Expired { zone_id, .. } => *zone_id,
        }
    }

    /// Event name used on the background sync channel.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Triggered(_) => "zone-triggered",
            Self::Reset { .. } => "zone-reset",
            Self::Deleted { .. } => "zone-deleted",
            Self::Expired { .. } => "zone-expired",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Triggered(_))
    }

    /// True when the zone no longer exists after this event.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Deleted { .. } | Self::Expired { .. })
    }
}
