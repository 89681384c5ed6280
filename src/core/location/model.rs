use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::LocationError;
use crate::core::geo::Coordinate;

/// One position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub coordinate: Coordinate,
    /// Reported accuracy radius; `None` when the platform gives none
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(coordinate: Coordinate, accuracy_m: Option<f64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            accuracy_m,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccuracyMode {
    #[default]
    HighAccuracy,
    PowerSaving,
}

/// Options handed to the platform position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub accuracy: AccuracyMode,
    /// How long the platform may take to deliver a fix
    pub timeout: Duration,
    /// Oldest cached fix the platform may return
    pub maximum_age: Duration,
}

/// Error codes reported by a position watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionError {
    pub code: PositionErrorCode,
    pub message: String,
}

impl PositionError {
    pub fn new(code: PositionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(PositionErrorCode::Timeout, "timed out")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(PositionErrorCode::PositionUnavailable, message)
    }

    pub fn permission_denied() -> Self {
        Self::new(PositionErrorCode::PermissionDenied, "user denied geolocation")
    }
}

impl From<PositionError> for LocationError {
    fn from(err: PositionError) -> Self {
        match err.code {
            PositionErrorCode::PermissionDenied => Self::PermissionDenied(err.message),
            PositionErrorCode::PositionUnavailable => Self::Unavailable(err.message),
            PositionErrorCode::Timeout => Self::Timeout,
        }
    }
}

pub type PositionResult = Result<LocationSample, PositionError>;
