use thiserror::Error;

use super::zones::model::ZoneId;

/// A zone definition that cannot enter the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZoneError {
    #[error("radius must be a positive number of meters, got {0}")]
    InvalidRadius(f64),

    #[error("center is not a valid coordinate: ({lat}, {lon})")]
    InvalidCenter { lat: f64, lon: f64 },

    #[error("expiry is not after the creation time")]
    InvalidExpiry,

    #[error("zone name is empty")]
    EmptyName,

    #[error("zone not found: {0}")]
    NotFound(ZoneId),
}

/// A location sample the evaluator refuses to act on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("sample coordinate is malformed: ({lat}, {lon})")]
    MalformedCoordinate { lat: f64, lon: f64 },

    #[error("sample accuracy {accuracy_m}m exceeds the {ceiling_m}m ceiling")]
    AccuracyOverCeiling { accuracy_m: f64, ceiling_m: f64 },

    #[error("sample accuracy is not a usable number: {0}")]
    InvalidAccuracy(f64),
}

/// Failures of the underlying position watch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied: {0}")]
    PermissionDenied(String),

    #[error("location request timed out")]
    Timeout,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("position watch closed unexpectedly")]
    WatchClosed,
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage data could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure inside a single alert channel. Never crosses into the evaluator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert channel '{channel}' failed: {message}")]
    Channel { channel: String, message: String },

    #[error("alert channel '{channel}' panicked")]
    Panicked { channel: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("background context is not listening")]
    Closed,

    #[error("background context rejected the message: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search query is empty")]
    EmptyQuery,

    #[error("no place matches '{0}'")]
    NoMatch(String),

    #[error("search backend failed: {0}")]
    Backend(String),
}

/// Errors returned through a coordinator handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error("coordinator has stopped")]
    Stopped,
}
