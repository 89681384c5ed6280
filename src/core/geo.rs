//! Coordinates and great-circle distance.
//!
//! Distances use the haversine formula on a spherical earth. Anything that
//! is not a valid WGS84 lat/lon pair yields [`UNKNOWN_DISTANCE`] instead of
//! a number, so callers never mistake garbage input for "right here".

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Returned by [`distance`] when either input is malformed.
pub const UNKNOWN_DISTANCE: f64 = f64::INFINITY;

lazy_static! {
    // "43.6532, -79.3832" or "43.6532 -79.3832"
    static ref COORDINATE_LITERAL: Regex = Regex::new(
        r"^\s*([-+]?\d{1,3}(?:\.\d+)?)\s*(?:,\s*|\s+)([-+]?\d{1,3}(?:\.\d+)?)\s*$"
    )
    .expect("Invalid coordinate regex");
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Parse a `"lat, lon"` literal. Returns `None` for anything that is not
    /// two numbers forming a valid coordinate.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = COORDINATE_LITERAL.captures(text)?;
        let lat = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let lon = caps.get(2)?.as_str().parse::<f64>().ok()?;
        let coordinate = Self::new(lat, lon);
        coordinate.is_valid().then_some(coordinate)
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance(self, other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.lat, self.lon)
    }
}

/// Great-circle distance in meters, or [`UNKNOWN_DISTANCE`] if either
/// coordinate is malformed.
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    if !a.is_valid() || !b.is_valid() {
        return UNKNOWN_DISTANCE;
    }
    if a == b {
        return 0.0;
    }

    let d_lat = (b.lat - a.lat).abs().to_radians();
    let d_lon = (b.lon - a.lon).abs().to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    let meters = EARTH_RADIUS_M * c;

    if meters.is_finite() {
        meters
    } else {
        UNKNOWN_DISTANCE
    }
}

/// True when `meters` is the malformed-input sentinel (or otherwise unusable).
pub fn is_unknown(meters: f64) -> bool {
    !meters.is_finite()
}
