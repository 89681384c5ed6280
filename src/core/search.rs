//! Place search for zone creation.
//!
//! Not part of the evaluation loop. Failures go straight back to the user;
//! nothing here retries.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::SearchError;
use crate::core::geo::Coordinate;
use crate::core::zones::model::ZoneSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub coordinate: Coordinate,
    pub display_name: String,
}

impl SearchResult {
    /// A Persistent zone centred on this result.
    pub fn to_zone_spec(&self, radius_m: f64) -> ZoneSpec {
        ZoneSpec::new(self.display_name.clone(), self.coordinate, radius_m)
    }
}

pub trait Geocoder: Send + Sync {
    fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;
}

/// Resolves coordinate literals directly and names against a local list of
/// places (`places.json`, an array of [`SearchResult`]).
#[derive(Debug, Default)]
pub struct LocalGeocoder {
    places: Vec<SearchResult>,
}

impl LocalGeocoder {
    pub fn new(places: Vec<SearchResult>) -> Self {
        Self { places }
    }

    /// Missing file means no named places.
    pub fn load(path: &Path) -> Result<Self, SearchError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| SearchError::Backend(e.to_string()))?;
        let places: Vec<SearchResult> =
            serde_json::from_str(&content).map_err(|e| SearchError::Backend(e.to_string()))?;
        log::debug!("Loaded {} places from {:?}", places.len(), path);
        Ok(Self::new(places))
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }
}

impl Geocoder for LocalGeocoder {
    fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if let Some(coordinate) = Coordinate::parse(query) {
            return Ok(vec![SearchResult {
                coordinate,
                display_name: coordinate.to_string(),
            }]);
        }

        let needle = query.to_lowercase();
        let matches: Vec<SearchResult> = self
            .places
            .iter()
            .filter(|place| place.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        if matches.is_empty() {
            return Err(SearchError::NoMatch(query.to_string()));
        }
        Ok(matches)
    }
}
