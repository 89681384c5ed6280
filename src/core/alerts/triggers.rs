// Per-zone trigger checks.
//
// Pure functions over a zone, a sample and the current time; the engine
// decides what to do with the verdicts.

use chrono::{DateTime, Duration, Utc};

use super::engine::EvaluatorConfig;
use crate::core::error::{SampleError, ZoneError};
use crate::core::geo::{self, Coordinate};
use crate::core::location::model::LocationSample;
use crate::core::zones::model::{Zone, ZoneState};

/// Verdict for one Armed zone against one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneCheck {
    /// Inside the effective radius and clear of the debounce window
    Enter { distance_m: f64, effective_radius_m: f64 },
    /// Inside, but the zone fired too recently
    Debounced { distance_m: f64 },
    Outside { distance_m: f64, effective_radius_m: f64 },
    /// Distance could not be computed
    Unknown,
}

/// Reject samples the evaluator must not act on.
pub fn validate_sample(sample: &LocationSample, ceiling_m: f64) -> Result<(), SampleError> {
    let Coordinate { lat, lon } = sample.coordinate;
    if !sample.coordinate.is_valid() {
        return Err(SampleError::MalformedCoordinate { lat, lon });
    }
    if let Some(accuracy) = sample.accuracy_m {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(SampleError::InvalidAccuracy(accuracy));
        }
        if accuracy > ceiling_m {
            return Err(SampleError::AccuracyOverCeiling {
                accuracy_m: accuracy,
                ceiling_m,
            });
        }
    }
    Ok(())
}

/// Extra meters added to a zone's radius to absorb GPS error.
pub fn accuracy_buffer(accuracy_m: Option<f64>, config: &EvaluatorConfig) -> f64 {
    match accuracy_m {
        Some(accuracy) => (accuracy * config.accuracy_buffer_ratio).min(config.max_accuracy_buffer_m),
        None => config.unknown_accuracy_buffer_m,
    }
}

pub fn effective_radius(zone: &Zone, accuracy_m: Option<f64>, config: &EvaluatorConfig) -> f64 {
    zone.radius_m + accuracy_buffer(accuracy_m, config)
}

/// True while `now` is within `window` of the last trigger.
pub fn within_debounce(last_triggered_at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    last_triggered_at.is_some_and(|last| now - last <= window)
}

/// A zone still Triggered after its cool-down has run out.
pub fn cooldown_overdue(zone: &Zone, now: DateTime<Utc>, cooldown: Duration) -> bool {
    zone.state == ZoneState::Triggered
        && zone.last_triggered_at.map_or(true, |last| now - last >= cooldown)
}

/// Check an Armed zone against a validated sample.
pub fn check_zone(
    zone: &Zone,
    sample: &LocationSample,
    now: DateTime<Utc>,
    config: &EvaluatorConfig,
) -> Result<ZoneCheck, ZoneError> {
    zone.validate()?;

    let distance_m = geo::distance(&sample.coordinate, &zone.center);
    if geo::is_unknown(distance_m) {
        return Ok(ZoneCheck::Unknown);
    }

    let effective_radius_m = effective_radius(zone, sample.accuracy_m, config);
    if distance_m > effective_radius_m {
        return Ok(ZoneCheck::Outside {
            distance_m,
            effective_radius_m,
        });
    }
    if within_debounce(zone.last_triggered_at, now, config.debounce()) {
        return Ok(ZoneCheck::Debounced { distance_m });
    }
    Ok(ZoneCheck::Enter {
        distance_m,
        effective_radius_m,
    })
}
