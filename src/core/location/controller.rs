//! Position-sampling policy.
//!
//! A pure state machine over `Idle / Watching / Degraded`. It never touches
//! the platform itself: every input returns either an [`IngestOutcome`] for a
//! sample or a list of [`ControllerAction`]s for the driver to carry out.
//!
//! ```text
//!          start()                 Timeout (high accuracy)
//!  Idle ───────────► Watching ─────────────────────────► Degraded
//!   ▲                  │  ▲                                 │
//!   │ stop() /         │  └──────── retry elapsed ──────────┘
//!   │ PermissionDenied │
//!   └──────────────────┴──────────── stop() / PermissionDenied
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::model::{AccuracyMode, LocationSample, PositionError, PositionErrorCode, PositionResult, WatchOptions};
use crate::core::alerts::triggers;
use crate::core::error::{LocationError, SampleError};
use crate::core::geo;

/// Ingestion tunables - persisted in settings.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Mode requested when watching starts
    #[serde(default)]
    pub accuracy_mode: AccuracyMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Oldest fix accepted, both as a platform hint and as a stale-sample filter (0 disables the filter)
    #[serde(default = "default_maximum_age_ms")]
    pub maximum_age_ms: u64,
    /// Fixes less accurate than this are dropped before forwarding
    #[serde(default = "default_accuracy_ceiling_m")]
    pub accuracy_ceiling_m: f64,
    /// Floor for the minimum-movement threshold
    #[serde(default = "default_min_movement_m")]
    pub min_movement_m: f64,
    /// Threshold is accuracy divided by this, floored at `min_movement_m`
    #[serde(default = "default_movement_accuracy_divisor")]
    pub movement_accuracy_divisor: f64,
    /// The movement filter only applies to fixes less accurate than this
    #[serde(default = "default_movement_accuracy_gate_m")]
    pub movement_accuracy_gate_m: f64,
    /// Minimum spacing between samples forwarded to the evaluator
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_degrade_retry_ms")]
    pub degrade_retry_ms: u64,
    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_maximum_age_ms() -> u64 {
    5_000
}

fn default_accuracy_ceiling_m() -> f64 {
    500.0
}

fn default_min_movement_m() -> f64 {
    5.0
}

fn default_movement_accuracy_divisor() -> f64 {
    3.0
}

fn default_movement_accuracy_gate_m() -> f64 {
    20.0
}

fn default_throttle_ms() -> u64 {
    2_000
}

fn default_degrade_retry_ms() -> u64 {
    2_000
}

fn default_max_retry_ms() -> u64 {
    30_000
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            accuracy_mode: AccuracyMode::default(),
            timeout_ms: default_timeout_ms(),
            maximum_age_ms: default_maximum_age_ms(),
            accuracy_ceiling_m: default_accuracy_ceiling_m(),
            min_movement_m: default_min_movement_m(),
            movement_accuracy_divisor: default_movement_accuracy_divisor(),
            movement_accuracy_gate_m: default_movement_accuracy_gate_m(),
            throttle_ms: default_throttle_ms(),
            degrade_retry_ms: default_degrade_retry_ms(),
            max_retry_ms: default_max_retry_ms(),
        }
    }
}

impl LocationConfig {
    pub fn watch_options(&self, accuracy: AccuracyMode) -> WatchOptions {
        WatchOptions {
            accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.maximum_age_ms),
        }
    }

    /// Distance a new fix must move from the last forwarded one to count.
    pub fn movement_threshold(&self, accuracy_m: Option<f64>) -> f64 {
        match accuracy_m {
            Some(accuracy) if self.movement_accuracy_divisor > 0.0 => {
                (accuracy / self.movement_accuracy_divisor).max(self.min_movement_m)
            }
            _ => self.min_movement_m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IngestionState {
    #[default]
    Idle,
    Watching,
    /// Watching in power-saving mode after high-accuracy timeouts
    Degraded,
}

/// Work for the driver that owns the platform watch.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    /// Replace any current watch with one using these options
    StartWatch(WatchOptions),
    ClearWatch,
    /// Call `on_retry_elapsed` after this delay
    ScheduleRetry(Duration),
    CancelRetry,
    FetchOnce(WatchOptions),
    /// Surface to the user; ingestion has stopped
    Fatal(LocationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NotWatching,
    Malformed,
    /// Accuracy worse than the ceiling
    Inaccurate,
    Stale,
    BelowMovementThreshold,
    FetchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestOutcome {
    /// Accepted and due for evaluation
    Forward(LocationSample),
    /// Kept as last known location only; inside the evaluation throttle
    Throttled(LocationSample),
    Discarded(DiscardReason),
}

pub struct IngestionController {
    config: LocationConfig,
    state: IngestionState,
    mode: AccuracyMode,
    last_known: Option<LocationSample>,
    /// Anchor for the movement filter
    last_forwarded: Option<LocationSample>,
    last_forwarded_at: Option<DateTime<Utc>>,
    consecutive_timeouts: u32,
    fetch_in_flight: bool,
}

impl IngestionController {
    pub fn new(config: LocationConfig) -> Self {
        let mode = config.accuracy_mode;
        Self {
            config,
            state: IngestionState::Idle,
            mode,
            last_known: None,
            last_forwarded: None,
            last_forwarded_at: None,
            consecutive_timeouts: 0,
            fetch_in_flight: false,
        }
    }

    pub fn state(&self) -> IngestionState {
        self.state
    }

    /// Accuracy mode of the current (or next) watch.
    pub fn mode(&self) -> AccuracyMode {
        self.mode
    }

    /// Newest accepted fix, throttled or not. Display only.
    pub fn last_known(&self) -> Option<&LocationSample> {
        self.last_known.as_ref()
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn start(&mut self) -> Vec<ControllerAction> {
        if self.state != IngestionState::Idle {
            return Vec::new();
        }
        self.state = IngestionState::Watching;
        self.mode = self.config.accuracy_mode;
        self.consecutive_timeouts = 0;
        log::info!("Location watch starting ({:?})", self.mode);
        vec![ControllerAction::StartWatch(self.config.watch_options(self.mode))]
    }

    pub fn stop(&mut self) -> Vec<ControllerAction> {
        if self.state == IngestionState::Idle {
            return Vec::new();
        }
        self.state = IngestionState::Idle;
        self.fetch_in_flight = false;
        log::info!("Location watch stopped");
        vec![ControllerAction::ClearWatch, ControllerAction::CancelRetry]
    }

    /// A fix from the continuous watch.
    pub fn on_position(&mut self, sample: LocationSample, now: DateTime<Utc>) -> IngestOutcome {
        if self.state == IngestionState::Idle {
            return IngestOutcome::Discarded(DiscardReason::NotWatching);
        }
        self.accept(sample, now)
    }

    /// Result of a one-shot fetch requested by [`ControllerAction::FetchOnce`].
    pub fn on_fetch_result(&mut self, result: PositionResult, now: DateTime<Utc>) -> IngestOutcome {
        self.fetch_in_flight = false;
        if self.state == IngestionState::Idle {
            return IngestOutcome::Discarded(DiscardReason::NotWatching);
        }
        match result {
            Ok(sample) => self.accept(sample, now),
            Err(e) => {
                log::warn!("Fallback position fetch failed: {}", e.message);
                IngestOutcome::Discarded(DiscardReason::FetchFailed)
            }
        }
    }

    pub fn on_error(&mut self, error: PositionError) -> Vec<ControllerAction> {
        if self.state == IngestionState::Idle {
            return Vec::new();
        }
        match error.code {
            PositionErrorCode::PermissionDenied => {
                log::error!("Location permission denied: {}", error.message);
                self.state = IngestionState::Idle;
                self.fetch_in_flight = false;
                vec![
                    ControllerAction::ClearWatch,
                    ControllerAction::CancelRetry,
                    ControllerAction::Fatal(error.into()),
                ]
            }
            PositionErrorCode::Timeout => self.on_timeout(),
            PositionErrorCode::PositionUnavailable => {
                if self.fetch_in_flight {
                    return Vec::new();
                }
                log::warn!("Position unavailable ({}), trying a one-shot fix", error.message);
                self.fetch_in_flight = true;
                vec![ControllerAction::FetchOnce(
                    self.config.watch_options(AccuracyMode::PowerSaving),
                )]
            }
        }
    }

    fn on_timeout(&mut self) -> Vec<ControllerAction> {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        match (self.state, self.mode) {
            (IngestionState::Watching, AccuracyMode::HighAccuracy) => {
                let delay = self.retry_delay();
                log::warn!(
                    "High-accuracy watch timed out ({} in a row), degrading for {:?}",
                    self.consecutive_timeouts,
                    delay
                );
                self.state = IngestionState::Degraded;
                self.mode = AccuracyMode::PowerSaving;
                vec![
                    ControllerAction::StartWatch(self.config.watch_options(AccuracyMode::PowerSaving)),
                    ControllerAction::ScheduleRetry(delay),
                ]
            }
            _ => {
                // Already at low accuracy; a retry is pending or there is nothing to fall back to
                log::debug!("Position watch timed out in {:?} mode", self.mode);
                Vec::new()
            }
        }
    }

    /// The degrade delay ran out: try high accuracy again.
    pub fn on_retry_elapsed(&mut self) -> Vec<ControllerAction> {
        if self.state != IngestionState::Degraded {
            return Vec::new();
        }
        log::info!("Retrying high-accuracy position watch");
        self.state = IngestionState::Watching;
        self.mode = AccuracyMode::HighAccuracy;
        vec![ControllerAction::StartWatch(
            self.config.watch_options(AccuracyMode::HighAccuracy),
        )]
    }

    /// Base delay doubled per consecutive timeout, capped.
    fn retry_delay(&self) -> Duration {
        let exponent = self.consecutive_timeouts.saturating_sub(1).min(16);
        let delay_ms = self
            .config
            .degrade_retry_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_retry_ms.max(self.config.degrade_retry_ms));
        Duration::from_millis(delay_ms)
    }

    fn accept(&mut self, sample: LocationSample, now: DateTime<Utc>) -> IngestOutcome {
        match triggers::validate_sample(&sample, self.config.accuracy_ceiling_m) {
            Ok(()) => {}
            Err(SampleError::AccuracyOverCeiling { accuracy_m, .. }) => {
                log::debug!("Discarding fix with accuracy {:.0}m", accuracy_m);
                return IngestOutcome::Discarded(DiscardReason::Inaccurate);
            }
            Err(e) => {
                log::debug!("Discarding malformed fix: {}", e);
                return IngestOutcome::Discarded(DiscardReason::Malformed);
            }
        }
        if self.is_stale(&sample, now) {
            log::debug!("Discarding stale fix from {}", sample.timestamp);
            return IngestOutcome::Discarded(DiscardReason::Stale);
        }
        if self.below_movement_threshold(&sample) {
            log::debug!(
                "Discarding fix at {} (accuracy {:?}): too little movement",
                sample.coordinate,
                sample.accuracy_m
            );
            return IngestOutcome::Discarded(DiscardReason::BelowMovementThreshold);
        }

        self.last_known = Some(sample);
        self.consecutive_timeouts = 0;

        if let Some(last) = self.last_forwarded_at {
            if now - last < millis(self.config.throttle_ms) {
                return IngestOutcome::Throttled(sample);
            }
        }
        self.last_forwarded = Some(sample);
        self.last_forwarded_at = Some(now);
        IngestOutcome::Forward(sample)
    }

    fn is_stale(&self, sample: &LocationSample, now: DateTime<Utc>) -> bool {
        if self.config.maximum_age_ms == 0 {
            return false;
        }
        now - sample.timestamp > millis(self.config.maximum_age_ms)
    }

    /// Measured from the last forwarded fix, so a throttled fix never becomes
    /// the anchor. The first fix always passes, as does an unknown distance.
    fn below_movement_threshold(&self, sample: &LocationSample) -> bool {
        let Some(previous) = &self.last_forwarded else {
            return false;
        };
        let moved = geo::distance(&previous.coordinate, &sample.coordinate);
        if geo::is_unknown(moved) {
            return false;
        }
        let imprecise = sample
            .accuracy_m
            .map_or(true, |accuracy| accuracy > self.config.movement_accuracy_gate_m);
        imprecise && moved < self.config.movement_threshold(sample.accuracy_m)
    }
}

fn millis(ms: u64) -> chrono::Duration {
    // Clamped to a day so oversized settings cannot overflow chrono
    chrono::Duration::milliseconds(i64::try_from(ms.min(86_400_000)).unwrap_or(86_400_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Coordinate;
    use chrono::Duration as ChronoDuration;

    const BASE: (f64, f64) = (43.6532, -79.3832);
    // Degrees of latitude per meter, near enough for test offsets
    const DEG_PER_M: f64 = 1.0 / 111_195.0;

    fn controller() -> IngestionController {
        let mut c = IngestionController::new(LocationConfig::default());
        c.start();
        c
    }

    fn fix(north_m: f64, accuracy: Option<f64>, at: DateTime<Utc>) -> LocationSample {
        LocationSample::new(Coordinate::new(BASE.0 + north_m * DEG_PER_M, BASE.1), accuracy, at)
    }

    #[test]
    fn test_start_and_stop() {
        let mut c = IngestionController::new(LocationConfig::default());
        assert_eq!(c.state(), IngestionState::Idle);

        let actions = c.start();
        assert!(matches!(
            actions.as_slice(),
            [ControllerAction::StartWatch(WatchOptions {
                accuracy: AccuracyMode::HighAccuracy,
                ..
            })]
        ));
        assert_eq!(c.state(), IngestionState::Watching);
        assert!(c.start().is_empty(), "already watching");

        assert_eq!(c.stop(), vec![ControllerAction::ClearWatch, ControllerAction::CancelRetry]);
        assert_eq!(c.state(), IngestionState::Idle);
        assert!(c.stop().is_empty());
    }

    #[test]
    fn test_first_fix_always_accepted() {
        let mut c = controller();
        let now = Utc::now();
        let outcome = c.on_position(fix(0.0, Some(300.0), now), now);
        assert!(matches!(outcome, IngestOutcome::Forward(_)));
        assert!(c.last_known().is_some());
    }

    #[test]
    fn test_movement_filter() {
        let mut c = controller();
        let t0 = Utc::now();
        assert!(matches!(c.on_position(fix(0.0, Some(30.0), t0), t0), IngestOutcome::Forward(_)));

        // 3 m with 30 m accuracy: threshold max(30/3, 5) = 10 m
        let t1 = t0 + ChronoDuration::seconds(5);
        assert_eq!(
            c.on_position(fix(3.0, Some(30.0), t1), t1),
            IngestOutcome::Discarded(DiscardReason::BelowMovementThreshold)
        );
        assert_eq!(c.last_known().unwrap().coordinate, fix(0.0, None, t0).coordinate);

        let t2 = t0 + ChronoDuration::seconds(10);
        assert!(matches!(c.on_position(fix(15.0, Some(30.0), t2), t2), IngestOutcome::Forward(_)));
    }

    #[test]
    fn test_precise_fix_bypasses_movement_filter() {
        let mut c = controller();
        let t0 = Utc::now();
        c.on_position(fix(0.0, Some(5.0), t0), t0);
        let t1 = t0 + ChronoDuration::seconds(5);
        assert!(matches!(c.on_position(fix(1.0, Some(5.0), t1), t1), IngestOutcome::Forward(_)));
    }

    #[test]
    fn test_throttle_keeps_last_known() {
        let mut c = controller();
        let t0 = Utc::now();
        c.on_position(fix(0.0, Some(5.0), t0), t0);

        let t1 = t0 + ChronoDuration::milliseconds(500);
        let outcome = c.on_position(fix(50.0, Some(5.0), t1), t1);
        assert!(matches!(outcome, IngestOutcome::Throttled(_)));
        assert_eq!(c.last_known().unwrap().timestamp, t1);

        let t2 = t0 + ChronoDuration::seconds(2);
        assert!(matches!(c.on_position(fix(100.0, Some(5.0), t2), t2), IngestOutcome::Forward(_)));
    }

    #[test]
    fn test_throttled_fix_is_not_the_movement_anchor() {
        use crate::core::alerts::model::ZoneEvent;
        use crate::core::config::Settings;
        use crate::core::coordinator::Coordinator;
        use crate::core::zones::model::{ZoneSpec, ZoneState};

        let mut c = controller();
        let t0 = Utc::now();
        let mut coordinator = Coordinator::new(Vec::new(), &Settings::default(), t0);
        let zone = coordinator
            .create_zone(ZoneSpec::new("Bus stop", fix(50.0, None, t0).coordinate, 10.0), t0)
            .unwrap();

        let mut triggers = 0;
        let mut feed = |c: &mut IngestionController, sample: LocationSample, now: DateTime<Utc>| {
            let outcome = c.on_position(sample, now);
            if let IngestOutcome::Forward(sample) = outcome {
                let output = coordinator.handle_sample(&sample, now);
                triggers += output.events.iter().filter(|e| matches!(e, ZoneEvent::Triggered(_))).count();
            }
            outcome
        };

        assert!(matches!(feed(&mut c, fix(0.0, Some(30.0), t0), t0), IngestOutcome::Forward(_)));
        // Walks into the zone on a fix that lands inside the throttle window
        let t1 = t0 + ChronoDuration::milliseconds(500);
        assert!(matches!(feed(&mut c, fix(50.0, Some(30.0), t1), t1), IngestOutcome::Throttled(_)));

        // Then lingers there with poor accuracy
        for i in 1..=30 {
            let at = t1 + ChronoDuration::seconds(2 * i);
            feed(&mut c, fix(50.0 + (i % 3) as f64, Some(30.0), at), at);
        }
        drop(feed);

        assert_eq!(triggers, 1);
        assert_eq!(coordinator.get(zone.id).unwrap().state, ZoneState::Triggered);
    }

    #[test]
    fn test_inaccurate_fix_does_not_start_throttle() {
        let mut c = controller();
        let t0 = Utc::now();
        assert_eq!(
            c.on_position(fix(0.0, Some(600.0), t0), t0),
            IngestOutcome::Discarded(DiscardReason::Inaccurate)
        );
        assert!(c.last_known().is_none());

        let t1 = t0 + ChronoDuration::milliseconds(100);
        assert!(matches!(c.on_position(fix(1.0, Some(30.0), t1), t1), IngestOutcome::Forward(_)));
    }

    #[test]
    fn test_stale_and_malformed_discarded() {
        let mut c = controller();
        let now = Utc::now();
        let old = fix(0.0, Some(5.0), now - ChronoDuration::seconds(30));
        assert_eq!(c.on_position(old, now), IngestOutcome::Discarded(DiscardReason::Stale));

        let bad = LocationSample::new(Coordinate::new(f64::NAN, 0.0), Some(5.0), now);
        assert_eq!(c.on_position(bad, now), IngestOutcome::Discarded(DiscardReason::Malformed));
        assert!(c.last_known().is_none());
    }

    #[test]
    fn test_idle_discards() {
        let mut c = IngestionController::new(LocationConfig::default());
        let now = Utc::now();
        assert_eq!(
            c.on_position(fix(0.0, Some(5.0), now), now),
            IngestOutcome::Discarded(DiscardReason::NotWatching)
        );
        assert!(c.on_error(PositionError::timeout()).is_empty());
    }

    #[test]
    fn test_timeout_degrades_then_retries() {
        let mut c = controller();
        let actions = c.on_error(PositionError::timeout());
        assert_eq!(c.state(), IngestionState::Degraded);
        assert_eq!(c.mode(), AccuracyMode::PowerSaving);
        assert!(matches!(
            actions.as_slice(),
            [
                ControllerAction::StartWatch(WatchOptions {
                    accuracy: AccuracyMode::PowerSaving,
                    ..
                }),
                ControllerAction::ScheduleRetry(d)
            ] if *d == Duration::from_secs(2)
        ));

        // Timeouts while degraded wait for the pending retry
        assert!(c.on_error(PositionError::timeout()).is_empty());

        let actions = c.on_retry_elapsed();
        assert_eq!(c.state(), IngestionState::Watching);
        assert!(matches!(
            actions.as_slice(),
            [ControllerAction::StartWatch(WatchOptions {
                accuracy: AccuracyMode::HighAccuracy,
                ..
            })]
        ));
        assert!(c.on_retry_elapsed().is_empty());
    }

    #[test]
    fn test_retry_backoff_grows_and_resets() {
        let mut c = controller();
        let delay_of = |actions: &[ControllerAction]| {
            actions.iter().find_map(|a| match a {
                ControllerAction::ScheduleRetry(d) => Some(*d),
                _ => None,
            })
        };

        assert_eq!(delay_of(&c.on_error(PositionError::timeout())), Some(Duration::from_secs(2)));
        c.on_retry_elapsed();
        assert_eq!(delay_of(&c.on_error(PositionError::timeout())), Some(Duration::from_secs(4)));
        c.on_retry_elapsed();

        let now = Utc::now();
        c.on_position(fix(0.0, Some(5.0), now), now);
        assert_eq!(delay_of(&c.on_error(PositionError::timeout())), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut c = controller();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            for action in c.on_error(PositionError::timeout()) {
                if let ControllerAction::ScheduleRetry(d) = action {
                    last = d;
                }
            }
            c.on_retry_elapsed();
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let mut c = controller();
        let actions = c.on_error(PositionError::permission_denied());
        assert_eq!(c.state(), IngestionState::Idle);
        assert!(matches!(
            actions.last(),
            Some(ControllerAction::Fatal(LocationError::PermissionDenied(_)))
        ));
        assert!(actions.contains(&ControllerAction::ClearWatch));
    }

    #[test]
    fn test_unavailable_triggers_single_fetch() {
        let mut c = controller();
        let actions = c.on_error(PositionError::unavailable("no fix"));
        assert!(matches!(
            actions.as_slice(),
            [ControllerAction::FetchOnce(WatchOptions {
                accuracy: AccuracyMode::PowerSaving,
                ..
            })]
        ));
        assert_eq!(c.state(), IngestionState::Watching);
        assert!(c.on_error(PositionError::unavailable("no fix")).is_empty(), "fetch in flight");

        let now = Utc::now();
        let outcome = c.on_fetch_result(Err(PositionError::unavailable("still nothing")), now);
        assert_eq!(outcome, IngestOutcome::Discarded(DiscardReason::FetchFailed));
        assert_eq!(c.state(), IngestionState::Watching);

        c.on_error(PositionError::unavailable("no fix"));
        let outcome = c.on_fetch_result(Ok(fix(0.0, Some(50.0), now)), now);
        assert!(matches!(outcome, IngestOutcome::Forward(_)));
    }
}
