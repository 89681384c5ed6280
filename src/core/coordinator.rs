//! Single owner of the zone set.
//!
//! [`Coordinator`] is the synchronous core: every mutation (user edits,
//! samples, elapsed timers) goes through it with an explicit `now`.
//! [`spawn`] wraps it in a task that serializes those inputs and carries out
//! the side effects: alert dispatch, background sync and debounced saves.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::alerts::dispatch::AlertDispatcher;
use super::alerts::engine::{self, TriggerEvaluator};
use super::alerts::model::{DeleteReason, ZoneEvent};
use super::clock::SessionClock;
use super::config::{PersistenceConfig, Settings};
use super::error::{CoordinatorError, ZoneError};
use super::location::model::LocationSample;
use super::sync::{self, BackgroundSync};
use super::timers::{TimerKind, TimerRegistry};
use super::zones::model::{Zone, ZoneId, ZoneKind, ZonePatch, ZoneSpec};
use super::zones::persist::Persistence;
use super::zones::store::ZoneStore;

const MAX_SWEEP_SECS: u64 = 86_400;
const MAX_SAVE_DEBOUNCE_MS: u64 = 60_000;

/// What one input produced.
#[derive(Debug, Default, PartialEq)]
pub struct CoordinatorOutput {
    pub events: Vec<ZoneEvent>,
    /// The zone set changed and should be mirrored
    pub zones_changed: bool,
    /// Sample that passed evaluation, mirrored as the device position
    pub sample: Option<LocationSample>,
}

pub struct Coordinator {
    store: ZoneStore,
    evaluator: TriggerEvaluator,
    timers: TimerRegistry,
    persistence: PersistenceConfig,
    save_due: Option<DateTime<Utc>>,
    next_sweep: DateTime<Utc>,
}

impl Coordinator {
    /// Build from stored zones. Zones restored in the Triggered state get
    /// their cool-down (and, for OneTime zones, deletion) rescheduled from
    /// `last_triggered_at`.
    pub fn new(zones: Vec<Zone>, settings: &Settings, now: DateTime<Utc>) -> Self {
        let mut coordinator = Self {
            store: ZoneStore::restore(zones),
            evaluator: TriggerEvaluator::new(settings.evaluation.clone()),
            timers: TimerRegistry::new(),
            persistence: settings.persistence.clone(),
            save_due: None,
            next_sweep: now,
        };
        coordinator.reschedule_restored(now);
        coordinator.next_sweep = now + coordinator.sweep_interval();
        coordinator
    }

    fn reschedule_restored(&mut self, now: DateTime<Utc>) {
        let config = self.evaluator.config();
        for zone in self.store.zones().iter().filter(|z| z.is_triggered()) {
            let since = zone.last_triggered_at.unwrap_or(now);
            self.timers
                .schedule(zone.id, TimerKind::CooldownReset, since + config.cooldown());
            if zone.kind == ZoneKind::OneTime {
                self.timers
                    .schedule(zone.id, TimerKind::OneTimeDeletion, since + config.one_time_grace());
            }
        }
        if !self.timers.is_empty() {
            log::info!("Rescheduled {} timer(s) for restored zones", self.timers.len());
        }
    }

    pub fn zones(&self) -> &[Zone] {
        self.store.zones()
    }

    pub fn get(&self, id: ZoneId) -> Option<&Zone> {
        self.store.get(id)
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn create_zone(&mut self, spec: ZoneSpec, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        let zone = self.store.create(spec, now)?;
        self.note_changes(now);
        Ok(zone)
    }

    pub fn update_zone(&mut self, id: ZoneId, patch: &ZonePatch, now: DateTime<Utc>) -> Result<Zone, ZoneError> {
        let zone = self.store.update(id, patch, now)?;
        self.note_changes(now);
        Ok(zone)
    }

    /// Remove a zone and cancel anything pending for it. Unknown ids are a no-op.
    pub fn delete_zone(&mut self, id: ZoneId, now: DateTime<Utc>) -> Option<ZoneEvent> {
        let zone = self.store.delete(id)?;
        let cancelled = self.timers.cancel_zone(id);
        log::info!("Deleted zone '{}' ({}), cancelled {} timer(s)", zone.name, id, cancelled);
        self.note_changes(now);
        Some(ZoneEvent::Deleted {
            zone_id: id,
            reason: DeleteReason::UserRequest,
            at: now,
        })
    }

    /// Put a Triggered zone straight back to Armed. The debounce window
    /// still applies to its next trigger.
    pub fn rearm_zone(&mut self, id: ZoneId, now: DateTime<Utc>) -> Result<Option<ZoneEvent>, ZoneError> {
        if self.store.get(id).is_none() {
            return Err(ZoneError::NotFound(id));
        }
        if !self.store.mark_reset(id) {
            return Ok(None);
        }
        self.timers.cancel_zone(id);
        log::info!("Zone {} re-armed manually", id);
        self.note_changes(now);
        Ok(Some(ZoneEvent::Reset { zone_id: id, at: now }))
    }

    /// Evaluate a sample. Rejected samples change nothing.
    pub fn handle_sample(&mut self, sample: &LocationSample, now: DateTime<Utc>) -> CoordinatorOutput {
        let (events, accepted) = match self
            .evaluator
            .evaluate(sample, &mut self.store, &mut self.timers, now)
        {
            Ok(events) => (events, Some(*sample)),
            Err(e) => {
                log::debug!("Sample rejected: {}", e);
                (Vec::new(), None)
            }
        };
        let zones_changed = self.note_changes(now);
        CoordinatorOutput {
            events,
            zones_changed,
            sample: accepted,
        }
    }

    /// Apply elapsed timers, expiry and the periodic sweep.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> CoordinatorOutput {
        let mut events = engine::expire(&mut self.store, &mut self.timers, now);
        events.extend(self.evaluator.fire_due(&mut self.store, &mut self.timers, now));
        if now >= self.next_sweep {
            self.next_sweep = now + self.sweep_interval();
        }
        let zones_changed = self.note_changes(now);
        CoordinatorOutput {
            events,
            zones_changed,
            sample: None,
        }
    }

    /// Earliest moment `fire_due` or `take_save` has work.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        // Expiry is strict, so wake just after the instant
        let expiry = self
            .store
            .next_expiry()
            .map(|at| at + Duration::milliseconds(1));
        [self.timers.next_due(), self.save_due, Some(self.next_sweep), expiry]
            .into_iter()
            .flatten()
            .min()
    }

    /// Zones to write if the save debounce has elapsed.
    pub fn take_save(&mut self, now: DateTime<Utc>) -> Option<Vec<Zone>> {
        match self.save_due {
            Some(due) if due <= now => {
                self.save_due = None;
                Some(self.store.snapshot())
            }
            _ => None,
        }
    }

    /// Zones to write right away if a save is pending.
    pub fn flush(&mut self) -> Option<Vec<Zone>> {
        let dirty = self.store.take_dirty();
        let pending = self.save_due.take().is_some();
        (dirty || pending).then(|| self.store.snapshot())
    }

    pub fn update_settings(&mut self, settings: &Settings) {
        self.evaluator.update_config(settings.evaluation.clone());
        self.persistence = settings.persistence.clone();
    }

    /// Drop every pending timer.
    pub fn shutdown(&mut self) {
        let pending = self.timers.len();
        self.timers.clear();
        log::debug!("Coordinator shut down with {} pending timer(s)", pending);
    }

    fn sweep_interval(&self) -> Duration {
        let secs = self.persistence.expiry_sweep_secs.clamp(1, MAX_SWEEP_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or(1))
    }

    /// Drain the store's dirty flag into a (re)scheduled save.
    fn note_changes(&mut self, now: DateTime<Utc>) -> bool {
        if !self.store.take_dirty() {
            return false;
        }
        let debounce = self.persistence.save_debounce_ms.min(MAX_SAVE_DEBOUNCE_MS);
        self.save_due = Some(now + Duration::milliseconds(i64::try_from(debounce).unwrap_or(0)));
        true
    }
}

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum Command {
    CreateZone(ZoneSpec, Reply<Zone>),
    UpdateZone(ZoneId, ZonePatch, Reply<Zone>),
    DeleteZone(ZoneId, Reply<bool>),
    RearmZone(ZoneId, Reply<()>),
    ListZones(oneshot::Sender<Vec<Zone>>),
    UpdateSettings(Settings),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }

    pub async fn create_zone(&self, spec: ZoneSpec) -> Result<Zone, CoordinatorError> {
        self.request(|reply| Command::CreateZone(spec, reply)).await
    }

    pub async fn update_zone(&self, id: ZoneId, patch: ZonePatch) -> Result<Zone, CoordinatorError> {
        self.request(|reply| Command::UpdateZone(id, patch, reply)).await
    }

    /// Resolves to whether a zone was removed.
    pub async fn delete_zone(&self, id: ZoneId) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::DeleteZone(id, reply)).await
    }

    pub async fn rearm_zone(&self, id: ZoneId) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::RearmZone(id, reply)).await
    }

    pub async fn zones(&self) -> Result<Vec<Zone>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ListZones(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), CoordinatorError> {
        self.tx
            .send(Command::UpdateSettings(settings))
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Stop the task after flushing pending saves and alerts.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(done))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }
}

/// External collaborators driven by the coordinator task.
pub struct Collaborators {
    pub persistence: Arc<dyn Persistence>,
    pub sync: Arc<dyn BackgroundSync>,
    pub alerts: AlertDispatcher,
}

/// Run `coordinator` on its own task, fed by `samples`.
///
/// The feed holds only the newest fix. A fix replaced before the task gets to
/// it is never evaluated, and `None` withdraws a fix that has not been picked
/// up yet.
pub fn spawn(
    coordinator: Coordinator,
    collaborators: Collaborators,
    clock: SessionClock,
    samples: watch::Receiver<Option<LocationSample>>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, commands) = mpsc::channel(32);
    let saver = SaveWorker::start(Arc::clone(&collaborators.persistence));
    let task = tokio::spawn(run(coordinator, collaborators, saver, clock, commands, samples));
    (CoordinatorHandle { tx }, task)
}

async fn run(
    mut coordinator: Coordinator,
    mut collaborators: Collaborators,
    mut saver: SaveWorker,
    clock: SessionClock,
    mut commands: mpsc::Receiver<Command>,
    mut samples: watch::Receiver<Option<LocationSample>>,
) {
    log::info!("Coordinator started with {} zone(s)", coordinator.zones().len());
    let mut samples_open = true;
    let mut shutdown_reply = None;

    loop {
        let wake = coordinator.next_deadline().map(|at| clock.instant_at(at));
        let output = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    shutdown_reply = Some(reply);
                    break;
                }
                Some(command) => handle_command(&mut coordinator, command, clock.now()),
                None => break,
            },
            changed = samples.changed(), if samples_open => match changed {
                Ok(()) => {
                    let latest = *samples.borrow_and_update();
                    match latest {
                        Some(sample) => coordinator.handle_sample(&sample, clock.now()),
                        None => CoordinatorOutput::default(),
                    }
                }
                Err(_) => {
                    log::debug!("Sample feed closed");
                    samples_open = false;
                    CoordinatorOutput::default()
                }
            },
            () = sleep_until(wake) => coordinator.fire_due(clock.now()),
        };

        publish(&coordinator, &collaborators, &output);
        if let Some(zones) = coordinator.take_save(clock.now()) {
            saver.save(zones);
        }
    }

    coordinator.shutdown();
    if let Some(zones) = coordinator.flush() {
        saver.save(zones);
    }
    saver.shutdown().await;
    collaborators.alerts.shutdown().await;
    log::info!("Coordinator stopped");
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

fn handle_command(coordinator: &mut Coordinator, command: Command, now: DateTime<Utc>) -> CoordinatorOutput {
    let mut output = CoordinatorOutput::default();
    match command {
        Command::CreateZone(spec, reply) => {
            let result = coordinator.create_zone(spec, now).map_err(CoordinatorError::from);
            output.zones_changed = result.is_ok();
            let _ = reply.send(result);
        }
        Command::UpdateZone(id, patch, reply) => {
            let result = coordinator.update_zone(id, &patch, now).map_err(CoordinatorError::from);
            output.zones_changed = result.is_ok();
            let _ = reply.send(result);
        }
        Command::DeleteZone(id, reply) => {
            let removed = coordinator.delete_zone(id, now);
            if let Some(event) = removed.clone() {
                output.events.push(event);
                output.zones_changed = true;
            }
            let _ = reply.send(Ok(removed.is_some()));
        }
        Command::RearmZone(id, reply) => {
            let result = coordinator.rearm_zone(id, now).map(|event| {
                if let Some(event) = event {
                    output.events.push(event);
                    output.zones_changed = true;
                }
            });
            let _ = reply.send(result.map_err(CoordinatorError::from));
        }
        Command::ListZones(reply) => {
            let _ = reply.send(coordinator.zones().to_vec());
        }
        Command::UpdateSettings(settings) => {
            log::info!("Applying updated settings");
            coordinator.update_settings(&settings);
        }
        Command::Shutdown(_) => {}
    }
    output
}

fn publish(coordinator: &Coordinator, collaborators: &Collaborators, output: &CoordinatorOutput) {
    collaborators.alerts.dispatch(&output.events);
    if let Some(sample) = &output.sample {
        sync::notify_best_effort(
            collaborators.sync.as_ref(),
            sync::LOCATION_UPDATED,
            sync::location_payload(sample),
        );
    }
    for event in &output.events {
        if let ZoneEvent::Triggered(trigger) = event {
            sync::notify_best_effort(
                collaborators.sync.as_ref(),
                sync::ZONE_TRIGGERED,
                sync::trigger_payload(trigger),
            );
        }
    }
    if output.zones_changed {
        sync::notify_best_effort(
            collaborators.sync.as_ref(),
            sync::ZONES_UPDATED,
            sync::zones_payload(coordinator.zones()),
        );
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Writes zone snapshots off the coordinator task, newest wins.
struct SaveWorker {
    tx: Option<mpsc::UnboundedSender<Vec<Zone>>>,
    worker: Option<JoinHandle<()>>,
}

impl SaveWorker {
    fn start(persistence: Arc<dyn Persistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Zone>>();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(mut zones) = rx.blocking_recv() {
                // Skip snapshots already superseded
                while let Ok(newer) = rx.try_recv() {
                    zones = newer;
                }
                match persistence.save_zones(&zones) {
                    Ok(()) => log::debug!("Saved {} zone(s)", zones.len()),
                    Err(e) => log::error!("Failed to save zones: {}", e),
                }
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    fn save(&self, zones: Vec<Zone>) {
        if let Some(tx) = &self.tx {
            if tx.send(zones).is_err() {
                log::error!("Zone save worker is gone");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::error!("Zone save worker failed: {}", e);
            }
        }
    }
}
