//! Async driver for the ingestion controller.
//!
//! Owns the [`PositionSource`], runs the controller's actions against it and
//! forwards accepted fixes to the coordinator. The feed only ever holds the
//! newest fix; stopping clears it so a fix the coordinator has not picked up
//! yet is never evaluated.

use std::future;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::controller::{ControllerAction, IngestOutcome, IngestionController, IngestionState, LocationConfig};
use super::model::{AccuracyMode, LocationSample, PositionError, PositionResult};
use super::source::PositionSource;
use crate::core::clock::SessionClock;
use crate::core::error::LocationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationCommand {
    Start,
    Stop,
}

/// Snapshot published after every input the driver handles.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationStatus {
    pub state: IngestionState,
    pub mode: AccuracyMode,
    pub last_known: Option<LocationSample>,
    /// Set when ingestion stopped on an unrecoverable error
    pub error: Option<LocationError>,
}

impl LocationStatus {
    fn of(controller: &IngestionController, error: Option<LocationError>) -> Self {
        Self {
            state: controller.state(),
            mode: controller.mode(),
            last_known: controller.last_known().copied(),
            error,
        }
    }
}

#[derive(Clone)]
pub struct LocationHandle {
    commands: mpsc::Sender<LocationCommand>,
    status: watch::Receiver<LocationStatus>,
}

impl LocationHandle {
    pub async fn start(&self) -> Result<(), LocationError> {
        self.send(LocationCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), LocationError> {
        self.send(LocationCommand::Stop).await
    }

    async fn send(&self, command: LocationCommand) -> Result<(), LocationError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LocationError::WatchClosed)
    }

    pub fn status(&self) -> LocationStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    pub fn subscribe(&self) -> watch::Receiver<LocationStatus> {
        self.status.clone()
    }

    pub fn last_known(&self) -> Option<LocationSample> {
        self.status.borrow().last_known
    }
}

/// Spawn the driver. It runs until every [`LocationHandle`] is dropped or the
/// sample receiver closes.
pub fn spawn<S: PositionSource>(
    source: S,
    config: LocationConfig,
    clock: SessionClock,
    samples: watch::Sender<Option<LocationSample>>,
) -> (LocationHandle, JoinHandle<()>) {
    let controller = IngestionController::new(config);
    let (status_tx, status_rx) = watch::channel(LocationStatus::of(&controller, None));
    let (command_tx, command_rx) = mpsc::channel(16);

    let driver = Driver {
        source,
        controller,
        clock,
        samples,
        status: status_tx,
        watch_rx: None,
        fetch_rx: None,
        retry_at: None,
        error: None,
    };
    let task = tokio::spawn(driver.run(command_rx));

    (
        LocationHandle {
            commands: command_tx,
            status: status_rx,
        },
        task,
    )
}

struct Driver<S> {
    source: S,
    controller: IngestionController,
    clock: SessionClock,
    samples: watch::Sender<Option<LocationSample>>,
    status: watch::Sender<LocationStatus>,
    watch_rx: Option<mpsc::Receiver<PositionResult>>,
    fetch_rx: Option<oneshot::Receiver<PositionResult>>,
    retry_at: Option<Instant>,
    error: Option<LocationError>,
}

impl<S: PositionSource> Driver<S> {
    async fn run(mut self, mut commands: mpsc::Receiver<LocationCommand>) {
        log::debug!("Location service started");
        loop {
            let keep_running = tokio::select! {
                command = commands.recv() => match command {
                    Some(LocationCommand::Start) => {
                        self.error = None;
                        let actions = self.controller.start();
                        self.apply(actions);
                        true
                    }
                    Some(LocationCommand::Stop) => {
                        let actions = self.controller.stop();
                        self.apply(actions);
                        self.samples.send_replace(None);
                        true
                    }
                    None => false,
                },
                fix = next_fix(&mut self.watch_rx) => match fix {
                    Some(Ok(sample)) => {
                        let outcome = self.controller.on_position(sample, self.clock.now());
                        self.forward(outcome)
                    }
                    Some(Err(e)) => {
                        let actions = self.controller.on_error(e);
                        self.apply(actions);
                        true
                    }
                    None => {
                        log::warn!("Position watch ended by the source");
                        self.watch_rx = None;
                        true
                    }
                },
                () = retry_elapsed(self.retry_at) => {
                    self.retry_at = None;
                    let actions = self.controller.on_retry_elapsed();
                    self.apply(actions);
                    true
                },
                result = fetch_done(&mut self.fetch_rx) => {
                    self.fetch_rx = None;
                    let outcome = self.controller.on_fetch_result(result, self.clock.now());
                    self.forward(outcome)
                },
            };

            self.status
                .send_replace(LocationStatus::of(&self.controller, self.error.clone()));
            if !keep_running {
                break;
            }
        }

        self.source.clear_watch();
        log::debug!("Location service stopped");
    }

    fn apply(&mut self, actions: Vec<ControllerAction>) {
        for action in actions {
            match action {
                ControllerAction::StartWatch(options) => {
                    self.source.clear_watch();
                    self.watch_rx = Some(self.source.watch(&options));
                }
                ControllerAction::ClearWatch => {
                    self.source.clear_watch();
                    self.watch_rx = None;
                    self.fetch_rx = None;
                }
                ControllerAction::ScheduleRetry(delay) => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                ControllerAction::CancelRetry => self.retry_at = None,
                ControllerAction::FetchOnce(options) => {
                    self.fetch_rx = Some(self.source.fetch_once(&options));
                }
                ControllerAction::Fatal(e) => {
                    log::error!("Location ingestion stopped: {}", e);
                    self.error = Some(e);
                }
            }
        }
    }

    /// Returns false once the consumer is gone.
    fn forward(&mut self, outcome: IngestOutcome) -> bool {
        match outcome {
            IngestOutcome::Forward(sample) => {
                if self.samples.send(Some(sample)).is_err() {
                    log::debug!("Sample consumer closed");
                    return false;
                }
            }
            IngestOutcome::Throttled(sample) => {
                log::trace!("Throttled fix at {}", sample.coordinate);
            }
            IngestOutcome::Discarded(reason) => {
                log::trace!("Discarded fix: {:?}", reason);
            }
        }
        true
    }
}

async fn next_fix(rx: &mut Option<mpsc::Receiver<PositionResult>>) -> Option<PositionResult> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn retry_elapsed(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

async fn fetch_done(rx: &mut Option<oneshot::Receiver<PositionResult>>) -> PositionResult {
    match rx {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| Err(PositionError::unavailable("position fetch abandoned"))),
        None => future::pending().await,
    }
}
