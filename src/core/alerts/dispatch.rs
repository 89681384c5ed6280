// Alert fan-out.
//
// The coordinator hands events to the dispatcher and moves on; a blocking
// worker delivers them to each channel in turn. A channel that errors or
// panics is logged and skipped so the remaining channels still run.

use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::model::{DeleteReason, TriggerEvent, ZoneEvent};
use crate::core::error::AlertError;
use crate::core::zones::model::ZoneId;

/// One alert output (sound, notification, UI event stream...).
pub trait AlertChannel: Send {
    fn name(&self) -> &str;

    fn on_trigger(&self, event: &TriggerEvent) -> Result<(), AlertError>;

    fn on_reset(&self, _zone_id: ZoneId) -> Result<(), AlertError> {
        Ok(())
    }

    fn on_deleted(&self, _zone_id: ZoneId, _reason: DeleteReason) -> Result<(), AlertError> {
        Ok(())
    }

    fn on_expired(&self, _zone_id: ZoneId) -> Result<(), AlertError> {
        Ok(())
    }

    /// Routes an event to the matching hook.
    fn on_event(&self, event: &ZoneEvent) -> Result<(), AlertError> {
        match event {
            ZoneEvent::Triggered(trigger) => self.on_trigger(trigger),
            ZoneEvent::Reset { zone_id, .. } => self.on_reset(*zone_id),
            ZoneEvent::Deleted { zone_id, reason, .. } => self.on_deleted(*zone_id, *reason),
            ZoneEvent::Expired { zone_id, .. } => self.on_expired(*zone_id),
        }
    }
}

pub struct AlertDispatcher {
    tx: Option<mpsc::UnboundedSender<Vec<ZoneEvent>>>,
    worker: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn start(channels: Vec<Box<dyn AlertChannel>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<ZoneEvent>>();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(events) = rx.blocking_recv() {
                for event in &events {
                    deliver(&channels, event);
                }
            }
            log::debug!("Alert dispatcher drained");
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Queue events for delivery. Never blocks.
    pub fn dispatch(&self, events: &[ZoneEvent]) {
        if events.is_empty() {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(events.to_vec()).is_err() {
            log::warn!("Alert worker is gone; dropped {} event(s)", events.len());
        }
    }

    /// Deliver everything already queued, then stop the worker.
    pub async fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::error!("Alert worker failed: {}", e);
            }
        }
    }
}

/// Run one event through every channel, isolating failures.
pub fn deliver(channels: &[Box<dyn AlertChannel>], event: &ZoneEvent) -> Vec<AlertError> {
    let mut failures = Vec::new();
    for channel in channels {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| channel.on_event(event)));
        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => AlertError::Panicked {
                channel: channel.name().to_string(),
            },
        };
        log::warn!("Alert channel '{}' failed on {}: {}", channel.name(), event.event_type(), failure);
        failures.push(failure);
    }
    failures
}

/// Writes alerts to the log.
pub struct LogChannel;

impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn on_trigger(&self, event: &TriggerEvent) -> Result<(), AlertError> {
        log::info!(
            "Arriving at {} ({:.0} m from center, radius {:.0} m)",
            event.zone_name,
            event.distance_m,
            event.effective_radius_m
        );
        Ok(())
    }

    fn on_reset(&self, zone_id: ZoneId) -> Result<(), AlertError> {
        log::info!("Zone {} re-armed", zone_id);
        Ok(())
    }

    fn on_deleted(&self, zone_id: ZoneId, reason: DeleteReason) -> Result<(), AlertError> {
        log::info!("Zone {} removed ({:?})", zone_id, reason);
        Ok(())
    }

    fn on_expired(&self, zone_id: ZoneId) -> Result<(), AlertError> {
        log::info!("Zone {} expired", zone_id);
        Ok(())
    }
}

/// Republishes every event on a broadcast stream for UI-side subscribers.
pub struct BroadcastChannel {
    tx: broadcast::Sender<ZoneEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ZoneEvent> {
        self.tx.subscribe()
    }
}

impl AlertChannel for BroadcastChannel {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn on_trigger(&self, event: &TriggerEvent) -> Result<(), AlertError> {
        self.on_event(&ZoneEvent::Triggered(event.clone()))
    }

    fn on_event(&self, event: &ZoneEvent) -> Result<(), AlertError> {
        // No subscribers is not a failure
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

#[cfg(feature = "audio")]
pub use tone::ToneChannel;

#[cfg(feature = "audio")]
mod tone {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use rodio::source::{SineWave, Source};
    use rodio::{OutputStreamBuilder, Sink};

    use super::AlertChannel;
    use crate::core::alerts::model::TriggerEvent;
    use crate::core::error::AlertError;

    const TONE_HZ: f32 = 880.0;
    const TONE_LENGTH: Duration = Duration::from_millis(1200);

    /// Plays a short tone on the default output device. Overlapping
    /// triggers while a tone is playing are dropped.
    pub struct ToneChannel {
        playing: Arc<AtomicBool>,
    }

    impl ToneChannel {
        pub fn new() -> Self {
            Self {
                playing: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    impl Default for ToneChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AlertChannel for ToneChannel {
        fn name(&self) -> &str {
            "tone"
        }

        fn on_trigger(&self, event: &TriggerEvent) -> Result<(), AlertError> {
            if self
                .playing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                log::debug!("Tone already playing, skipping alert for {}", event.zone_name);
                return Ok(());
            }

            // The output stream is not Send; it lives and dies on its own thread.
            let playing = Arc::clone(&self.playing);
            std::thread::spawn(move || {
                match OutputStreamBuilder::open_default_stream() {
                    Ok(mut stream) => {
                        stream.log_on_drop(false);
                        let sink = Sink::connect_new(stream.mixer());
                        sink.append(SineWave::new(TONE_HZ).take_duration(TONE_LENGTH).amplify(0.25));
                        sink.sleep_until_end();
                    }
                    Err(e) => log::warn!("No audio output for alert tone: {}", e),
                }
                playing.store(false, Ordering::SeqCst);
            });
            Ok(())
        }
    }
}
