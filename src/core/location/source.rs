//! Platform position sources.
//!
//! A source hands out a channel of fixes per watch. Dropping the receiver or
//! calling `clear_watch` ends it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

use super::model::{LocationSample, PositionError, PositionResult, WatchOptions};

const WATCH_BUFFER: usize = 64;

pub trait PositionSource: Send + 'static {
    /// Start a watch, replacing any previous one.
    fn watch(&mut self, options: &WatchOptions) -> mpsc::Receiver<PositionResult>;
    fn clear_watch(&mut self);
    /// Request a single fix outside the watch.
    fn fetch_once(&mut self, options: &WatchOptions) -> oneshot::Receiver<PositionResult>;
}

#[derive(Default)]
struct FeedState {
    watch_tx: Option<mpsc::Sender<PositionResult>>,
    watch_history: Vec<WatchOptions>,
    pending_fetch: Option<oneshot::Sender<PositionResult>>,
    queued_fetches: VecDeque<PositionResult>,
    fetch_count: usize,
}

fn lock(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Source driven by whoever holds the paired [`SourceFeed`]: stdin in the
/// binary, the test body in tests.
pub struct ChannelSource {
    state: Arc<Mutex<FeedState>>,
}

/// Producer side of a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ChannelSource {
    pub fn channel() -> (Self, SourceFeed) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SourceFeed { state },
        )
    }
}

impl PositionSource for ChannelSource {
    fn watch(&mut self, options: &WatchOptions) -> mpsc::Receiver<PositionResult> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut state = lock(&self.state);
        state.watch_tx = Some(tx);
        state.watch_history.push(*options);
        rx
    }

    fn clear_watch(&mut self) {
        lock(&self.state).watch_tx = None;
    }

    fn fetch_once(&mut self, _options: &WatchOptions) -> oneshot::Receiver<PositionResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = lock(&self.state);
        state.fetch_count += 1;
        match state.queued_fetches.pop_front() {
            Some(result) => {
                let _ = tx.send(result);
            }
            None => state.pending_fetch = Some(tx),
        }
        rx
    }
}

impl SourceFeed {
    /// Deliver a fix to the active watch. Returns false when nothing is watching.
    pub fn push(&self, sample: LocationSample) -> bool {
        self.send(Ok(sample))
    }

    /// Report a watch error.
    pub fn fail(&self, error: PositionError) -> bool {
        self.send(Err(error))
    }

    fn send(&self, result: PositionResult) -> bool {
        let state = lock(&self.state);
        match &state.watch_tx {
            Some(tx) => match tx.try_send(result) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Position watch rejected a fix: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Answer the outstanding one-shot fetch, or the next one if none is waiting.
    pub fn resolve_fetch(&self, result: PositionResult) {
        let mut state = lock(&self.state);
        match state.pending_fetch.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => state.queued_fetches.push_back(result),
        }
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.state).watch_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Options of every watch started so far, oldest first.
    pub fn watch_history(&self) -> Vec<WatchOptions> {
        lock(&self.state).watch_history.clone()
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.state).fetch_count
    }
}
