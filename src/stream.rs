//! Pieces shared by the playback and capture streams: the state word, the
//! counters the caller reads, and the engine thread bootstrap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use tracing::{error, warn};

use crate::error::{DriverError, DriverResult};
use crate::header::{Notifier, WaveEvent, WaveHeader};
use crate::ring::CommandRing;

/// Lifecycle of a stream engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Idle; nothing is being played or recorded.
    Stopped = 0,
    /// Feeding (or reading) the device.
    Playing = 1,
    /// Paused with buffers still queued.
    Paused = 2,
    /// The engine thread has exited.
    Closed = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Stopped,
            1 => StreamState::Playing,
            2 => StreamState::Paused,
            _ => StreamState::Closed,
        }
    }
}

/// State visible to both the caller and the engine thread.
pub(crate) struct StreamShared {
    pub(crate) ring: CommandRing,
    pub(crate) notifier: Notifier,
    state: AtomicU8,
    /// Bytes the device has played (or recorded).
    position: AtomicU64,
    /// Bytes handed to (or read from) the device.
    transferred: AtomicU64,
    in_flight: AtomicUsize,
}

impl StreamShared {
    pub(crate) fn new(notifier: Notifier) -> Self {
        Self {
            ring: CommandRing::new(),
            notifier,
            state: AtomicU8::new(StreamState::Stopped as u8),
            position: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, position: u64, transferred: u64) {
        self.position.store(position, Ordering::Release);
        self.transferred.store(transferred, Ordering::Release);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Account for a header the caller is about to submit.
    pub(crate) fn admit(&self, header: &WaveHeader) -> DriverResult<()> {
        if !header.enqueue() {
            return Err(DriverError::InvalidHandle);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Undo [`admit`](Self::admit) when the submit could not be posted.
    pub(crate) fn reject(&self, header: &WaveHeader) {
        header.complete();
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Mark a header done and tell the owner.
    pub(crate) fn complete(&self, header: Arc<WaveHeader>) {
        header.complete();
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.notifier.notify(WaveEvent::Done(header));
    }
}

/// Spawn an engine thread and wait until it reports that it is running.
pub(crate) fn spawn_engine<F>(name: String, body: F) -> DriverResult<JoinHandle<()>>
where
    F: FnOnce(Sender<()>) + Send + 'static,
{
    let (started_tx, started_rx) = bounded(1);
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || body(started_tx))
        .map_err(|err| {
            error!(thread = %name, %err, "failed to spawn engine thread");
            DriverError::OutOfMemory
        })?;
    started_rx.recv().map_err(|_| {
        error!(thread = %name, "engine thread exited before starting");
        DriverError::InvalidHandle
    })?;
    Ok(handle)
}

/// Join an engine thread, logging a panic instead of propagating it.
pub(crate) fn join_engine(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("engine").to_string();
    if handle.join().is_err() {
        warn!(thread = %name, "engine thread panicked");
    }
}

/// Shorter of two optional waits; `None` means wait for a command.
pub(crate) fn min_wait(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
