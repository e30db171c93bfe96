#![warn(missing_docs)]

//! Userspace OSS audio driver core.
//!
//! A [`DeviceManager`] probes the configured dsp nodes and hands out
//! [`SessionLease`]s, so one descriptor can back a playback and a capture
//! stream at the same time. [`PlaybackStream`] and [`CaptureStream`] each run
//! an engine thread fed through a [`CommandRing`](ring::CommandRing);
//! completed buffers come back through a [`Notifier`] in submission order.
//! [`MappedBuffer`] exposes the DMA region to a mixing engine, directly when
//! the geometry allows it and through a staging copy otherwise.
//!
//! Hardware access goes through the [`Backend`](dsp::Backend) and
//! [`Dsp`](dsp::Dsp) traits: [`OssBackend`] drives real devices and
//! [`LoopbackBackend`] is a software card for tests and demos.

use std::collections::VecDeque;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub mod capture;
pub mod config;
/// Developer-facing status snapshots and console.
pub mod control;
pub mod dsp;
pub mod error;
pub mod format;
pub mod header;
pub mod manager;
pub mod mapped;
pub mod playback;
pub mod ring;
pub mod session;
pub mod stream;
pub mod tone;

#[cfg(test)]
mod tests;

pub use capture::CaptureStream;
pub use config::{DevicePaths, DriverConfig, Quirks};
pub use dsp::{Access, Direction, LoopbackBackend, LoopbackSpec, OssBackend};
pub use error::{DriverError, DriverResult};
pub use format::{MmTime, PcmFormat, SampleFormat, TimeFormat};
pub use header::{HeaderFlags, Notifier, WaveEvent, WaveHeader};
pub use manager::{DeviceInfo, DeviceManager, WaveOpen};
pub use mapped::{BufferMode, BufferPosition, MappedBuffer, PositionNotification};
pub use playback::{PlaybackStream, Volume};
pub use session::{Capabilities, Negotiation, OpenRequest, SessionLease};
pub use stream::StreamState;

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Take the oldest line from the driver's event journal.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}
