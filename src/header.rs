//! Buffer descriptors and the notifications streams deliver about them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

bitflags! {
    /// State and loop markers carried by a [`WaveHeader`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u32 {
        /// The engine is finished with the buffer.
        const DONE = 0x01;
        /// First buffer of a loop.
        const BEGIN_LOOP = 0x04;
        /// Last buffer of a loop.
        const END_LOOP = 0x08;
        /// Submitted and not yet returned.
        const IN_QUEUE = 0x10;
    }
}

/// A caller-owned span of PCM bytes handed to a stream.
///
/// Playback reads from it; capture fills it and records how many bytes it
/// wrote. The loop count is never modified by the engine.
pub struct WaveHeader {
    data: Mutex<Vec<u8>>,
    length: usize,
    loops: u32,
    flags: AtomicU32,
    recorded: AtomicUsize,
}

impl WaveHeader {
    /// Wrap `data` for playback or capture.
    pub fn new(data: Vec<u8>) -> Self {
        let length = data.len();
        Self {
            data: Mutex::new(data),
            length,
            loops: 1,
            flags: AtomicU32::new(0),
            recorded: AtomicUsize::new(0),
        }
    }

    /// Zeroed buffer of `length` bytes, for capture.
    pub fn with_capacity(length: usize) -> Self {
        Self::new(vec![0; length])
    }

    /// Mark as the start of a loop repeated `loops` times.
    pub fn begin_loop(mut self, loops: u32) -> Self {
        self.loops = loops;
        *self.flags.get_mut() |= HeaderFlags::BEGIN_LOOP.bits();
        self
    }

    /// Mark as the end of a loop.
    pub fn end_loop(mut self) -> Self {
        *self.flags.get_mut() |= HeaderFlags::END_LOOP.bits();
        self
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Repeat count requested by the caller.
    pub fn loops(&self) -> u32 {
        self.loops
    }

    /// Current flags.
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether the engine has returned the buffer.
    pub fn is_done(&self) -> bool {
        self.flags().contains(HeaderFlags::DONE)
    }

    /// Bytes captured into the buffer.
    pub fn bytes_recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    /// Access the bytes. Engines hold this lock only while copying.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Flag the buffer as queued; fails if it already is.
    pub(crate) fn enqueue(&self) -> bool {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            if current & HeaderFlags::IN_QUEUE.bits() != 0 {
                return false;
            }
            let next = (current | HeaderFlags::IN_QUEUE.bits()) & !HeaderFlags::DONE.bits();
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn complete(&self) {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            let next = (current & !HeaderFlags::IN_QUEUE.bits()) | HeaderFlags::DONE.bits();
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn reset_recorded(&self) {
        self.recorded.store(0, Ordering::Release);
    }

    pub(crate) fn set_recorded(&self, bytes: usize) {
        self.recorded.store(bytes.min(self.length), Ordering::Release);
    }
}

impl fmt::Debug for WaveHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveHeader")
            .field("length", &self.length)
            .field("loops", &self.loops)
            .field("flags", &self.flags())
            .field("recorded", &self.bytes_recorded())
            .finish()
    }
}

/// Events a stream reports back to its owner.
#[derive(Clone, Debug)]
pub enum WaveEvent {
    /// The stream opened.
    Open,
    /// A buffer was returned.
    Done(Arc<WaveHeader>),
    /// The stream closed.
    Close,
}

/// How a stream delivers [`WaveEvent`]s.
#[derive(Default)]
pub enum Notifier {
    /// Discard events.
    #[default]
    None,
    /// Send events over a channel.
    Channel(Sender<WaveEvent>),
    /// Invoke a callback on the engine thread.
    Callback(Box<dyn Fn(WaveEvent) + Send + Sync>),
}

impl Notifier {
    /// Channel notifier and the receiving end.
    pub fn channel() -> (Self, Receiver<WaveEvent>) {
        let (tx, rx) = unbounded();
        (Notifier::Channel(tx), rx)
    }

    pub(crate) fn notify(&self, event: WaveEvent) {
        trace!(?event, "notify");
        match self {
            Notifier::None => {}
            Notifier::Channel(tx) => {
                let _ = tx.send(event);
            }
            Notifier::Callback(callback) => callback(event),
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notifier::None => f.write_str("Notifier::None"),
            Notifier::Channel(_) => f.write_str("Notifier::Channel"),
            Notifier::Callback(_) => f.write_str("Notifier::Callback"),
        }
    }
}
