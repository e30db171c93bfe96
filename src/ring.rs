//! Growable command ring between a stream's caller and its engine thread.
//!
//! Fire-and-forget commands are appended at the tail. Confirmed commands are
//! inserted at the head so they overtake queued buffer submissions, and the
//! caller blocks until the engine acknowledges them. The ring grows by
//! [`RING_INCREMENT`] slots when full, relocating the wrapped part so the
//! order of pending commands is preserved.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{DriverError, DriverResult};
use crate::header::WaveHeader;

/// Slots added each time the ring fills up.
pub const RING_INCREMENT: usize = 64;

/// Commands understood by the stream engines.
#[derive(Debug)]
pub enum Command {
    /// Queue a buffer.
    Submit(Arc<WaveHeader>),
    /// Pause playback.
    Pause,
    /// Resume paused playback.
    Restart,
    /// Flush and return every buffer.
    Reset,
    /// Leave the active loop after the current pass.
    BreakLoop,
    /// Refresh the position counters from the device.
    RefreshPosition,
    /// Start capturing.
    Start,
    /// Stop capturing.
    Stop,
    /// Terminate the engine thread.
    Closing,
}

/// Tag of a [`Command`], for looking at the ring without taking from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// [`Command::Submit`].
    Submit,
    /// [`Command::Pause`].
    Pause,
    /// [`Command::Restart`].
    Restart,
    /// [`Command::Reset`].
    Reset,
    /// [`Command::BreakLoop`].
    BreakLoop,
    /// [`Command::RefreshPosition`].
    RefreshPosition,
    /// [`Command::Start`].
    Start,
    /// [`Command::Stop`].
    Stop,
    /// [`Command::Closing`].
    Closing,
}

impl Command {
    /// Tag of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Submit(_) => CommandKind::Submit,
            Command::Pause => CommandKind::Pause,
            Command::Restart => CommandKind::Restart,
            Command::Reset => CommandKind::Reset,
            Command::BreakLoop => CommandKind::BreakLoop,
            Command::RefreshPosition => CommandKind::RefreshPosition,
            Command::Start => CommandKind::Start,
            Command::Stop => CommandKind::Stop,
            Command::Closing => CommandKind::Closing,
        }
    }
}

/// Completion handle for a dequeued command.
///
/// Dropping it without calling [`Ack::complete`] wakes a waiting caller with
/// an error instead of leaving it blocked.
#[derive(Debug)]
pub struct Ack(Option<Sender<()>>);

impl Ack {
    /// Whether a caller is blocked on this command.
    pub fn is_waited(&self) -> bool {
        self.0.is_some()
    }

    /// Release the waiting caller, if any.
    pub fn complete(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

struct Slot {
    command: Command,
    ack: Option<Sender<()>>,
}

struct RingState {
    slots: Vec<Option<Slot>>,
    head: usize,
    tail: usize,
    len: usize,
    closed: bool,
}

impl RingState {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(RING_INCREMENT);
        slots.resize_with(RING_INCREMENT, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
            closed: false,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow(&mut self) {
        let old = self.capacity();
        self.slots.resize_with(old + RING_INCREMENT, || None);
        // A full ring has head == tail; everything from head to the old end
        // belongs before the slots at 0..tail.
        if self.head > 0 {
            for index in (self.head..old).rev() {
                self.slots.swap(index, index + RING_INCREMENT);
            }
            self.head += RING_INCREMENT;
        } else {
            self.tail = old;
        }
        trace!(capacity = self.capacity(), "command ring grown");
    }

    fn push_back(&mut self, slot: Slot) {
        if self.len == self.capacity() {
            self.grow();
        }
        let tail = self.tail;
        self.slots[tail] = Some(slot);
        self.tail = (tail + 1) % self.capacity();
        self.len += 1;
    }

    fn push_front(&mut self, slot: Slot) {
        if self.len == self.capacity() {
            self.grow();
        }
        let cap = self.capacity();
        self.head = (self.head + cap - 1) % cap;
        let head = self.head;
        self.slots[head] = Some(slot);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<Slot> {
        if self.len == 0 {
            return None;
        }
        let head = self.head;
        let slot = self.slots[head].take();
        self.head = (head + 1) % self.capacity();
        self.len -= 1;
        slot
    }

    fn front(&self) -> Option<&Slot> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }
}

/// The command ring itself. One per stream.
pub struct CommandRing {
    state: Mutex<RingState>,
    ready: Condvar,
}

impl CommandRing {
    /// Empty ring with [`RING_INCREMENT`] slots.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState::new()),
            ready: Condvar::new(),
        }
    }

    /// Post `command`. With `wait`, the command goes to the head of the ring
    /// and the call returns once the engine acknowledged it.
    pub fn enqueue(&self, command: Command, wait: bool) -> DriverResult<()> {
        if !wait {
            self.post(command, None)?;
            return Ok(());
        }
        let (tx, rx) = bounded(1);
        self.post(command, Some(tx))?;
        rx.recv().map_err(|_| DriverError::InvalidHandle)
    }

    fn post(&self, command: Command, ack: Option<Sender<()>>) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::InvalidHandle);
        }
        trace!(kind = ?command.kind(), waited = ack.is_some(), "enqueue");
        let slot = Slot { command, ack };
        if slot.ack.is_some() {
            state.push_front(slot);
        } else {
            state.push_back(slot);
        }
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the next command without blocking.
    pub fn dequeue(&self) -> Option<(Command, Ack)> {
        let slot = self.state.lock().pop_front()?;
        Some((slot.command, Ack(slot.ack)))
    }

    /// Tag of the next command, leaving it in place.
    pub fn peek(&self) -> Option<CommandKind> {
        self.state.lock().front().map(|slot| slot.command.kind())
    }

    /// Take the next command only if it is of `kind`; check and removal
    /// happen under one lock acquisition.
    pub fn dequeue_if(&self, kind: CommandKind) -> Option<(Command, Ack)> {
        let mut state = self.state.lock();
        if state.front().map(|slot| slot.command.kind()) != Some(kind) {
            return None;
        }
        let slot = state.pop_front()?;
        Some((slot.command, Ack(slot.ack)))
    }

    /// Block until a command is pending or `timeout` elapses (`None` waits
    /// indefinitely). Returns whether a command is pending.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        if state.len > 0 || state.closed {
            return state.len > 0;
        }
        match timeout {
            Some(timeout) => {
                let _ = self.ready.wait_for(&mut state, timeout);
            }
            None => self.ready.wait(&mut state),
        }
        state.len > 0
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether no command is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Refuse further commands and drop pending ones. Blocked callers are
    /// released with [`DriverError::InvalidHandle`].
    pub fn close(&self) -> Vec<Command> {
        let mut state = self.state.lock();
        state.closed = true;
        let mut pending = Vec::with_capacity(state.len);
        while let Some(slot) = state.pop_front() {
            pending.push(slot.command);
        }
        drop(state);
        self.ready.notify_all();
        pending
    }
}

impl Default for CommandRing {
    fn default() -> Self {
        Self::new()
    }
}
