//! Position watcher for mapped buffers.
//!
//! One thread per buffer. It polls the hardware descriptor together with a
//! private wake pipe, turns hardware cursor movement into a wrap-aware byte
//! delta, and fires every notification offset the cursor passed. When the
//! caller's buffer is a staging copy it also moves that many bytes between
//! the staging buffer and the hardware region. Starting and stopping DMA
//! happens on this thread, so the armed bit has a single writer.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::dma::{DmaView, copy_wrapped, ring_distance};
use crate::dsp::Direction;
use crate::error::{DriverError, DriverResult};
use crate::session::SessionLease;

/// A byte offset in the buffer and the channel signalled when the device
/// cursor passes it. The offset is sent on the channel.
#[derive(Clone, Debug)]
pub struct PositionNotification {
    /// Offset in the caller-visible buffer.
    pub offset: usize,
    /// Signalled with `offset` each time the cursor passes it.
    pub signal: Sender<usize>,
}

#[derive(Default)]
struct NotifyTable {
    entries: Vec<PositionNotification>,
    /// Round-robin index of the next offset the cursor will reach.
    next: usize,
}

/// State read by the caller while the watcher runs.
pub(crate) struct WatchShared {
    pub(crate) role: Direction,
    pub(crate) len: usize,
    pub(crate) fragment: usize,
    cursor: AtomicUsize,
    running: AtomicBool,
    notifications: Mutex<NotifyTable>,
}

impl WatchShared {
    pub(crate) fn new(role: Direction, len: usize, fragment: usize) -> Self {
        Self {
            role,
            len,
            fragment,
            cursor: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            notifications: Mutex::new(NotifyTable::default()),
        }
    }

    /// Device cursor in caller-buffer bytes.
    pub(crate) fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_notifications(&self, mut entries: Vec<PositionNotification>) -> DriverResult<()> {
        if entries.iter().any(|n| n.offset >= self.len) {
            return Err(DriverError::FormatUnsupported(
                "notification offset past the end of the buffer".into(),
            ));
        }
        entries.sort_by_key(|n| n.offset);
        let cursor = self.cursor();
        let next = entries
            .iter()
            .position(|n| n.offset >= cursor)
            .unwrap_or(0);
        let mut table = self.notifications.lock();
        table.entries = entries;
        table.next = next;
        Ok(())
    }

    /// Advance the cursor by `delta` and fire what it passed.
    fn advance(&self, delta: usize) {
        if delta == 0 || self.len == 0 {
            return;
        }
        let old = self.cursor();
        self.cursor.store((old + delta) % self.len, Ordering::Release);

        let mut table = self.notifications.lock();
        let count = table.entries.len();
        if count == 0 {
            return;
        }
        // Fire at most one lap's worth per step.
        for _ in 0..count {
            let entry = &table.entries[table.next];
            if ring_distance(old, entry.offset, self.len) >= delta {
                break;
            }
            trace!(offset = entry.offset, "position notification");
            let _ = entry.signal.send(entry.offset);
            table.next = (table.next + 1) % count;
        }
    }
}

/// Requests the caller sends to the watcher.
pub(crate) enum WatchCommand {
    Start,
    Stop,
    Shutdown,
}

pub(crate) type WatchRequest = (WatchCommand, Sender<DriverResult<()>>);

/// Self-pipe used to interrupt `poll`.
pub(crate) struct WakePipe {
    read: File,
    write: File,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
        Ok(Self {
            read: File::from(read),
            write: File::from(write),
        })
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = (&self.write).write(&[1]) {
            warn!(%err, "cannot wake mapped buffer watcher");
        }
    }

    fn drain(&self) {
        let mut scratch = [0u8; 64];
        let _ = (&self.read).read(&mut scratch);
    }
}

/// Everything the watcher thread owns.
pub(crate) struct Watcher {
    pub(crate) shared: Arc<WatchShared>,
    pub(crate) lease: Arc<SessionLease>,
    pub(crate) hardware: DmaView,
    pub(crate) client: DmaView,
    pub(crate) requests: Receiver<WatchRequest>,
    pub(crate) pipe: Arc<WakePipe>,
    pub(crate) tick: Duration,
}

struct Cursors {
    /// Hardware pointer seen on the previous poll.
    hw_last: usize,
    /// Next caller-buffer offset to copy into the hardware region.
    client_feed: usize,
}

impl Watcher {
    fn staged(&self) -> bool {
        !self.client.same_region(&self.hardware)
    }

    fn hardware_pointer(&self) -> Option<usize> {
        match self.lease.position() {
            Ok(info) => Some(info.ptr.max(0) as usize % self.hardware.len().max(1)),
            Err(err) => {
                error!(%err, "cannot read hardware pointer");
                None
            }
        }
    }

    pub(crate) fn run(self, started: Sender<()>) {
        let _ = started.send(());
        let staged = self.staged();
        debug!(
            role = ?self.shared.role,
            staged,
            len = self.shared.len,
            hw_len = self.hardware.len(),
            "mapped buffer watcher running"
        );
        let hw_fd = self.lease.dsp().poll_fd();
        let mut cursors = Cursors {
            hw_last: 0,
            client_feed: 0,
        };
        loop {
            if let Err(err) = self.wait(hw_fd) {
                error!(%err, "poll failed, stopping watcher");
                break;
            }
            if !self.handle_requests(&mut cursors) {
                break;
            }
            if self.shared.is_running() {
                self.step(&mut cursors, staged);
            }
        }
        debug!("mapped buffer watcher exiting");
    }

    fn wait(&self, hw_fd: Option<RawFd>) -> io::Result<()> {
        let running = self.shared.is_running();
        let pipe_fd = self.pipe.read.as_fd();
        // SAFETY: the descriptor belongs to the lease, which outlives this call.
        let hw = hw_fd
            .filter(|_| running)
            .map(|fd| unsafe { BorrowedFd::borrow_raw(fd) });
        let hw_events = match self.shared.role {
            Direction::Output => PollFlags::POLLOUT,
            Direction::Input => PollFlags::POLLIN,
        };
        let mut fds = vec![PollFd::new(pipe_fd, PollFlags::POLLIN)];
        if let Some(hw) = hw {
            fds.push(PollFd::new(hw, hw_events));
        }
        let timeout = if running {
            let ms = self.tick.as_millis().clamp(1, u16::MAX as u128) as u16;
            PollTimeout::from(ms)
        } else {
            PollTimeout::NONE
        };
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(err) => return Err(io::Error::from(err)),
        }
        let woken = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        if woken {
            self.pipe.drain();
        }
        Ok(())
    }

    /// Returns `false` on shutdown.
    fn handle_requests(&self, cursors: &mut Cursors) -> bool {
        loop {
            let (command, reply) = match self.requests.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };
            let result = match command {
                WatchCommand::Start => self.start(cursors),
                WatchCommand::Stop => self.stop(),
                WatchCommand::Shutdown => {
                    let result = if self.shared.is_running() {
                        self.stop()
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result);
                    return false;
                }
            };
            let _ = reply.send(result);
        }
    }

    fn start(&self, cursors: &mut Cursors) -> DriverResult<()> {
        if self.shared.is_running() {
            return Ok(());
        }
        let hw_now = self.hardware_pointer().ok_or(DriverError::InvalidHandle)?;
        cursors.hw_last = hw_now;
        let cursor = self.shared.cursor();
        if self.staged() && self.shared.role == Direction::Output {
            // Fill the whole hardware ring ahead of the device.
            let hw_len = self.hardware.len();
            copy_wrapped(&self.client, cursor, &self.hardware, hw_now, hw_len);
            cursors.client_feed = (cursor + hw_len) % self.client.len().max(1);
        } else if !self.staged() {
            self.shared.cursor.store(hw_now, Ordering::Release);
        }
        self.lease.arm(true)?;
        self.shared.running.store(true, Ordering::Release);
        debug!(hw = hw_now, cursor, "mapped buffer started");
        Ok(())
    }

    fn stop(&self) -> DriverResult<()> {
        self.shared.running.store(false, Ordering::Release);
        self.lease.arm(false)?;
        debug!(cursor = self.shared.cursor(), "mapped buffer stopped");
        Ok(())
    }

    fn step(&self, cursors: &mut Cursors, staged: bool) {
        let Some(hw_now) = self.hardware_pointer() else {
            return;
        };
        let delta = ring_distance(cursors.hw_last, hw_now, self.hardware.len());
        if delta == 0 {
            return;
        }
        if staged {
            match self.shared.role {
                Direction::Output => {
                    // The device is done with [hw_last, hw_now); refill it.
                    copy_wrapped(
                        &self.client,
                        cursors.client_feed,
                        &self.hardware,
                        cursors.hw_last,
                        delta,
                    );
                    cursors.client_feed = (cursors.client_feed + delta) % self.client.len();
                }
                Direction::Input => {
                    copy_wrapped(
                        &self.hardware,
                        cursors.hw_last,
                        &self.client,
                        self.shared.cursor(),
                        delta,
                    );
                }
            }
        }
        cursors.hw_last = hw_now;
        self.shared.advance(delta);
    }
}
