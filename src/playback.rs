//! Streamed playback: a caller-facing [`PlaybackStream`] and the engine thread
//! that feeds queued buffers to the device.
//!
//! The engine keeps submitted headers in a queue and walks a play cursor over
//! it. Each cycle it drains the command ring, refreshes the played count from
//! the device, writes as much of the queue as the device accepts and returns
//! every header whose last byte has been played. It sleeps until the next
//! fragment should have drained or the next header should complete, whichever
//! is sooner, and wakes early when a command arrives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::Quirks;
use crate::dsp::BufferInfo;
use crate::error::{DriverError, DriverResult};
use crate::format::{MmTime, PcmFormat, TimeFormat, bytes_to_time};
use crate::header::{HeaderFlags, Notifier, WaveEvent, WaveHeader};
use crate::ring::Command;
use crate::session::{Capabilities, Negotiation, SessionLease};
use crate::stream::{StreamShared, StreamState, join_engine, min_wait, spawn_engine};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Left/right playback volume, each `0..=0xFFFF`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Volume {
    /// Left channel.
    pub left: u16,
    /// Right channel.
    pub right: u16,
}

impl Volume {
    /// Same level on both channels.
    pub fn both(level: u16) -> Self {
        Self {
            left: level,
            right: level,
        }
    }

    fn to_percent(self) -> (u8, u8) {
        let scale = |v: u16| (v as u32 * 100 / 0xFFFF) as u8;
        (scale(self.left), scale(self.right))
    }

    fn from_percent(left: u8, right: u8) -> Self {
        let scale = |p: u8| (p.min(100) as u32 * 0xFFFF / 100) as u16;
        Self {
            left: scale(left),
            right: scale(right),
        }
    }
}

/// An open playback stream.
///
/// Buffers are played in submission order and returned through the
/// [`Notifier`] given at open, each exactly once.
pub struct PlaybackStream {
    shared: Arc<StreamShared>,
    lease: Option<Arc<SessionLease>>,
    thread: Option<JoinHandle<()>>,
    format: PcmFormat,
    negotiation: Negotiation,
    capabilities: Capabilities,
    volume: Mutex<Option<Volume>>,
}

impl PlaybackStream {
    pub(crate) fn spawn(lease: SessionLease, notifier: Notifier) -> DriverResult<Self> {
        let lease = Arc::new(lease);
        let shared = Arc::new(StreamShared::new(notifier));
        let engine = PlaybackEngine::new(Arc::clone(&shared), Arc::clone(&lease));
        let name = format!("dsp-play-{}", lease.session().index());
        let thread = spawn_engine(name, move |started| engine.run(started))?;
        let stream = Self {
            shared,
            format: lease.format(),
            negotiation: lease.negotiation(),
            capabilities: lease.capabilities(),
            lease: Some(lease),
            thread: Some(thread),
            volume: Mutex::new(None),
        };
        stream.shared.notifier.notify(WaveEvent::Open);
        Ok(stream)
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        Ok(())
    }

    /// Queue `header` for playback. Fails with [`DriverError::InvalidHandle`]
    /// when the header is already queued somewhere.
    pub fn submit(&self, header: Arc<WaveHeader>) -> DriverResult<()> {
        self.check_open()?;
        self.shared.admit(&header)?;
        if let Err(err) = self
            .shared
            .ring
            .enqueue(Command::Submit(Arc::clone(&header)), false)
        {
            self.shared.reject(&header);
            return Err(err);
        }
        Ok(())
    }

    /// Pause; queued buffers stay queued.
    pub fn pause(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Pause, true)
    }

    /// Resume after [`pause`](Self::pause).
    pub fn restart(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Restart, true)
    }

    /// Stop and return every queued buffer.
    pub fn reset(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Reset, true)
    }

    /// Let the active loop finish its current pass and continue after it.
    pub fn break_loop(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::BreakLoop, true)
    }

    /// Bytes played so far.
    pub fn played_bytes(&self) -> u64 {
        self.shared.position()
    }

    /// Bytes handed to the device so far.
    pub fn written_bytes(&self) -> u64 {
        self.shared.transferred()
    }

    /// Playback position in `time_format`.
    pub fn position(&self, time_format: TimeFormat) -> DriverResult<MmTime> {
        self.check_open()?;
        if self.capabilities.contains(Capabilities::SAMPLE_ACCURATE) {
            self.shared.ring.enqueue(Command::RefreshPosition, true)?;
        }
        Ok(bytes_to_time(
            self.shared.position(),
            &self.format,
            time_format,
        ))
    }

    /// Engine state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Format the device runs.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Negotiation outcome.
    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Buffers submitted and not yet returned.
    pub fn queued(&self) -> usize {
        self.shared.in_flight()
    }

    /// Set the device volume through its mixer.
    pub fn set_volume(&self, volume: Volume) -> DriverResult<()> {
        let lease = self.lease.as_ref().ok_or(DriverError::InvalidHandle)?;
        if !self.capabilities.contains(Capabilities::VOLUME) {
            return Err(DriverError::Unsupported);
        }
        let session = lease.session();
        let (left, right) = volume.to_percent();
        session
            .backend()
            .set_mixer_volume(&session.paths().mixer, left, right)?;
        debug!(left, right, "volume set");
        *self.volume.lock() = Some(volume);
        Ok(())
    }

    /// Current device volume. Returns the last value set through this stream
    /// while the mixer still agrees with it, so callers read back what they
    /// wrote despite the mixer's percent resolution.
    pub fn volume(&self) -> DriverResult<Volume> {
        let lease = self.lease.as_ref().ok_or(DriverError::InvalidHandle)?;
        if !self.capabilities.contains(Capabilities::VOLUME) {
            return Err(DriverError::Unsupported);
        }
        let session = lease.session();
        let (left, right) = session.backend().mixer_volume(&session.paths().mixer)?;
        if let Some(last) = *self.volume.lock() {
            if last.to_percent() == (left, right) {
                return Ok(last);
            }
        }
        Ok(Volume::from_percent(left, right))
    }

    /// Close the stream. Fails with [`DriverError::StillActive`] while buffers
    /// are queued.
    pub fn close(&mut self) -> DriverResult<()> {
        self.check_open()?;
        if self.shared.in_flight() > 0 {
            return Err(DriverError::StillActive);
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.shared.ring.enqueue(Command::Closing, true) {
            warn!(%err, "playback engine did not acknowledge close");
        }
        if let Some(thread) = self.thread.take() {
            join_engine(thread);
        }
        self.lease = None;
        self.shared.notifier.notify(WaveEvent::Close);
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if self.shared.in_flight() > 0 {
            if let Err(err) = self.shared.ring.enqueue(Command::Reset, true) {
                warn!(%err, "playback engine did not acknowledge reset on drop");
            }
        }
        self.shutdown();
    }
}

struct Queued {
    seq: u64,
    header: Arc<WaveHeader>,
    /// Value of `written` once the header's last byte is in the device.
    completes_at: u64,
}

struct PlaybackEngine {
    shared: Arc<StreamShared>,
    lease: Arc<SessionLease>,
    format: PcmFormat,
    fragment_size: usize,
    buffer_size: usize,
    quirks: Quirks,
    needs_prime: bool,
    state: StreamState,
    queue: VecDeque<Queued>,
    next_seq: u64,
    /// Header being written.
    play: Option<u64>,
    /// Header that opened the active loop.
    loop_anchor: Option<u64>,
    loops_left: u32,
    /// Bytes of the play header already written.
    partial: usize,
    written: u64,
    played: u64,
    projected_finish: Option<Instant>,
}

impl PlaybackEngine {
    fn new(shared: Arc<StreamShared>, lease: Arc<SessionLease>) -> Self {
        let geometry = lease.geometry();
        let quirks = lease.quirks();
        Self {
            shared,
            format: lease.format(),
            fragment_size: geometry.fragment_size.max(1),
            buffer_size: geometry.buffer_size,
            quirks,
            needs_prime: quirks.contains(Quirks::NEEDS_PRIME),
            lease,
            state: StreamState::Stopped,
            queue: VecDeque::new(),
            next_seq: 0,
            play: None,
            loop_anchor: None,
            loops_left: 0,
            partial: 0,
            written: 0,
            played: 0,
            projected_finish: None,
        }
    }

    fn run(mut self, started: Sender<()>) {
        self.set_state(StreamState::Stopped);
        let _ = started.send(());
        debug!(
            fragment = self.fragment_size,
            buffer = self.buffer_size,
            "playback engine running"
        );
        let mut feed_wait = None;
        let mut notify_wait = None;
        loop {
            self.shared.ring.wait(min_wait(feed_wait, notify_wait));
            if !self.process_commands() {
                break;
            }
            if self.state == StreamState::Playing {
                feed_wait = self.feed();
                notify_wait = self.notify_completions(false);
            } else {
                feed_wait = None;
                notify_wait = None;
            }
        }
        debug!("playback engine exiting");
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "playback state");
        }
        self.state = state;
        self.shared.set_state(state);
    }

    fn publish(&self) {
        self.shared.publish(self.played, self.written);
    }

    fn index_of(&self, seq: u64) -> Option<usize> {
        let front = self.queue.front()?.seq;
        let index = seq.checked_sub(front)? as usize;
        (index < self.queue.len()).then_some(index)
    }

    fn entry(&self, seq: u64) -> Option<&Queued> {
        self.index_of(seq).map(|index| &self.queue[index])
    }

    fn next_after(&self, seq: u64) -> Option<u64> {
        let next = seq + 1;
        self.index_of(next).map(|_| next)
    }

    /// Returns `false` once the engine should exit.
    fn process_commands(&mut self) -> bool {
        while let Some((command, ack)) = self.shared.ring.dequeue() {
            match command {
                Command::Submit(header) => self.append(header),
                Command::Pause => self.pause(),
                Command::Restart => {
                    if self.state == StreamState::Paused {
                        if let Err(err) = self.lease.arm(true) {
                            error!(%err, "cannot re-arm playback");
                        }
                        self.set_state(StreamState::Playing);
                    }
                }
                Command::Reset => self.reset(),
                Command::BreakLoop => {
                    if self.state == StreamState::Playing && self.loop_anchor.is_some() {
                        self.loops_left = 1;
                    }
                }
                Command::RefreshPosition => {
                    if self.state == StreamState::Playing {
                        self.update_played();
                    }
                }
                Command::Closing => {
                    self.set_state(StreamState::Closed);
                    self.shared.ring.close();
                    ack.complete();
                    return false;
                }
                other @ (Command::Start | Command::Stop) => {
                    warn!(kind = ?other.kind(), "command not handled by playback");
                }
            }
            ack.complete();
        }
        true
    }

    fn append(&mut self, header: Arc<WaveHeader>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!(seq, len = header.len(), "header queued");
        self.queue.push_back(Queued {
            seq,
            header,
            completes_at: 0,
        });
        if self.play.is_none() {
            self.begin_header(Some(seq));
        }
        if self.state == StreamState::Stopped {
            if let Err(err) = self.lease.arm(true) {
                error!(%err, "cannot arm playback");
            }
            self.set_state(StreamState::Playing);
        }
    }

    /// Point the play cursor at `seq`, opening a loop if it carries the
    /// begin-loop flag.
    fn begin_header(&mut self, seq: Option<u64>) {
        self.play = seq;
        self.partial = 0;
        let Some(seq) = seq else {
            return;
        };
        let Some(entry) = self.entry(seq) else {
            return;
        };
        if entry.header.flags().contains(HeaderFlags::BEGIN_LOOP) {
            if self.loop_anchor.is_some() {
                warn!(seq, "already in a loop, ignoring nested begin");
            } else {
                let loops = entry.header.loops().max(1);
                trace!(seq, loops, "loop start");
                self.loop_anchor = Some(seq);
                self.loops_left = loops;
            }
        }
    }

    /// Move the play cursor past the header that was just fully written.
    fn advance_play(&mut self) {
        self.partial = 0;
        let Some(seq) = self.play else {
            return;
        };
        let flags = self
            .entry(seq)
            .map(|entry| entry.header.flags())
            .unwrap_or_default();
        if flags.contains(HeaderFlags::END_LOOP) && self.loop_anchor.is_some() {
            self.loops_left = self.loops_left.saturating_sub(1);
            if self.loops_left > 0 {
                trace!(loops_left = self.loops_left, "loop again");
                self.play = self.loop_anchor;
                return;
            }
            // A header that both ends this loop and begins another reopens
            // at itself.
            let next = if self.loop_anchor != Some(seq) && flags.contains(HeaderFlags::BEGIN_LOOP)
            {
                Some(seq)
            } else {
                self.next_after(seq)
            };
            self.loop_anchor = None;
            self.begin_header(next);
        } else {
            let next = self.next_after(seq);
            self.begin_header(next);
        }
    }

    /// Refresh `played` from the device. Returns `None` if the device could
    /// not be queried.
    fn update_played(&mut self) -> Option<BufferInfo> {
        let info = match self.lease.free_space() {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "GETOSPACE failed");
                return None;
            }
        };
        let free = info.bytes.max(0) as usize;
        let not_played = self.buffer_size.saturating_sub(free) as u64;
        let fragsize = info.fragsize.max(0) as u64;

        // Some devices never drain the last partial fragment. Assume it
        // played once enough time has passed, otherwise kick the device.
        if not_played > 0 && not_played < 2 * fragsize {
            let drained = self
                .projected_finish
                .is_some_and(|finish| Instant::now() >= finish);
            if drained {
                trace!(not_played, "treating the tail as played");
                self.played = self.written;
                self.publish();
                return Some(info);
            }
            if let Err(err) = self.lease.dsp().post() {
                warn!(%err, "POST failed");
            }
        }

        self.played = self.played.max(self.written.saturating_sub(not_played));
        self.publish();
        Some(info)
    }

    /// Write as much of the queue as the device accepts. Returns how long to
    /// wait before the next feed, or `None` when there is nothing left to do.
    fn feed(&mut self) -> Option<Duration> {
        let info = self.update_played()?;
        let mut avail = info.bytes.max(0) as usize;

        if info.fragments > 0 {
            if self.play.is_some() && self.partial != 0 {
                self.write_some(&mut avail);
            }
            if self.partial == 0 {
                while let Some(seq) = self.play {
                    if let Some(index) = self.index_of(seq) {
                        let entry = &mut self.queue[index];
                        entry.completes_at = self.written + entry.header.len() as u64;
                    }
                    let finished = self.write_some(&mut avail);
                    if !finished || avail == 0 {
                        break;
                    }
                }
            }
            if self.needs_prime {
                if self.buffer_size < avail + 2 * self.fragment_size {
                    trace!(avail, "priming the device");
                    if let Err(err) = self.lease.dsp().post() {
                        warn!(%err, "POST failed");
                    }
                }
                self.needs_prime = false;
            }
        }

        let unplayed = self.written.saturating_sub(self.played);
        self.projected_finish = Some(Instant::now() + self.format.bytes_to_duration(unplayed));
        self.publish();

        if self.play.is_none() && unplayed == 0 {
            return None;
        }
        Some(
            self.format
                .bytes_to_duration(self.fragment_size as u64)
                .max(MIN_WAIT),
        )
    }

    /// Write from the play header into at most `avail` bytes of device space.
    /// Returns whether the header was finished.
    fn write_some(&mut self, avail: &mut usize) -> bool {
        let Some(entry) = self.play.and_then(|seq| self.entry(seq)) else {
            return false;
        };
        let header = Arc::clone(&entry.header);
        let remaining = header.len().saturating_sub(self.partial);
        let to_write = remaining.min(*avail);
        let mut written = 0;
        if to_write > 0 {
            let data = header.data();
            let start = self.partial.min(data.len());
            let end = (self.partial + to_write).min(data.len());
            match self.lease.dsp().write(&data[start..end]) {
                Ok(n) => written = n,
                Err(err) => {
                    error!(%err, "write to device failed");
                    return false;
                }
            }
            if written == 0 {
                return false;
            }
        }
        *avail -= written;
        self.written += written as u64;
        let finished = written >= remaining;
        if finished {
            self.advance_play();
        } else {
            self.partial += written;
        }
        finished
    }

    /// Return headers whose last byte has played; with `force`, return all of
    /// them. Returns how long until the next header should complete.
    fn notify_completions(&mut self, force: bool) -> Option<Duration> {
        while let Some(front) = self.queue.front() {
            if !force
                && (Some(front.seq) == self.play
                    || Some(front.seq) == self.loop_anchor
                    || front.completes_at > self.played)
            {
                break;
            }
            if let Some(entry) = self.queue.pop_front() {
                trace!(seq = entry.seq, "header done");
                self.shared.complete(entry.header);
            }
        }
        let front = self.queue.front()?;
        if Some(front.seq) == self.play || Some(front.seq) == self.loop_anchor {
            return None;
        }
        let pending = front.completes_at.saturating_sub(self.played);
        Some(self.format.bytes_to_duration(pending).max(MIN_WAIT))
    }

    fn pause(&mut self) {
        if let Err(err) = self.lease.arm(false) {
            warn!(%err, "cannot disarm playback");
        }
        self.update_played();
        self.notify_completions(false);
        if let Err(err) = self.lease.flush() {
            error!(%err, "cannot flush playback");
        }
        self.needs_prime = self.quirks.contains(Quirks::NEEDS_PRIME);

        if self.loop_anchor.is_some() {
            // Replay the loop from its start.
            self.play = self.loop_anchor;
            self.partial = 0;
        } else {
            let mut queued = self.partial as u64;
            for entry in &self.queue {
                if Some(entry.seq) == self.play {
                    break;
                }
                queued += entry.header.len() as u64;
            }
            let unplayed = self.written.saturating_sub(self.played);
            self.partial = queued.saturating_sub(unplayed) as usize;
            self.play = self.queue.front().map(|entry| entry.seq);
        }
        self.written = self.played;
        self.projected_finish = None;
        self.publish();
        debug!(played = self.played, partial = self.partial, "playback paused");
        self.set_state(StreamState::Paused);
    }

    fn reset(&mut self) {
        if let Err(err) = self.lease.arm(false) {
            warn!(%err, "cannot disarm playback");
        }
        self.update_played();
        self.notify_completions(false);
        if let Err(err) = self.lease.flush() {
            error!(%err, "cannot flush playback");
        }
        self.notify_completions(true);

        // Submissions still behind the reset in the ring go back too.
        while let Some((command, ack)) = self.shared.ring.dequeue() {
            match command {
                Command::Submit(header) => self.shared.complete(header),
                other => debug!(kind = ?other.kind(), "dropping command queued behind reset"),
            }
            ack.complete();
        }

        self.play = None;
        self.loop_anchor = None;
        self.loops_left = 0;
        self.partial = 0;
        self.written = 0;
        self.played = 0;
        self.projected_finish = None;
        self.needs_prime = self.quirks.contains(Quirks::NEEDS_PRIME);
        self.publish();
        debug!("playback reset");
        self.set_state(StreamState::Stopped);
    }
}

#[cfg(test)]
impl PlaybackEngine {
    fn cursor(&self) -> (Option<u64>, Option<u64>, u32) {
        (self.play, self.loop_anchor, self.loops_left)
    }
}

#[cfg(test)]
mod tests {
    //! Cursor movement through loops, driven without a running thread.

    use super::*;
    use crate::config::{DevicePaths, DriverConfig};
    use crate::dsp::{Access, Direction, LoopbackBackend, LoopbackSpec};
    use crate::format::stream_fragment_word;
    use crate::manager::DeviceManager;
    use crate::session::OpenRequest;

    fn engine() -> (DeviceManager, PlaybackEngine) {
        let backend = Arc::new(LoopbackBackend::new());
        backend.add_device("/dev/dsp", LoopbackSpec::default());
        let manager = DeviceManager::init(
            DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]),
            backend,
        );
        let format = PcmFormat::stereo16(48_000);
        let lease = manager
            .acquire(
                0,
                OpenRequest {
                    direction: Direction::Output,
                    access: Access::WriteOnly,
                    fragment: stream_fragment_word(&format),
                    format,
                    strict: true,
                },
            )
            .expect("acquire");
        let shared = Arc::new(StreamShared::new(Notifier::None));
        let engine = PlaybackEngine::new(shared, Arc::new(lease));
        (manager, engine)
    }

    fn header(len: usize) -> Arc<WaveHeader> {
        Arc::new(WaveHeader::new(vec![0; len]))
    }

    #[test]
    fn loop_returns_to_anchor_until_exhausted() {
        let (_manager, mut engine) = engine();
        engine.append(Arc::new(WaveHeader::new(vec![0; 4]).begin_loop(2)));
        engine.append(Arc::new(WaveHeader::new(vec![0; 4]).end_loop()));
        engine.append(header(4));
        assert_eq!(engine.cursor(), (Some(0), Some(0), 2));

        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(1), Some(0), 2));
        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(0), Some(0), 1));
        engine.advance_play();
        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(2), None, 0));
        engine.advance_play();
        assert_eq!(engine.play, None);
    }

    #[test]
    fn zero_loop_count_plays_once() {
        let (_manager, mut engine) = engine();
        engine.append(Arc::new(
            WaveHeader::new(vec![0; 4]).begin_loop(0).end_loop(),
        ));
        assert_eq!(engine.cursor(), (Some(0), Some(0), 1));
        engine.advance_play();
        assert_eq!(engine.cursor(), (None, None, 0));
    }

    #[test]
    fn nested_begin_is_ignored() {
        let (_manager, mut engine) = engine();
        engine.append(Arc::new(WaveHeader::new(vec![0; 4]).begin_loop(3)));
        engine.append(Arc::new(WaveHeader::new(vec![0; 4]).begin_loop(5)));
        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(1), Some(0), 3));
    }

    #[test]
    fn break_loop_finishes_current_pass() {
        let (_manager, mut engine) = engine();
        engine.append(Arc::new(
            WaveHeader::new(vec![0; 4]).begin_loop(10).end_loop(),
        ));
        engine.append(header(4));
        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(0), Some(0), 9));
        engine.loops_left = 1;
        engine.advance_play();
        assert_eq!(engine.cursor(), (Some(1), None, 0));
    }

    #[test]
    fn first_submit_arms_and_plays() {
        let (manager, mut engine) = engine();
        engine.append(header(16));
        assert_eq!(engine.state, StreamState::Playing);
        assert!(manager.session(0).expect("session").is_armed(Direction::Output));
    }
}
