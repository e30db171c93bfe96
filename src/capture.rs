//! Streamed capture: a caller-facing [`CaptureStream`] and the engine thread
//! that reads device fragments into queued buffers.
//!
//! Fragments are read straight into the current buffer when it has room for
//! a whole one. Otherwise the fragment goes through a scratch buffer and is
//! split across as many queued buffers as it takes; buffers still waiting in
//! the command ring are pulled forward for that. Whatever is left once no
//! buffer remains is dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, trace, warn};

use crate::error::{DriverError, DriverResult};
use crate::format::{MmTime, PcmFormat, TimeFormat, bytes_to_time};
use crate::header::{Notifier, WaveEvent, WaveHeader};
use crate::ring::{Command, CommandKind};
use crate::session::{Capabilities, Negotiation, SessionLease};
use crate::stream::{StreamShared, StreamState, join_engine, spawn_engine};

/// An open capture stream.
pub struct CaptureStream {
    shared: Arc<StreamShared>,
    lease: Option<Arc<SessionLease>>,
    thread: Option<JoinHandle<()>>,
    format: PcmFormat,
    negotiation: Negotiation,
    capabilities: Capabilities,
}

impl CaptureStream {
    pub(crate) fn spawn(lease: SessionLease, notifier: Notifier) -> DriverResult<Self> {
        let lease = Arc::new(lease);
        let shared = Arc::new(StreamShared::new(notifier));
        let engine = CaptureEngine::new(Arc::clone(&shared), Arc::clone(&lease));
        let name = format!("dsp-rec-{}", lease.session().index());
        let thread = spawn_engine(name, move |started| engine.run(started))?;
        let stream = Self {
            shared,
            format: lease.format(),
            negotiation: lease.negotiation(),
            capabilities: lease.capabilities(),
            lease: Some(lease),
            thread: Some(thread),
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

    /// Queue an empty buffer to record into.
    pub fn submit(&self, header: Arc<WaveHeader>) -> DriverResult<()> {
        self.check_open()?;
        self.shared.admit(&header)?;
        header.reset_recorded();
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

    /// Start recording.
    pub fn start(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Start, true)
    }

    /// Stop recording; a partially filled buffer is returned.
    pub fn stop(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Stop, true)
    }

    /// Stop recording and return every queued buffer.
    pub fn reset(&self) -> DriverResult<()> {
        self.check_open()?;
        self.shared.ring.enqueue(Command::Reset, true)
    }

    /// Bytes recorded so far.
    pub fn recorded_bytes(&self) -> u64 {
        self.shared.position()
    }

    /// Bytes read out of the device so far.
    pub fn read_bytes(&self) -> u64 {
        self.shared.transferred()
    }

    /// Recording position in `time_format`.
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
            warn!(%err, "capture engine did not acknowledge close");
        }
        if let Some(thread) = self.thread.take() {
            join_engine(thread);
        }
        self.lease = None;
        self.shared.notifier.notify(WaveEvent::Close);
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if self.shared.in_flight() > 0 {
            if let Err(err) = self.shared.ring.enqueue(Command::Reset, true) {
                warn!(%err, "capture engine did not acknowledge reset on drop");
            }
        }
        self.shutdown();
    }
}

struct CaptureEngine {
    shared: Arc<StreamShared>,
    lease: Arc<SessionLease>,
    format: PcmFormat,
    fragment_size: usize,
    trigger: bool,
    state: StreamState,
    queue: VecDeque<Arc<WaveHeader>>,
    scratch: Vec<u8>,
    /// Bytes read from the device.
    read: u64,
    /// Bytes the device has recorded, including what is not read yet.
    recorded: u64,
}

impl CaptureEngine {
    fn new(shared: Arc<StreamShared>, lease: Arc<SessionLease>) -> Self {
        let fragment_size = lease.geometry().fragment_size.max(1);
        Self {
            shared,
            format: lease.format(),
            fragment_size,
            trigger: lease.capabilities().contains(Capabilities::TRIGGER),
            lease,
            state: StreamState::Stopped,
            queue: VecDeque::new(),
            scratch: vec![0; fragment_size],
            read: 0,
            recorded: 0,
        }
    }

    fn run(mut self, started: Sender<()>) {
        if self.trigger {
            if let Err(err) = self.lease.arm(false) {
                warn!(%err, "cannot disarm capture at startup");
            }
        }
        self.set_state(StreamState::Stopped);
        let _ = started.send(());
        debug!(fragment = self.fragment_size, "capture engine running");
        let fragment_time = self.format.bytes_to_duration(self.fragment_size as u64);
        loop {
            if self.state == StreamState::Playing {
                self.capture();
            }
            let timeout = (self.state == StreamState::Playing)
                .then(|| fragment_time.max(Duration::from_millis(1)));
            self.shared.ring.wait(timeout);
            if !self.process_commands() {
                break;
            }
        }
        debug!("capture engine exiting");
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "capture state");
        }
        self.state = state;
        self.shared.set_state(state);
    }

    fn publish(&self) {
        self.shared.publish(self.recorded, self.read);
    }

    fn process_commands(&mut self) -> bool {
        while let Some((command, ack)) = self.shared.ring.dequeue() {
            match command {
                Command::Submit(header) => {
                    trace!(len = header.len(), "capture buffer queued");
                    self.queue.push_back(header);
                }
                Command::Start => self.start(),
                Command::Stop => self.stop(),
                Command::Reset => self.reset(),
                Command::RefreshPosition => self.refresh_position(),
                Command::Closing => {
                    self.set_state(StreamState::Closed);
                    self.shared.ring.close();
                    ack.complete();
                    return false;
                }
                other => warn!(kind = ?other.kind(), "command not handled by capture"),
            }
            ack.complete();
        }
        true
    }

    fn start(&mut self) {
        if self.state == StreamState::Playing {
            return;
        }
        if self.trigger {
            if let Err(err) = self.lease.arm(true) {
                error!(%err, "cannot arm capture");
            }
        } else {
            // Devices without trigger support start recording on first read.
            let mut kick = [0u8; 4];
            if let Err(err) = self.lease.dsp().read(&mut kick) {
                warn!(%err, "kick-off read failed");
            }
        }
        debug!("capture started");
        self.set_state(StreamState::Playing);
    }

    fn stop(&mut self) {
        if self.state != StreamState::Playing {
            return;
        }
        let partial = self
            .queue
            .front()
            .is_some_and(|header| header.bytes_recorded() > 0);
        if partial {
            if let Some(header) = self.queue.pop_front() {
                self.shared.complete(header);
            }
        }
        if self.trigger {
            if let Err(err) = self.lease.arm(false) {
                warn!(%err, "cannot disarm capture");
            }
        }
        debug!("capture stopped");
        self.set_state(StreamState::Stopped);
    }

    fn reset(&mut self) {
        if self.trigger {
            if let Err(err) = self.lease.arm(false) {
                warn!(%err, "cannot disarm capture");
            }
        }
        while let Some(header) = self.queue.pop_front() {
            self.shared.complete(header);
        }
        while let Some((command, ack)) = self.shared.ring.dequeue_if(CommandKind::Submit) {
            if let Command::Submit(header) = command {
                self.shared.complete(header);
            }
            ack.complete();
        }
        self.read = 0;
        self.recorded = 0;
        self.publish();
        debug!("capture reset");
        self.set_state(StreamState::Stopped);
    }

    fn refresh_position(&mut self) {
        match self.lease.free_space() {
            Ok(info) => {
                self.recorded = self.read + info.bytes.max(0) as u64;
                self.publish();
            }
            Err(err) => error!(%err, "GETISPACE failed"),
        }
    }

    /// Front buffer with room left, pulling one forward from the ring when
    /// the queue has run dry.
    fn destination(&mut self) -> Option<Arc<WaveHeader>> {
        loop {
            if let Some(header) = self.queue.front() {
                if header.bytes_recorded() < header.len() {
                    return Some(Arc::clone(header));
                }
                if let Some(full) = self.queue.pop_front() {
                    self.shared.complete(full);
                }
                continue;
            }
            let (command, ack) = self.shared.ring.dequeue_if(CommandKind::Submit)?;
            ack.complete();
            if let Command::Submit(header) = command {
                trace!(len = header.len(), "pulled capture buffer from the ring");
                self.queue.push_back(header);
            }
        }
    }

    fn finish_if_full(&mut self, header: &Arc<WaveHeader>) {
        if header.bytes_recorded() < header.len() {
            return;
        }
        if let Some(front) = self.queue.front() {
            if Arc::ptr_eq(front, header) {
                if let Some(full) = self.queue.pop_front() {
                    self.shared.complete(full);
                }
            }
        }
    }

    fn capture(&mut self) {
        let info = match self.lease.free_space() {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "GETISPACE failed");
                return;
            }
        };
        let mut fragments = info.fragments.max(0);
        while fragments > 0 && !self.queue.is_empty() {
            let Some(header) = self.destination() else {
                break;
            };
            let room = header.len() - header.bytes_recorded();
            if room >= self.fragment_size {
                let n = {
                    let mut data = header.data();
                    let start = header.bytes_recorded().min(data.len());
                    let end = (start + self.fragment_size).min(data.len());
                    match self.lease.dsp().read(&mut data[start..end]) {
                        Ok(n) => n,
                        Err(err) => {
                            error!(%err, "read from device failed");
                            return;
                        }
                    }
                };
                if n == 0 {
                    break;
                }
                header.set_recorded(header.bytes_recorded() + n);
                self.read += n as u64;
                self.finish_if_full(&header);
            } else {
                let n = match self.lease.dsp().read(&mut self.scratch) {
                    Ok(n) => n,
                    Err(err) => {
                        error!(%err, "read from device failed");
                        return;
                    }
                };
                if n == 0 {
                    break;
                }
                self.read += n as u64;
                self.spread(n);
            }
            fragments -= 1;
        }
        self.recorded = self.recorded.max(self.read);
        self.publish();
    }

    /// Copy the first `n` scratch bytes across as many buffers as needed.
    fn spread(&mut self, n: usize) {
        let mut offset = 0;
        while offset < n {
            let Some(header) = self.destination() else {
                warn!(dropped = n - offset, "no capture buffer left, dropping data");
                return;
            };
            let recorded = header.bytes_recorded();
            let take = (header.len() - recorded).min(n - offset);
            {
                let mut data = header.data();
                let end = (recorded + take).min(data.len());
                let start = recorded.min(end);
                data[start..end].copy_from_slice(&self.scratch[offset..offset + (end - start)]);
            }
            header.set_recorded(recorded + take);
            offset += take;
            self.finish_if_full(&header);
        }
    }
}
