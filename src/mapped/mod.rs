//! Mapped device buffers for a mixing engine.
//!
//! When the requested length divides into a fragment layout the device
//! accepts, the caller's buffer *is* the DMA region and the caller writes
//! (or reads) it directly through [`MappedBuffer::dma_view`]. Otherwise the
//! caller gets a staging buffer of the requested length, reached through
//! [`MappedBuffer::lock`], and a watcher thread copies between it and the
//! hardware region as the device cursor moves. In both modes the watcher
//! tracks the cursor and fires position notifications.

pub mod dma;
mod watcher;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded, unbounded};
use tracing::{debug, info, warn};

use crate::config::Quirks;
use crate::dsp::{Access, Direction};
use crate::error::{DriverError, DriverResult};
use crate::format::{
    MAPPED_FRAGMENT_COARSE, MAPPED_FRAGMENT_PRECISE, PcmFormat, direct_fragment_word,
    split_fragment_word,
};
use crate::manager::DeviceManager;
use crate::session::{Capabilities, DeviceSession, OpenRequest, SessionLease};
use crate::stream::{join_engine, spawn_engine};

pub use dma::DmaView;
pub use watcher::PositionNotification;

use watcher::{WakePipe, WatchCommand, WatchRequest, WatchShared, Watcher};

/// How a [`MappedBuffer`] reaches the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    /// The caller's buffer is the DMA region.
    Direct,
    /// A watcher thread copies between a staging buffer and the DMA region.
    Staged,
}

/// Device cursor positions, in caller-buffer bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPosition {
    /// Render buffer.
    Render {
        /// Byte the device is playing.
        play: usize,
        /// First byte that is safe to write.
        write: usize,
    },
    /// Capture buffer.
    Capture {
        /// Byte the device is recording into.
        capture: usize,
        /// End of the data that is safe to read.
        read: usize,
    },
}

/// A locked span of a staging buffer, split at the wrap point.
///
/// Dropping the guard unlocks it.
pub struct MappedLock<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
}

impl MappedLock<'_> {
    /// Part up to the end of the buffer.
    pub fn first(&mut self) -> &mut [u8] {
        &mut *self.first
    }

    /// Part wrapped around to the start of the buffer; empty when the span
    /// does not wrap.
    pub fn second(&mut self) -> &mut [u8] {
        &mut *self.second
    }

    /// Total locked length.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Whether nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` over the locked span. Returns the bytes copied.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let first = data.len().min(self.first.len());
        self.first[..first].copy_from_slice(&data[..first]);
        let second = (data.len() - first).min(self.second.len());
        self.second[..second].copy_from_slice(&data[first..first + second]);
        first + second
    }

    /// Copy the locked span into `out`. Returns the bytes copied.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let first = out.len().min(self.first.len());
        out[..first].copy_from_slice(&self.first[..first]);
        let second = (out.len() - first).min(self.second.len());
        out[first..first + second].copy_from_slice(&self.second[..second]);
        first + second
    }
}

/// A buffer whose contents the device plays from or records into.
pub struct MappedBuffer {
    lease: Option<Arc<SessionLease>>,
    mode: BufferMode,
    format: PcmFormat,
    client: DmaView,
    shared: Arc<WatchShared>,
    requests: Sender<WatchRequest>,
    pipe: Arc<WakePipe>,
    thread: Option<JoinHandle<()>>,
    quirks: Quirks,
    capabilities: Capabilities,
}

impl MappedBuffer {
    pub(crate) fn create(
        manager: &DeviceManager,
        session: &Arc<DeviceSession>,
        format: PcmFormat,
        length: usize,
        role: Direction,
    ) -> DriverResult<Self> {
        let capabilities = session.capabilities();
        if !capabilities.contains(Capabilities::DIRECT_MAP) {
            return Err(DriverError::Unsupported);
        }
        if length == 0 || length % format.block_align().max(1) != 0 {
            return Err(DriverError::FormatUnsupported(format!(
                "buffer length {length} is not a whole number of frames"
            )));
        }
        let index = session.index();
        let preferred = if capabilities.contains(Capabilities::SAMPLE_ACCURATE) {
            MAPPED_FRAGMENT_PRECISE
        } else {
            MAPPED_FRAGMENT_COARSE
        };
        let request = |fragment| OpenRequest {
            direction: role,
            access: Access::ReadWrite,
            fragment,
            format,
            strict: true,
        };

        let (_, max_shift) = split_fragment_word(preferred);
        let mut direct = None;
        if let Some(word) = direct_fragment_word(&format, length, max_shift) {
            let lease = manager.acquire(index, request(word))?;
            if lease.geometry().buffer_size == length {
                direct = Some(lease);
            } else {
                debug!(
                    length,
                    granted = lease.geometry().buffer_size,
                    "device refused a matching layout, staging instead"
                );
                manager.release(lease);
            }
        }
        let mode = if direct.is_some() {
            BufferMode::Direct
        } else {
            BufferMode::Staged
        };
        let lease = match direct {
            Some(lease) => lease,
            None => manager.acquire(index, request(preferred))?,
        };
        let lease = Arc::new(lease);
        lease.arm(false)?;

        let geometry = lease.geometry();
        let hardware = lease
            .dsp()
            .map_dma(geometry.buffer_size)
            .map(DmaView::new)
            .map_err(map_error)?;
        let client = match mode {
            BufferMode::Direct => hardware.clone(),
            BufferMode::Staged => DmaView::anonymous(length).map_err(map_error)?,
        };
        let fill = dma::silence(&format);
        hardware.fill(fill);
        client.fill(fill);

        let shared = Arc::new(WatchShared::new(
            role,
            length,
            geometry.fragment_size.min(length),
        ));
        let pipe = Arc::new(WakePipe::new()?);
        let (requests, inbox) = unbounded();
        let watcher = Watcher {
            shared: Arc::clone(&shared),
            lease: Arc::clone(&lease),
            hardware,
            client: client.clone(),
            requests: inbox,
            pipe: Arc::clone(&pipe),
            tick: format.bytes_to_duration(geometry.fragment_size as u64),
        };
        let thread = spawn_engine(format!("dsp-map-{index}"), move |started| {
            watcher.run(started)
        })?;

        info!(
            path = %session.paths().dsp,
            ?mode,
            ?role,
            length,
            hw_len = geometry.buffer_size,
            "mapped buffer created"
        );
        Ok(Self {
            quirks: lease.quirks(),
            lease: Some(lease),
            mode,
            format,
            client,
            shared,
            requests,
            pipe,
            thread: Some(thread),
            capabilities,
        })
    }

    fn send(&self, command: WatchCommand) -> DriverResult<()> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        let (reply, result) = bounded(1);
        self.requests
            .send((command, reply))
            .map_err(|_| DriverError::InvalidHandle)?;
        self.pipe.wake();
        result.recv().map_err(|_| DriverError::InvalidHandle)?
    }

    /// Whether the caller's buffer is the DMA region.
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Whether the buffer is mapped directly.
    pub fn is_direct(&self) -> bool {
        self.mode == BufferMode::Direct
    }

    /// Caller-visible length in bytes.
    pub fn len(&self) -> usize {
        self.client.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.client.is_empty()
    }

    /// Render or capture.
    pub fn role(&self) -> Direction {
        self.shared.role
    }

    /// Format the device runs.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Whether DMA is running.
    pub fn is_playing(&self) -> bool {
        self.shared.is_running()
    }

    /// The DMA region itself, when mapped directly.
    pub fn dma_view(&self) -> Option<DmaView> {
        match self.mode {
            BufferMode::Direct => Some(self.client.clone()),
            BufferMode::Staged => None,
        }
    }

    /// Start DMA. A staged render buffer first fills the hardware region
    /// from the current position.
    pub fn play(&self) -> DriverResult<()> {
        self.send(WatchCommand::Start)
    }

    /// Stop DMA. Fails with [`DriverError::MustRecreate`] on backends that
    /// keep running until the device is closed.
    pub fn stop(&self) -> DriverResult<()> {
        self.send(WatchCommand::Stop)?;
        if self.quirks.contains(Quirks::STOP_NEEDS_CLOSE) {
            warn!("backend cannot stop mapped DMA without closing");
            return Err(DriverError::MustRecreate);
        }
        Ok(())
    }

    /// Current device cursor.
    pub fn position(&self) -> DriverResult<BufferPosition> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        let len = self.len();
        let cursor = self.shared.cursor();
        Ok(match self.shared.role {
            Direction::Output => BufferPosition::Render {
                play: cursor,
                write: (cursor + self.shared.fragment) % len,
            },
            Direction::Input => BufferPosition::Capture {
                capture: cursor,
                read: cursor,
            },
        })
    }

    /// Lock `len` bytes from `offset` of a staging buffer. A direct mapping
    /// is already caller-visible and returns [`DriverError::Unsupported`].
    pub fn lock(&mut self, offset: usize, len: usize) -> DriverResult<MappedLock<'_>> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        if self.mode == BufferMode::Direct {
            return Err(DriverError::Unsupported);
        }
        if offset >= self.len() {
            return Err(DriverError::FormatUnsupported(format!(
                "lock offset {offset} past the end of the buffer"
            )));
        }
        let ((first_ptr, first_len), (second_ptr, second_len)) = self.client.split_at(offset, len);
        // SAFETY: both halves lie inside the staging mapping, do not overlap,
        // and the guard borrows `self` mutably so no second lock exists. The
        // watcher only touches bytes the device cursor has released.
        let (first, second) = unsafe {
            (
                std::slice::from_raw_parts_mut(first_ptr, first_len),
                std::slice::from_raw_parts_mut(second_ptr, second_len),
            )
        };
        Ok(MappedLock { first, second })
    }

    /// Set attenuation and pan, both in hundredths of a decibel. Capture
    /// buffers have no volume.
    pub fn set_volume_pan(&self, attenuation: i32, pan: i32) -> DriverResult<()> {
        let lease = self.lease.as_ref().ok_or(DriverError::InvalidHandle)?;
        if self.shared.role == Direction::Input || !self.capabilities.contains(Capabilities::VOLUME)
        {
            return Err(DriverError::Unsupported);
        }
        let (left, right) = volume_pan_to_percent(attenuation, pan);
        let session = lease.session();
        session
            .backend()
            .set_mixer_volume(&session.paths().mixer, left, right)?;
        debug!(attenuation, pan, left, right, "mapped buffer volume set");
        Ok(())
    }

    /// Replace the position notifications.
    pub fn set_notification_positions(
        &self,
        notifications: Vec<PositionNotification>,
    ) -> DriverResult<()> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        self.shared.set_notifications(notifications)
    }

    /// Stop the watcher and release the device.
    pub fn close(&mut self) -> DriverResult<()> {
        if self.lease.is_none() {
            return Err(DriverError::InvalidHandle);
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.send(WatchCommand::Shutdown) {
            warn!(%err, "mapped buffer watcher did not stop cleanly");
        }
        if let Some(thread) = self.thread.take() {
            join_engine(thread);
        }
        self.lease = None;
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if self.lease.is_some() {
            self.shutdown();
        }
    }
}

fn map_error(err: std::io::Error) -> DriverError {
    if err.raw_os_error() == Some(nix::libc::ENOMEM) {
        DriverError::OutOfMemory
    } else {
        DriverError::Io(err)
    }
}

/// Convert attenuation and pan in hundredths of a decibel into mixer
/// percentages. Positive pan attenuates the left channel.
pub fn volume_pan_to_percent(attenuation: i32, pan: i32) -> (u8, u8) {
    let attenuation = attenuation.clamp(-10_000, 0);
    let pan = pan.clamp(-10_000, 10_000);
    let left = attenuation - pan.max(0);
    let right = attenuation + pan.min(0);
    let percent = |centibels: i32| -> u8 {
        let factor = 10f64.powf(centibels.max(-10_000) as f64 / 2_000.0);
        (factor * 100.0).round().clamp(0.0, 100.0) as u8
    };
    (percent(left), percent(right))
}
