//! Process-wide device registry.
//!
//! [`DeviceManager::init`] probes the configured dsp nodes once and keeps one
//! [`DeviceSession`] per usable device. Every stream and mapped buffer gets
//! its claim on a session through the manager, and [`DeviceManager::shutdown`]
//! tears the registry down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::capture::CaptureStream;
use crate::config::{DevicePaths, DriverConfig};
use crate::dsp::{Access, Backend, Direction};
use crate::error::{DriverError, DriverResult, is_invalid_argument};
use crate::format::{PcmFormat, stream_fragment_word};
use crate::header::Notifier;
use crate::mapped::MappedBuffer;
use crate::playback::PlaybackStream;
use crate::session::{Capabilities, DeviceSession, Negotiation, OpenRequest, SessionLease, SessionStatus};
use crate::{init_tracing, push_log};

/// Description of a probed device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Slot used to open the device.
    pub index: usize,
    /// Dsp and mixer nodes.
    pub paths: DevicePaths,
    /// What probing found.
    pub capabilities: Capabilities,
}

/// Parameters for opening a playback or capture stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaveOpen {
    /// Requested format.
    pub format: PcmFormat,
    /// Refuse the open rather than run a different format.
    pub strict: bool,
}

impl WaveOpen {
    /// Accept whatever format the device grants.
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            strict: false,
        }
    }

    /// Require the device to run exactly `format`.
    pub fn strict(format: PcmFormat) -> Self {
        Self {
            format,
            strict: true,
        }
    }
}

/// Registry of probed devices.
pub struct DeviceManager {
    backend: Arc<dyn Backend>,
    sessions: RwLock<Vec<Arc<DeviceSession>>>,
    shut_down: AtomicBool,
}

impl DeviceManager {
    /// Probe every configured device through `backend`.
    ///
    /// Devices that cannot be opened in either direction are skipped; the
    /// remaining ones are numbered from 0 in configuration order.
    pub fn init(config: DriverConfig, backend: Arc<dyn Backend>) -> Self {
        init_tracing();
        let quirks = config.quirks.unwrap_or_else(|| backend.default_quirks());
        let mut sessions = Vec::new();
        for paths in config.devices {
            let Some(capabilities) = probe(backend.as_ref(), &paths) else {
                continue;
            };
            let index = sessions.len();
            info!(index, path = %paths.dsp, ?capabilities, "device probed");
            push_log(format!("{}: {:?}", paths.dsp, capabilities));
            sessions.push(Arc::new(DeviceSession::new(
                index,
                paths,
                Arc::clone(&backend),
                quirks,
                capabilities,
            )));
        }
        info!(backend = backend.name(), devices = sessions.len(), "device manager ready");
        Self {
            backend,
            sessions: RwLock::new(sessions),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Backend the manager opens devices through.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Probed devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.sessions
            .read()
            .iter()
            .map(|session| DeviceInfo {
                index: session.index(),
                paths: session.paths().clone(),
                capabilities: session.capabilities(),
            })
            .collect()
    }

    /// Status of every session.
    pub fn status(&self) -> Vec<SessionStatus> {
        self.sessions.read().iter().map(|s| s.status()).collect()
    }

    /// Session for device `index`.
    pub fn session(&self, index: usize) -> DriverResult<Arc<DeviceSession>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DriverError::InvalidHandle);
        }
        self.sessions
            .read()
            .get(index)
            .cloned()
            .ok_or(DriverError::InvalidHandle)
    }

    /// Open device `index` (or join its open descriptor) for one direction.
    pub fn acquire(&self, index: usize, request: OpenRequest) -> DriverResult<SessionLease> {
        let session = self.session(index)?;
        let wanted = match request.direction {
            Direction::Output => Capabilities::OUTPUT,
            Direction::Input => Capabilities::INPUT,
        };
        if !session.capabilities().contains(wanted) {
            return Err(DriverError::DeviceUnavailable);
        }
        session.open(request)
    }

    /// Give a lease back. Dropping it has the same effect.
    pub fn release(&self, lease: SessionLease) {
        debug!(index = lease.session().index(), direction = ?lease.direction(), "lease released");
        drop(lease);
    }

    /// Ask what device `index` would run for `format` without keeping it open.
    pub fn query_format(
        &self,
        index: usize,
        direction: Direction,
        open: &WaveOpen,
    ) -> DriverResult<Negotiation> {
        let lease = self.acquire(index, self.stream_request(index, direction, open)?)?;
        let negotiation = lease.negotiation();
        self.release(lease);
        Ok(negotiation)
    }

    /// Open a playback stream on device `index`.
    pub fn open_output(
        &self,
        index: usize,
        open: &WaveOpen,
        notifier: Notifier,
    ) -> DriverResult<PlaybackStream> {
        let request = self.stream_request(index, Direction::Output, open)?;
        let lease = self.acquire(index, request)?;
        PlaybackStream::spawn(lease, notifier)
    }

    /// Open a capture stream on device `index`.
    pub fn open_input(
        &self,
        index: usize,
        open: &WaveOpen,
        notifier: Notifier,
    ) -> DriverResult<CaptureStream> {
        let request = self.stream_request(index, Direction::Input, open)?;
        let lease = self.acquire(index, request)?;
        CaptureStream::spawn(lease, notifier)
    }

    /// Create a mapped buffer of `length` bytes on device `index`.
    pub fn create_mapped_buffer(
        &self,
        index: usize,
        format: PcmFormat,
        length: usize,
        role: Direction,
    ) -> DriverResult<MappedBuffer> {
        let session = self.session(index)?;
        MappedBuffer::create(self, &session, format, length, role)
    }

    fn stream_request(
        &self,
        index: usize,
        direction: Direction,
        open: &WaveOpen,
    ) -> DriverResult<OpenRequest> {
        if !open.format.is_supported() {
            return Err(DriverError::FormatUnsupported(format!(
                "{} is outside the passthrough range",
                open.format
            )));
        }
        let session = self.session(index)?;
        let access = if session.capabilities().contains(Capabilities::DUPLEX) {
            Access::ReadWrite
        } else {
            Access::for_direction(direction)
        };
        Ok(OpenRequest {
            direction,
            access,
            fragment: stream_fragment_word(&open.format),
            format: open.format,
            strict: open.strict,
        })
    }

    /// Drop every session. Streams still open keep their device until they
    /// close; new opens fail with [`DriverError::InvalidHandle`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = std::mem::take(&mut *self.sessions.write());
        for session in &sessions {
            let open_count = session.open_count();
            if open_count > 0 {
                warn!(path = %session.paths().dsp, open_count, "device still open at shutdown");
            }
        }
        info!(devices = sessions.len(), "device manager shut down");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open `paths` write-only, read-only and then read-write to find out what it
/// supports. Returns `None` when neither direction opens.
fn probe(backend: &dyn Backend, paths: &DevicePaths) -> Option<Capabilities> {
    if !backend.exists(&paths.dsp) {
        debug!(path = %paths.dsp, "no such device");
        return None;
    }
    let mut capabilities = Capabilities::empty();

    for direction in [Direction::Output, Direction::Input] {
        match backend.open(&paths.dsp, Access::for_direction(direction)) {
            Ok(dsp) => {
                capabilities |= match direction {
                    Direction::Output => Capabilities::OUTPUT,
                    Direction::Input => Capabilities::INPUT,
                };
                match dsp.caps() {
                    Ok(caps) => {
                        capabilities |= Capabilities::from_dsp_caps(caps) - Capabilities::DUPLEX;
                    }
                    Err(err) => debug!(path = %paths.dsp, %err, "GETCAPS failed while probing"),
                }
            }
            Err(err) => debug!(path = %paths.dsp, ?direction, %err, "cannot open while probing"),
        }
    }

    if capabilities.contains(Capabilities::OUTPUT | Capabilities::INPUT) {
        match backend.open(&paths.dsp, Access::ReadWrite) {
            Ok(dsp) => {
                let duplex = match dsp.set_duplex() {
                    Ok(()) => true,
                    Err(err) => is_invalid_argument(&err),
                };
                let reported = dsp
                    .caps()
                    .map(|caps| Capabilities::from_dsp_caps(caps).contains(Capabilities::DUPLEX))
                    .unwrap_or(false);
                if duplex && reported {
                    capabilities |= Capabilities::DUPLEX;
                }
            }
            Err(err) => debug!(path = %paths.dsp, %err, "cannot open read-write while probing"),
        }
    }

    if backend.mixer_volume(&paths.mixer).is_ok() {
        capabilities |= Capabilities::VOLUME;
    }

    if capabilities.intersects(Capabilities::OUTPUT | Capabilities::INPUT) {
        Some(capabilities)
    } else {
        None
    }
}
