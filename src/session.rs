//! One opened hardware endpoint, shared by up to one playback and one capture
//! stream.
//!
//! The session owns the dsp descriptor, the negotiated format and fragment
//! layout, and the per-direction armed bits. Streams reach it only through a
//! [`SessionLease`] obtained from the [`DeviceManager`](crate::DeviceManager):
//! arming goes through [`SessionLease::arm`] and dropping the lease is the
//! release.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{DevicePaths, Quirks};
use crate::dsp::{
    Access, Backend, BufferInfo, CountInfo, DSP_CAP_BATCH, DSP_CAP_DUPLEX, DSP_CAP_MMAP,
    DSP_CAP_REALTIME, DSP_CAP_TRIGGER, Direction, Dsp,
};
use crate::error::{DriverError, DriverResult, is_invalid_argument};
use crate::format::{PcmFormat, SampleFormat};
use crate::push_log;

bitflags! {
    /// What a device can do, derived from `GETCAPS` and probing.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// `SETTRIGGER` is honoured.
        const TRIGGER = 1 << 0;
        /// Positions are accurate to the sample.
        const SAMPLE_ACCURATE = 1 << 1;
        /// The DMA buffer can be mapped and driven by position.
        const DIRECT_MAP = 1 << 2;
        /// One descriptor can play and record at once.
        const DUPLEX = 1 << 3;
        /// The mixer node answers volume requests.
        const VOLUME = 1 << 4;
        /// Can be opened for playback.
        const OUTPUT = 1 << 5;
        /// Can be opened for capture.
        const INPUT = 1 << 6;
    }
}

impl Capabilities {
    /// Translate a `GETCAPS` word.
    pub fn from_dsp_caps(caps: i32) -> Self {
        let mut out = Capabilities::empty();
        let trigger = caps & DSP_CAP_TRIGGER != 0;
        let batch = caps & DSP_CAP_BATCH != 0;
        if trigger {
            out |= Capabilities::TRIGGER;
        }
        if caps & DSP_CAP_REALTIME != 0 && !batch {
            out |= Capabilities::SAMPLE_ACCURATE;
        }
        if trigger && caps & DSP_CAP_MMAP != 0 && !batch {
            out |= Capabilities::DIRECT_MAP;
        }
        if caps & DSP_CAP_DUPLEX != 0 {
            out |= Capabilities::DUPLEX;
        }
        out
    }
}

/// Parameters for opening (or joining) a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    /// Direction the lease will drive.
    pub direction: Direction,
    /// Access mode for the descriptor.
    pub access: Access,
    /// `SETFRAGMENT` word, or 0 to keep the device default.
    pub fragment: u32,
    /// Requested format.
    pub format: PcmFormat,
    /// Fail instead of accepting a different format.
    pub strict: bool,
}

/// Outcome of format negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// The device runs the requested format.
    Exact(PcmFormat),
    /// The device runs a different format; the caller must adapt.
    Downgraded {
        /// What was asked for.
        requested: PcmFormat,
        /// What the device runs.
        granted: PcmFormat,
    },
}

impl Negotiation {
    /// Format the device actually runs.
    pub fn format(&self) -> PcmFormat {
        match self {
            Negotiation::Exact(format) => *format,
            Negotiation::Downgraded { granted, .. } => *granted,
        }
    }

    /// Whether the device runs something other than what was asked for.
    pub fn is_downgraded(&self) -> bool {
        matches!(self, Negotiation::Downgraded { .. })
    }

    fn against(requested: PcmFormat, granted: PcmFormat) -> Self {
        if requested == granted {
            Negotiation::Exact(granted)
        } else {
            Negotiation::Downgraded { requested, granted }
        }
    }
}

/// Fragment layout reported after negotiation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    /// Fragment size in bytes.
    pub fragment_size: usize,
    /// Fragments in the hardware buffer.
    pub fragments: usize,
    /// Hardware buffer size in bytes.
    pub buffer_size: usize,
}

impl Geometry {
    fn from_info(info: &BufferInfo) -> Self {
        Self {
            fragment_size: info.fragsize.max(0) as usize,
            fragments: info.fragstotal.max(0) as usize,
            buffer_size: info.buffer_size(),
        }
    }
}

/// Snapshot of a session for status displays.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    /// Device slot.
    pub index: usize,
    /// Dsp node.
    pub path: String,
    /// Active openers.
    pub open_count: u32,
    /// Access mode of the open descriptor.
    pub access: Option<Access>,
    /// Output armed bit.
    pub output_armed: bool,
    /// Input armed bit.
    pub input_armed: bool,
    /// Negotiated format.
    pub format: Option<PcmFormat>,
    /// Negotiated geometry.
    pub geometry: Geometry,
    /// Device capabilities.
    pub capabilities: Capabilities,
}

struct Negotiated {
    requested: PcmFormat,
    granted: PcmFormat,
    fragment: u32,
    geometry: Geometry,
}

struct SessionState {
    dsp: Option<Arc<dyn Dsp>>,
    open_count: u32,
    access: Access,
    owner: Option<ThreadId>,
    negotiated: Option<Negotiated>,
    capabilities: Capabilities,
    output_armed: bool,
    input_armed: bool,
}

impl SessionState {
    fn armed(&self, direction: Direction) -> bool {
        match direction {
            Direction::Output => self.output_armed,
            Direction::Input => self.input_armed,
        }
    }

    fn set_armed(&mut self, direction: Direction, enabled: bool) {
        match direction {
            Direction::Output => self.output_armed = enabled,
            Direction::Input => self.input_armed = enabled,
        }
    }

    fn trigger_mask(&self) -> i32 {
        let mut mask = 0;
        if self.output_armed {
            mask |= Direction::Output.trigger_bit();
        }
        if self.input_armed {
            mask |= Direction::Input.trigger_bit();
        }
        mask
    }
}

/// One hardware endpoint.
pub struct DeviceSession {
    index: usize,
    paths: DevicePaths,
    backend: Arc<dyn Backend>,
    quirks: Quirks,
    probed: Capabilities,
    state: Mutex<SessionState>,
}

impl DeviceSession {
    pub(crate) fn new(
        index: usize,
        paths: DevicePaths,
        backend: Arc<dyn Backend>,
        quirks: Quirks,
        probed: Capabilities,
    ) -> Self {
        Self {
            index,
            paths,
            backend,
            quirks,
            probed,
            state: Mutex::new(SessionState {
                dsp: None,
                open_count: 0,
                access: Access::WriteOnly,
                owner: None,
                negotiated: None,
                capabilities: probed,
                output_armed: false,
                input_armed: false,
            }),
        }
    }

    /// Device slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Dsp and mixer paths.
    pub fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    /// Capabilities found when the device was probed.
    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    /// Quirks in effect for this device.
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Number of active openers.
    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    /// Whether `direction` is currently armed.
    pub fn is_armed(&self, direction: Direction) -> bool {
        self.state.lock().armed(direction)
    }

    /// Status snapshot.
    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        SessionStatus {
            index: self.index,
            path: self.paths.dsp.clone(),
            open_count: state.open_count,
            access: (state.open_count > 0).then_some(state.access),
            output_armed: state.output_armed,
            input_armed: state.input_armed,
            format: state.negotiated.as_ref().map(|n| n.granted),
            geometry: state
                .negotiated
                .as_ref()
                .map(|n| n.geometry)
                .unwrap_or_default(),
            capabilities: state.capabilities,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Open the device, or join the descriptor another stream already holds.
    pub(crate) fn open(self: &Arc<Self>, request: OpenRequest) -> DriverResult<SessionLease> {
        let mut state = self.state.lock();
        let negotiation = if state.open_count == 0 {
            self.open_first(&mut state, &request)?
        } else {
            self.join(&mut state, &request)?
        };
        state.open_count += 1;
        let dsp = state.dsp.clone().ok_or(DriverError::InvalidHandle)?;
        debug!(
            path = %self.paths.dsp,
            open_count = state.open_count,
            direction = ?request.direction,
            "session opened"
        );
        Ok(SessionLease {
            session: Arc::clone(self),
            direction: request.direction,
            dsp,
            negotiation,
        })
    }

    fn open_first(
        &self,
        state: &mut SessionState,
        request: &OpenRequest,
    ) -> DriverResult<Negotiation> {
        if !self.backend.exists(&self.paths.dsp) {
            return Err(DriverError::DeviceUnavailable);
        }
        let dsp = self
            .backend
            .open(&self.paths.dsp, request.access)
            .map_err(DriverError::from_open)?;

        let full_duplex = self.probed.contains(Capabilities::DUPLEX);
        if request.access == Access::ReadWrite && full_duplex {
            if let Err(err) = dsp.set_duplex() {
                // BSD kernels run every descriptor duplex and reject the call.
                if is_invalid_argument(&err) {
                    debug!(path = %self.paths.dsp, "SETDUPLEX rejected, assuming duplex by default");
                } else {
                    warn!(path = %self.paths.dsp, %err, "SETDUPLEX failed");
                    return Err(DriverError::Io(err));
                }
            }
        }

        let mut capabilities = self.probed;
        match dsp.caps() {
            Ok(caps) => {
                let fresh = Capabilities::from_dsp_caps(caps);
                let probed_only =
                    self.probed & (Capabilities::VOLUME | Capabilities::OUTPUT | Capabilities::INPUT);
                capabilities = fresh | probed_only;
            }
            Err(err) => warn!(path = %self.paths.dsp, %err, "GETCAPS failed, keeping probed capabilities"),
        }

        if request.fragment != 0 {
            dsp.set_fragment(request.fragment).map_err(|err| {
                error!(path = %self.paths.dsp, %err, fragment = request.fragment, "SETFRAGMENT failed");
                DriverError::Io(err)
            })?;
        }

        let granted = negotiate_format(dsp.as_ref(), &request.format, request.strict)?;
        let info = match request.direction {
            Direction::Output => dsp.output_space(),
            Direction::Input => dsp.input_space(),
        }?;
        let geometry = Geometry::from_info(&info);

        state.output_armed = request.access.writable();
        state.input_armed = request.access.readable();
        if capabilities.contains(Capabilities::TRIGGER) && request.access == Access::ReadWrite {
            // Only the opening direction runs until the other one joins.
            let other = request.direction.other();
            state.set_armed(other, false);
            let mask = state.trigger_mask();
            if let Err(err) = dsp.set_trigger(mask) {
                error!(path = %self.paths.dsp, %err, mask, "SETTRIGGER failed on open");
            }
        }

        let negotiation = Negotiation::against(request.format, granted);
        if negotiation.is_downgraded() {
            info!(path = %self.paths.dsp, requested = %request.format, granted = %granted, "format downgraded");
            push_log(format!("{}: format downgraded to {}", self.paths.dsp, granted));
        }

        state.dsp = Some(dsp);
        state.access = request.access;
        state.owner = Some(thread::current().id());
        state.capabilities = capabilities;
        state.negotiated = Some(Negotiated {
            requested: request.format,
            granted,
            fragment: request.fragment,
            geometry,
        });
        Ok(negotiation)
    }

    fn join(&self, state: &mut SessionState, request: &OpenRequest) -> DriverResult<Negotiation> {
        let Some(negotiated) = state.negotiated.as_ref() else {
            return Err(DriverError::InvalidHandle);
        };
        if state.access != request.access {
            warn!(path = %self.paths.dsp, "access mismatch, device is not full duplex capable");
            return Err(DriverError::FormatUnsupported(
                "device already open with a different access mode".into(),
            ));
        }
        if request.format != negotiated.requested && request.format != negotiated.granted {
            warn!(
                path = %self.paths.dsp,
                open = %negotiated.granted,
                requested = %request.format,
                "pcm parameters differ between directions"
            );
            return Err(DriverError::FormatUnsupported(format!(
                "device already running {}",
                negotiated.granted
            )));
        }
        if request.fragment != negotiated.fragment {
            warn!(path = %self.paths.dsp, "fragment layouts differ between directions");
            return Err(DriverError::FormatUnsupported(
                "device already open with a different fragment layout".into(),
            ));
        }
        if state.owner != Some(thread::current().id()) {
            warn!(path = %self.paths.dsp, "another thread is trying to share the device");
            return Err(DriverError::DeviceBusy);
        }

        if request.strict && !request.format.honoured_by(&negotiated.granted) {
            warn!(
                path = %self.paths.dsp,
                open = %negotiated.granted,
                requested = %request.format,
                "strict join refused, device runs a downgraded format"
            );
            return Err(DriverError::FormatUnsupported(format!(
                "device already running {}",
                negotiated.granted
            )));
        }

        let negotiation = Negotiation::against(request.format, negotiated.granted);
        if state.capabilities.contains(Capabilities::TRIGGER)
            && state.capabilities.contains(Capabilities::DUPLEX)
        {
            state.set_armed(request.direction, true);
            let mask = state.trigger_mask();
            if let Some(dsp) = &state.dsp {
                if let Err(err) = dsp.set_trigger(mask) {
                    error!(path = %self.paths.dsp, %err, mask, "SETTRIGGER failed on join");
                }
            }
        }
        Ok(negotiation)
    }

    fn arm(&self, direction: Direction, enabled: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        let dsp = state.dsp.clone().ok_or(DriverError::InvalidHandle)?;
        state.set_armed(direction, enabled);
        if !state.capabilities.contains(Capabilities::TRIGGER) {
            return Ok(());
        }
        let mask = state.trigger_mask();
        match dsp.set_trigger(mask) {
            Ok(()) => {
                debug!(path = %self.paths.dsp, ?direction, enabled, mask, "trigger set");
                Ok(())
            }
            Err(err)
                if is_invalid_argument(&err)
                    && state.open_count == 1
                    && self.quirks.contains(Quirks::TRIGGER_SWAP_RETRY) =>
            {
                let other = direction.other();
                let flipped = !state.armed(other);
                state.set_armed(other, flipped);
                let retry = state.trigger_mask();
                warn!(
                    path = %self.paths.dsp,
                    mask,
                    retry,
                    "trigger rejected, retrying with the other direction flipped"
                );
                dsp.set_trigger(retry).map_err(|err| {
                    error!(path = %self.paths.dsp, %err, retry, "trigger retry failed");
                    DriverError::Io(err)
                })
            }
            Err(err) => {
                error!(path = %self.paths.dsp, %err, mask, "SETTRIGGER failed");
                Err(DriverError::Io(err))
            }
        }
    }

    fn flush(&self) -> DriverResult<()> {
        let state = self.state.lock();
        let dsp = state.dsp.clone().ok_or(DriverError::InvalidHandle)?;
        if state.open_count > 1 {
            // Halting would also drop the other direction's data.
            warn!(path = %self.paths.dsp, "not flushing a device shared by two streams");
            return Ok(());
        }
        dsp.halt().map_err(DriverError::Io)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.open_count == 0 {
            warn!(path = %self.paths.dsp, "session closed more times than opened");
            return;
        }
        state.open_count -= 1;
        if state.open_count > 0 {
            debug!(path = %self.paths.dsp, open_count = state.open_count, "session released");
            return;
        }
        state.output_armed = false;
        state.input_armed = false;
        if let Some(dsp) = state.dsp.take() {
            if state.capabilities.contains(Capabilities::TRIGGER) {
                if let Err(err) = dsp.set_trigger(0) {
                    warn!(path = %self.paths.dsp, %err, "disarm on close failed");
                }
            }
            if let Err(err) = dsp.halt() {
                warn!(path = %self.paths.dsp, %err, "reset on close failed");
            }
        }
        state.owner = None;
        state.negotiated = None;
        state.capabilities = self.probed;
        debug!(path = %self.paths.dsp, "device closed");
    }
}

/// Negotiate `requested` on `dsp` in the order format, rate, channels.
/// Every ioctl result is checked on its own; with `strict` any deviation
/// fails the open.
fn negotiate_format(dsp: &dyn Dsp, requested: &PcmFormat, strict: bool) -> DriverResult<PcmFormat> {
    let mismatch = |what: &str, detail: String| -> DriverResult<()> {
        if strict {
            Err(DriverError::FormatUnsupported(format!("{what}: {detail}")))
        } else {
            debug!(what, %detail, "accepting device value");
            Ok(())
        }
    };

    let sample = match dsp.set_format(requested.sample.afmt()) {
        Ok(code) => match SampleFormat::from_afmt(code) {
            Some(sample) => {
                if sample != requested.sample {
                    mismatch("format", format!("device granted {code:#x}"))?;
                }
                sample
            }
            None => {
                return Err(DriverError::FormatUnsupported(format!(
                    "device granted unusable sample format {code:#x}"
                )));
            }
        },
        Err(err) => {
            mismatch("format", err.to_string())?;
            requested.sample
        }
    };

    let rate = match dsp.set_speed(requested.rate) {
        Ok(rate) => {
            if !requested.rate_near(rate) {
                mismatch("rate", format!("device granted {rate} Hz"))?;
            }
            rate
        }
        Err(err) => {
            mismatch("rate", err.to_string())?;
            requested.rate
        }
    };

    let channels = match dsp.set_channels(requested.channels as u32) {
        Ok(channels) => {
            if channels != requested.channels as u32 {
                mismatch("channels", format!("device granted {channels}"))?;
            }
            channels as u16
        }
        Err(err) => {
            mismatch("channels", err.to_string())?;
            requested.channels
        }
    };

    // A near-match rate counts as the requested one.
    let rate = if requested.rate_near(rate) {
        requested.rate
    } else {
        rate
    };
    Ok(PcmFormat::new(rate, channels, sample))
}

/// A stream's claim on a [`DeviceSession`] for one direction.
///
/// Dropping the lease releases the claim; the descriptor closes when the last
/// lease goes.
pub struct SessionLease {
    session: Arc<DeviceSession>,
    direction: Direction,
    dsp: Arc<dyn Dsp>,
    negotiation: Negotiation,
}

impl SessionLease {
    /// Session behind the lease.
    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Direction this lease drives.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The shared descriptor.
    pub fn dsp(&self) -> &Arc<dyn Dsp> {
        &self.dsp
    }

    /// Negotiation outcome for this opener.
    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Format the device runs.
    pub fn format(&self) -> PcmFormat {
        self.negotiation.format()
    }

    /// Negotiated fragment layout.
    pub fn geometry(&self) -> Geometry {
        self.session
            .state
            .lock()
            .negotiated
            .as_ref()
            .map(|n| n.geometry)
            .unwrap_or_default()
    }

    /// Capabilities of the open descriptor.
    pub fn capabilities(&self) -> Capabilities {
        self.session.capabilities()
    }

    /// Quirks in effect.
    pub fn quirks(&self) -> Quirks {
        self.session.quirks
    }

    /// Arm or disarm this lease's direction.
    pub fn arm(&self, enabled: bool) -> DriverResult<()> {
        self.session.arm(self.direction, enabled)
    }

    /// Hardware buffer occupancy for this direction.
    pub fn free_space(&self) -> io::Result<BufferInfo> {
        match self.direction {
            Direction::Output => self.dsp.output_space(),
            Direction::Input => self.dsp.input_space(),
        }
    }

    /// Hardware cursor for this direction.
    pub fn position(&self) -> io::Result<CountInfo> {
        match self.direction {
            Direction::Output => self.dsp.output_ptr(),
            Direction::Input => self.dsp.input_ptr(),
        }
    }

    /// Discard everything queued in the device, when no other stream shares it.
    pub fn flush(&self) -> DriverResult<()> {
        self.session.flush()
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("path", &self.session.paths.dsp)
            .field("direction", &self.direction)
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.close();
    }
}
