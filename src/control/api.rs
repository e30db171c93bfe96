use std::sync::Arc;
use std::time::Duration;

use crate::dsp::Direction;
use crate::error::{DriverError, DriverResult};
use crate::format::PcmFormat;
use crate::header::{Notifier, WaveHeader};
use crate::manager::{DeviceManager, WaveOpen};
use crate::playback::PlaybackStream;
use crate::session::{Capabilities, SessionStatus};
use crate::tone::ToneGenerator;

/// Snapshot of the whole driver.
#[derive(Clone, Debug)]
pub struct DriverStatus {
    /// Backend name.
    pub backend: String,
    /// One entry per probed device.
    pub devices: Vec<SessionStatus>,
    /// Mixer volume per device as `(left, right)` percent, when readable.
    pub volumes: Vec<Option<(u8, u8)>>,
}

/// Collect a status snapshot.
pub fn get_status(manager: &DeviceManager) -> DriverStatus {
    let devices = manager.status();
    let backend = manager.backend();
    let volumes = manager
        .devices()
        .iter()
        .map(|info| {
            if info.capabilities.contains(Capabilities::VOLUME) {
                backend.mixer_volume(&info.paths.mixer).ok()
            } else {
                None
            }
        })
        .collect();
    DriverStatus {
        backend: backend.name().to_string(),
        devices,
        volumes,
    }
}

/// Set the mixer volume of device `index` to `percent` on both channels.
pub fn set_volume(manager: &DeviceManager, index: usize, percent: u8) -> DriverResult<()> {
    let info = manager
        .devices()
        .into_iter()
        .find(|info| info.index == index)
        .ok_or(DriverError::InvalidHandle)?;
    if !info.capabilities.contains(Capabilities::VOLUME) {
        return Err(DriverError::Unsupported);
    }
    manager
        .backend()
        .set_mixer_volume(&info.paths.mixer, percent, percent)?;
    Ok(())
}

/// Open a playback stream on `index` and queue `duration` of a 440 Hz tone.
/// The tone plays while the returned stream is alive.
pub fn play_tone(
    manager: &DeviceManager,
    index: usize,
    duration: Duration,
) -> DriverResult<PlaybackStream> {
    let open = WaveOpen::new(PcmFormat::stereo16(44_100));
    let stream = manager.open_output(index, &open, Notifier::None)?;
    let mut tone = ToneGenerator::new(stream.format(), 440.0, 0.3);
    stream.submit(Arc::new(WaveHeader::new(tone.render_for(duration))))?;
    Ok(stream)
}

/// Describe a session's direction bits for display.
pub fn armed_label(status: &SessionStatus, direction: Direction) -> &'static str {
    let armed = match direction {
        Direction::Output => status.output_armed,
        Direction::Input => status.input_armed,
    };
    if armed { "on" } else { "off" }
}
