//! Driver configuration: device node discovery and backend quirks.

use std::env;

use bitflags::bitflags;

/// Number of device slots probed when `AUDIODEV` is not set.
pub const MAX_DEVICES: usize = 6;

bitflags! {
    /// Backend behaviours that cannot be probed and must be declared.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Quirks: u32 {
        /// Retry a rejected combined trigger call once with the other
        /// direction's armed bit flipped (sole opener only).
        const TRIGGER_SWAP_RETRY = 1 << 0;
        /// Playback does not start until a POST kick when fewer than two
        /// fragments are queued.
        const NEEDS_PRIME = 1 << 1;
        /// Disarming a mapped buffer does not halt DMA; stopping requires a
        /// full close.
        const STOP_NEEDS_CLOSE = 1 << 2;
    }
}

/// A dsp node and the mixer node that controls it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevicePaths {
    /// PCM device path, e.g. `/dev/dsp`.
    pub dsp: String,
    /// Mixer device path, e.g. `/dev/mixer`.
    pub mixer: String,
}

impl DevicePaths {
    /// Pair a dsp path with a mixer path.
    pub fn new(dsp: impl Into<String>, mixer: impl Into<String>) -> Self {
        Self {
            dsp: dsp.into(),
            mixer: mixer.into(),
        }
    }
}

/// Process-wide driver configuration.
#[derive(Clone, Debug, Default)]
pub struct DriverConfig {
    /// Device slots to probe, in order.
    pub devices: Vec<DevicePaths>,
    /// Replaces the backend's default quirks when set.
    pub quirks: Option<Quirks>,
}

impl DriverConfig {
    /// Discover device nodes the way OSS applications conventionally do:
    /// `AUDIODEV`/`MIXERDEV` name a single device, otherwise `/dev/dsp`,
    /// `/dev/dsp1`, ... paired with `/dev/mixer`, `/dev/mixer1`, ...
    pub fn from_env() -> Self {
        let audiodev = env::var("AUDIODEV").ok().filter(|v| !v.is_empty());
        let mixerdev = env::var("MIXERDEV").ok().filter(|v| !v.is_empty());
        Self::from_vars(audiodev, mixerdev)
    }

    fn from_vars(audiodev: Option<String>, mixerdev: Option<String>) -> Self {
        let devices = match audiodev {
            Some(dsp) => vec![DevicePaths::new(
                dsp,
                mixerdev.unwrap_or_else(|| "/dev/mixer".to_string()),
            )],
            None => (0..MAX_DEVICES)
                .map(|slot| match slot {
                    0 => DevicePaths::new(
                        "/dev/dsp",
                        mixerdev.clone().unwrap_or_else(|| "/dev/mixer".to_string()),
                    ),
                    n => DevicePaths::new(format!("/dev/dsp{n}"), format!("/dev/mixer{n}")),
                })
                .collect(),
        };
        Self {
            devices,
            quirks: None,
        }
    }

    /// Explicit device list.
    pub fn with_devices(devices: Vec<DevicePaths>) -> Self {
        Self {
            devices,
            quirks: None,
        }
    }

    /// Override backend quirks.
    pub fn quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = Some(quirks);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audiodev_selects_single_device() {
        let config = DriverConfig::from_vars(Some("/dev/dsp3".into()), None);
        assert_eq!(
            config.devices,
            vec![DevicePaths::new("/dev/dsp3", "/dev/mixer")]
        );
    }

    #[test]
    fn default_slots_pair_dsp_and_mixer() {
        let config = DriverConfig::from_vars(None, None);
        assert_eq!(config.devices.len(), MAX_DEVICES);
        assert_eq!(config.devices[0], DevicePaths::new("/dev/dsp", "/dev/mixer"));
        assert_eq!(config.devices[2], DevicePaths::new("/dev/dsp2", "/dev/mixer2"));
    }
}
