//! Crate-level tests that exercise sessions and the command ring without
//! spinning up stream engines.

mod ring_order;
mod session_sharing;

use std::sync::Arc;

use crate::config::{DevicePaths, DriverConfig, Quirks};
use crate::dsp::{Access, Direction, LoopbackBackend, LoopbackDevice, LoopbackSpec};
use crate::format::{PcmFormat, stream_fragment_word};
use crate::manager::DeviceManager;
use crate::session::OpenRequest;

/// Manager over a single loopback card at `/dev/dsp`.
pub(crate) fn loopback_manager(spec: LoopbackSpec, quirks: Quirks) -> (DeviceManager, Arc<LoopbackDevice>) {
    let backend = Arc::new(LoopbackBackend::with_quirks(quirks));
    let device = backend.add_device("/dev/dsp", spec);
    let manager = DeviceManager::init(
        DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]),
        backend,
    );
    (manager, device)
}

pub(crate) fn request(direction: Direction, access: Access, format: PcmFormat) -> OpenRequest {
    OpenRequest {
        direction,
        access,
        fragment: stream_fragment_word(&format),
        format,
        strict: true,
    }
}
