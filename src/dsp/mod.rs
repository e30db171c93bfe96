//! Hardware seam: the OSS device-control surface the engines are written against.
//!
//! [`Dsp`] is one open dsp node; every method maps onto one ioctl or syscall.
//! [`Backend`] opens nodes and reaches their mixers. [`oss`] talks to real
//! `/dev/dsp` devices, [`loopback`] is a software device that advances in
//! real time and lets the engines run without sound hardware.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use memmap2::MmapRaw;

use crate::config::Quirks;

pub(crate) mod ioctl;
pub mod loopback;
pub mod oss;

pub use loopback::{LoopbackBackend, LoopbackDevice, LoopbackSpec};
pub use oss::OssBackend;

/// Trigger bit arming capture.
pub const PCM_ENABLE_INPUT: i32 = 0x1;
/// Trigger bit arming playback.
pub const PCM_ENABLE_OUTPUT: i32 = 0x2;

/// Unsigned 8-bit sample format code.
pub const AFMT_U8: u32 = 0x0000_0008;
/// Signed 16-bit little-endian sample format code.
pub const AFMT_S16_LE: u32 = 0x0000_0010;

/// Device can record and play over one descriptor.
pub const DSP_CAP_DUPLEX: i32 = 0x0000_0100;
/// Device reports positions precisely.
pub const DSP_CAP_REALTIME: i32 = 0x0000_0200;
/// Device transfers in large batches (positions are coarse).
pub const DSP_CAP_BATCH: i32 = 0x0000_0400;
/// Device supports `SETTRIGGER`.
pub const DSP_CAP_TRIGGER: i32 = 0x0000_1000;
/// Device supports mapping its DMA buffer.
pub const DSP_CAP_MMAP: i32 = 0x0000_2000;

/// `GETOSPACE`/`GETISPACE` reply.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Whole fragments available without blocking.
    pub fragments: i32,
    /// Fragments in the hardware buffer.
    pub fragstotal: i32,
    /// Fragment size in bytes.
    pub fragsize: i32,
    /// Bytes available without blocking.
    pub bytes: i32,
}

impl BufferInfo {
    /// Total hardware buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        (self.fragstotal.max(0) as usize) * (self.fragsize.max(0) as usize)
    }
}

/// `GETOPTR`/`GETIPTR` reply.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountInfo {
    /// Bytes processed since the device was opened.
    pub bytes: i32,
    /// Fragment transitions since the previous call.
    pub blocks: i32,
    /// Current DMA pointer within the hardware buffer.
    pub ptr: i32,
}

/// Stream direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Playback.
    Output,
    /// Capture.
    Input,
}

impl Direction {
    /// Trigger bit for this direction.
    pub fn trigger_bit(self) -> i32 {
        match self {
            Direction::Output => PCM_ENABLE_OUTPUT,
            Direction::Input => PCM_ENABLE_INPUT,
        }
    }

    /// The opposite direction.
    pub fn other(self) -> Self {
        match self {
            Direction::Output => Direction::Input,
            Direction::Input => Direction::Output,
        }
    }
}

/// Access mode a dsp node is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Capture only.
    ReadOnly,
    /// Playback only.
    WriteOnly,
    /// Full duplex or mapped access.
    ReadWrite,
}

impl Access {
    /// Single-direction access for `direction`.
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Output => Access::WriteOnly,
            Direction::Input => Access::ReadOnly,
        }
    }

    /// Whether the node can serve `direction`.
    pub fn covers(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Access::ReadWrite, _)
                | (Access::WriteOnly, Direction::Output)
                | (Access::ReadOnly, Direction::Input)
        )
    }

    /// Whether reads are permitted.
    pub fn readable(self) -> bool {
        self.covers(Direction::Input)
    }

    /// Whether writes are permitted.
    pub fn writable(self) -> bool {
        self.covers(Direction::Output)
    }
}

/// One open dsp node.
///
/// Methods take `&self`: a node is shared between a playback and a capture
/// engine when running full duplex, and the kernel serializes ioctls.
pub trait Dsp: Send + Sync {
    /// `SNDCTL_DSP_SETDUPLEX`.
    fn set_duplex(&self) -> io::Result<()>;
    /// `SNDCTL_DSP_SETFRAGMENT`; returns the word the device kept.
    fn set_fragment(&self, word: u32) -> io::Result<u32>;
    /// `SNDCTL_DSP_SETFMT`; returns the granted format code.
    fn set_format(&self, afmt: u32) -> io::Result<u32>;
    /// `SNDCTL_DSP_SPEED`; returns the granted rate.
    fn set_speed(&self, rate: u32) -> io::Result<u32>;
    /// `SNDCTL_DSP_CHANNELS`; returns the granted channel count.
    fn set_channels(&self, channels: u32) -> io::Result<u32>;
    /// `SNDCTL_DSP_GETCAPS`.
    fn caps(&self) -> io::Result<i32>;
    /// `SNDCTL_DSP_SETTRIGGER` with the combined enable mask.
    fn set_trigger(&self, mask: i32) -> io::Result<()>;
    /// `SNDCTL_DSP_GETOSPACE`.
    fn output_space(&self) -> io::Result<BufferInfo>;
    /// `SNDCTL_DSP_GETISPACE`.
    fn input_space(&self) -> io::Result<BufferInfo>;
    /// `SNDCTL_DSP_GETOPTR`.
    fn output_ptr(&self) -> io::Result<CountInfo>;
    /// `SNDCTL_DSP_GETIPTR`.
    fn input_ptr(&self) -> io::Result<CountInfo>;
    /// Non-blocking write; a full device reports `Ok(0)`.
    fn write(&self, data: &[u8]) -> io::Result<usize>;
    /// Non-blocking read; an empty device reports `Ok(0)`.
    fn read(&self, data: &mut [u8]) -> io::Result<usize>;
    /// `SNDCTL_DSP_POST`: start playing a partially filled buffer.
    fn post(&self) -> io::Result<()>;
    /// `SNDCTL_DSP_HALT`: drop everything queued in both directions.
    fn halt(&self) -> io::Result<()>;
    /// Map `len` bytes of the DMA buffer.
    fn map_dma(&self, len: usize) -> io::Result<Arc<MmapRaw>>;
    /// Descriptor to poll for progress, when the node has one.
    fn poll_fd(&self) -> Option<RawFd>;
}

/// Factory for dsp nodes and their mixers.
pub trait Backend: Send + Sync {
    /// Short name for logs and the console.
    fn name(&self) -> &str;
    /// Whether the node exists.
    fn exists(&self, path: &str) -> bool;
    /// Open `path` non-blocking with `access`.
    fn open(&self, path: &str, access: Access) -> io::Result<Arc<dyn Dsp>>;
    /// Quirks applied unless the configuration overrides them.
    fn default_quirks(&self) -> Quirks;
    /// Read the PCM volume as `(left, right)` percentages.
    fn mixer_volume(&self, mixer: &str) -> io::Result<(u8, u8)>;
    /// Write the PCM volume as `(left, right)` percentages.
    fn set_mixer_volume(&self, mixer: &str, left: u8, right: u8) -> io::Result<()>;
}

/// Pack percentages the way `SOUND_MIXER_*_PCM` expects.
pub fn pack_volume(left: u8, right: u8) -> i32 {
    left.min(100) as i32 | ((right.min(100) as i32) << 8)
}

/// Inverse of [`pack_volume`].
pub fn unpack_volume(raw: i32) -> (u8, u8) {
    ((raw & 0xff) as u8, ((raw >> 8) & 0xff) as u8)
}
