//! Real OSS device nodes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use nix::libc;
use tracing::trace;

use super::{Access, Backend, BufferInfo, CountInfo, Dsp, ioctl, pack_volume, unpack_volume};
use crate::config::Quirks;

/// Backend opening `/dev/dsp*` and `/dev/mixer*` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OssBackend;

impl OssBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

impl Backend for OssBackend {
    fn name(&self) -> &str {
        "oss"
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn open(&self, path: &str, access: Access) -> io::Result<Arc<dyn Dsp>> {
        let mut options = OpenOptions::new();
        options
            .read(access.readable())
            .write(access.writable())
            .custom_flags(libc::O_NONBLOCK);
        let file = options.open(path)?;
        trace!(path, ?access, fd = file.as_raw_fd(), "opened dsp node");
        Ok(Arc::new(OssDsp { file }))
    }

    fn default_quirks(&self) -> Quirks {
        Quirks::TRIGGER_SWAP_RETRY | Quirks::NEEDS_PRIME
    }

    fn mixer_volume(&self, mixer: &str) -> io::Result<(u8, u8)> {
        let file = OpenOptions::new().read(true).open(mixer)?;
        let raw = ioctl::mixer_read_pcm(file.as_raw_fd())?;
        Ok(unpack_volume(raw))
    }

    fn set_mixer_volume(&self, mixer: &str, left: u8, right: u8) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(mixer)?;
        ioctl::mixer_write_pcm(file.as_raw_fd(), pack_volume(left, right))
    }
}

/// An open dsp node. Dropping it closes the descriptor.
pub struct OssDsp {
    file: File,
}

impl OssDsp {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Dsp for OssDsp {
    fn set_duplex(&self) -> io::Result<()> {
        ioctl::set_duplex(self.fd())
    }

    fn set_fragment(&self, word: u32) -> io::Result<u32> {
        ioctl::set_fragment(self.fd(), word)
    }

    fn set_format(&self, afmt: u32) -> io::Result<u32> {
        ioctl::set_format(self.fd(), afmt)
    }

    fn set_speed(&self, rate: u32) -> io::Result<u32> {
        ioctl::set_speed(self.fd(), rate)
    }

    fn set_channels(&self, channels: u32) -> io::Result<u32> {
        ioctl::set_channels(self.fd(), channels)
    }

    fn caps(&self) -> io::Result<i32> {
        ioctl::caps(self.fd())
    }

    fn set_trigger(&self, mask: i32) -> io::Result<()> {
        ioctl::set_trigger(self.fd(), mask)
    }

    fn output_space(&self) -> io::Result<BufferInfo> {
        ioctl::output_space(self.fd())
    }

    fn input_space(&self) -> io::Result<BufferInfo> {
        ioctl::input_space(self.fd())
    }

    fn output_ptr(&self) -> io::Result<CountInfo> {
        ioctl::output_ptr(self.fd())
    }

    fn input_ptr(&self) -> io::Result<CountInfo> {
        ioctl::input_ptr(self.fd())
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        match (&self.file).write(data) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn read(&self, data: &mut [u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        match (&self.file).read(data) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn post(&self) -> io::Result<()> {
        ioctl::post(self.fd())
    }

    fn halt(&self) -> io::Result<()> {
        ioctl::halt(self.fd())
    }

    fn map_dma(&self, len: usize) -> io::Result<Arc<MmapRaw>> {
        let map = MmapOptions::new().len(len).map_raw(&self.file)?;
        Ok(Arc::new(map))
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.fd())
    }
}
