//! Raw OSS ioctls.

use std::io;
use std::os::fd::RawFd;

use super::{BufferInfo, CountInfo};

const SNDCTL_DSP_MAGIC: u8 = b'P';
const SNDCTL_DSP_HALT: u8 = 0;
const SNDCTL_DSP_SPEED: u8 = 2;
const SNDCTL_DSP_SETFMT: u8 = 5;
const SNDCTL_DSP_CHANNELS: u8 = 6;
const SNDCTL_DSP_POST: u8 = 8;
const SNDCTL_DSP_SETFRAGMENT: u8 = 10;
const SNDCTL_DSP_GETOSPACE: u8 = 12;
const SNDCTL_DSP_GETISPACE: u8 = 13;
const SNDCTL_DSP_GETCAPS: u8 = 15;
const SNDCTL_DSP_SETTRIGGER: u8 = 16;
const SNDCTL_DSP_GETIPTR: u8 = 17;
const SNDCTL_DSP_GETOPTR: u8 = 18;
const SNDCTL_DSP_SETDUPLEX: u8 = 22;

const SOUND_MIXER_MAGIC: u8 = b'M';
const SOUND_MIXER_PCM: u8 = 4;

nix::ioctl_none!(oss_halt, SNDCTL_DSP_MAGIC, SNDCTL_DSP_HALT);
nix::ioctl_none!(oss_post, SNDCTL_DSP_MAGIC, SNDCTL_DSP_POST);
nix::ioctl_none!(oss_set_duplex, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SETDUPLEX);
nix::ioctl_readwrite!(oss_set_speed, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SPEED, i32);
nix::ioctl_readwrite!(oss_set_format, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SETFMT, u32);
nix::ioctl_readwrite!(oss_set_channels, SNDCTL_DSP_MAGIC, SNDCTL_DSP_CHANNELS, i32);
nix::ioctl_readwrite!(
    oss_set_fragment,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_SETFRAGMENT,
    i32
);
nix::ioctl_read!(
    oss_output_buffer_info,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETOSPACE,
    BufferInfo
);
nix::ioctl_read!(
    oss_input_buffer_info,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETISPACE,
    BufferInfo
);
nix::ioctl_read!(oss_get_caps, SNDCTL_DSP_MAGIC, SNDCTL_DSP_GETCAPS, i32);
nix::ioctl_write_ptr!(
    oss_set_trigger,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_SETTRIGGER,
    i32
);
nix::ioctl_read!(
    oss_get_iptr,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETIPTR,
    CountInfo
);
nix::ioctl_read!(
    oss_get_optr,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETOPTR,
    CountInfo
);
nix::ioctl_read!(oss_mixer_read_pcm, SOUND_MIXER_MAGIC, SOUND_MIXER_PCM, i32);
nix::ioctl_readwrite!(oss_mixer_write_pcm, SOUND_MIXER_MAGIC, SOUND_MIXER_PCM, i32);

pub(crate) fn halt(fd: RawFd) -> io::Result<()> {
    unsafe { oss_halt(fd) }.map(|_| ()).map_err(io::Error::from)
}

pub(crate) fn post(fd: RawFd) -> io::Result<()> {
    unsafe { oss_post(fd) }.map(|_| ()).map_err(io::Error::from)
}

pub(crate) fn set_duplex(fd: RawFd) -> io::Result<()> {
    unsafe { oss_set_duplex(fd) }
        .map(|_| ())
        .map_err(io::Error::from)
}

pub(crate) fn set_speed(fd: RawFd, rate: u32) -> io::Result<u32> {
    let mut value = rate as i32;
    unsafe { oss_set_speed(fd, &mut value) }.map_err(io::Error::from)?;
    Ok(value.max(0) as u32)
}

pub(crate) fn set_format(fd: RawFd, afmt: u32) -> io::Result<u32> {
    let mut value = afmt;
    unsafe { oss_set_format(fd, &mut value) }.map_err(io::Error::from)?;
    Ok(value)
}

pub(crate) fn set_channels(fd: RawFd, channels: u32) -> io::Result<u32> {
    let mut value = channels as i32;
    unsafe { oss_set_channels(fd, &mut value) }.map_err(io::Error::from)?;
    Ok(value.max(0) as u32)
}

pub(crate) fn set_fragment(fd: RawFd, word: u32) -> io::Result<u32> {
    let mut value = word as i32;
    unsafe { oss_set_fragment(fd, &mut value) }.map_err(io::Error::from)?;
    Ok(value as u32)
}

pub(crate) fn output_space(fd: RawFd) -> io::Result<BufferInfo> {
    let mut info = BufferInfo::default();
    unsafe { oss_output_buffer_info(fd, &mut info) }.map_err(io::Error::from)?;
    Ok(info)
}

pub(crate) fn input_space(fd: RawFd) -> io::Result<BufferInfo> {
    let mut info = BufferInfo::default();
    unsafe { oss_input_buffer_info(fd, &mut info) }.map_err(io::Error::from)?;
    Ok(info)
}

pub(crate) fn caps(fd: RawFd) -> io::Result<i32> {
    let mut caps = 0;
    unsafe { oss_get_caps(fd, &mut caps) }.map_err(io::Error::from)?;
    Ok(caps)
}

pub(crate) fn set_trigger(fd: RawFd, mask: i32) -> io::Result<()> {
    unsafe { oss_set_trigger(fd, &mask) }
        .map(|_| ())
        .map_err(io::Error::from)
}

pub(crate) fn output_ptr(fd: RawFd) -> io::Result<CountInfo> {
    let mut info = CountInfo::default();
    unsafe { oss_get_optr(fd, &mut info) }.map_err(io::Error::from)?;
    Ok(info)
}

pub(crate) fn input_ptr(fd: RawFd) -> io::Result<CountInfo> {
    let mut info = CountInfo::default();
    unsafe { oss_get_iptr(fd, &mut info) }.map_err(io::Error::from)?;
    Ok(info)
}

pub(crate) fn mixer_read_pcm(fd: RawFd) -> io::Result<i32> {
    let mut value = 0;
    unsafe { oss_mixer_read_pcm(fd, &mut value) }.map_err(io::Error::from)?;
    Ok(value)
}

pub(crate) fn mixer_write_pcm(fd: RawFd, packed: i32) -> io::Result<()> {
    let mut value = packed;
    unsafe { oss_mixer_write_pcm(fd, &mut value) }
        .map(|_| ())
        .map_err(io::Error::from)
}
