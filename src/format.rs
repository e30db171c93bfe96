//! PCM formats, fragment arithmetic and position conversions.

use crate::dsp::{AFMT_S16_LE, AFMT_U8};

/// Sample encodings the driver moves without conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit little endian.
    S16Le,
}

impl SampleFormat {
    /// Bits per sample.
    pub fn bits(self) -> u16 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::S16Le => 16,
        }
    }

    /// Map a bit depth onto a supported encoding.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(SampleFormat::U8),
            16 => Some(SampleFormat::S16Le),
            _ => None,
        }
    }

    pub(crate) fn afmt(self) -> u32 {
        match self {
            SampleFormat::U8 => AFMT_U8,
            SampleFormat::S16Le => AFMT_S16_LE,
        }
    }

    pub(crate) fn from_afmt(code: u32) -> Option<Self> {
        match code {
            AFMT_U8 => Some(SampleFormat::U8),
            AFMT_S16_LE => Some(SampleFormat::S16Le),
            _ => None,
        }
    }
}

/// Fixed PCM stream format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    /// Frames per second.
    pub rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample encoding.
    pub sample: SampleFormat,
}

impl PcmFormat {
    /// Build a format.
    pub fn new(rate: u32, channels: u16, sample: SampleFormat) -> Self {
        Self {
            rate,
            channels,
            sample,
        }
    }

    /// Stereo 16-bit at `rate`.
    pub fn stereo16(rate: u32) -> Self {
        Self::new(rate, 2, SampleFormat::S16Le)
    }

    /// Bytes per frame.
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.sample.bits() as usize / 8)
    }

    /// Bytes per second.
    pub fn avg_bytes_per_sec(&self) -> usize {
        self.block_align() * self.rate as usize
    }

    /// Whether the format is something the driver can pass through.
    pub fn is_supported(&self) -> bool {
        (1..=2).contains(&self.channels) && (1_000..=192_000).contains(&self.rate)
    }

    /// Duration needed to play `bytes`, in milliseconds (rounded up).
    pub fn bytes_to_ms(&self, bytes: u64) -> u64 {
        let per_sec = self.avg_bytes_per_sec() as u64;
        if per_sec == 0 {
            return 0;
        }
        (bytes * 1_000).div_ceil(per_sec)
    }

    /// Duration of `bytes` as a [`std::time::Duration`].
    pub fn bytes_to_duration(&self, bytes: u64) -> std::time::Duration {
        let per_sec = self.avg_bytes_per_sec() as u64;
        if per_sec == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_nanos(bytes.saturating_mul(1_000_000_000) / per_sec)
    }

    /// Rate comparison with the 1% tolerance devices are allowed.
    pub fn rate_near(&self, granted: u32) -> bool {
        let requested = self.rate as i64;
        let diff = (requested - granted as i64).abs();
        diff * 100 <= requested
    }

    /// Whether a device running `granted` honours this request: same layout
    /// and a near rate.
    pub fn honoured_by(&self, granted: &PcmFormat) -> bool {
        self.channels == granted.channels
            && self.sample == granted.sample
            && self.rate_near(granted.rate)
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz / {} ch / {} bit",
            self.rate,
            self.channels,
            self.sample.bits()
        )
    }
}

/// Number of fragments requested for streamed playback and capture.
pub const STREAM_FRAGMENTS: u32 = 16;
/// Fragment word for mapped buffers on sample-accurate devices (32 x 2 KiB).
pub const MAPPED_FRAGMENT_PRECISE: u32 = 0x0020_000B;
/// Fragment word for mapped buffers elsewhere (256 x 256 B).
pub const MAPPED_FRAGMENT_COARSE: u32 = 0x0100_0008;

/// Pack a fragment count and size shift into the `SETFRAGMENT` word.
pub fn fragment_word(count: u32, shift: u32) -> u32 {
    (count << 16) | (shift & 0xffff)
}

/// Split a `SETFRAGMENT` word into `(count, shift)`.
pub fn split_fragment_word(word: u32) -> (u32, u32) {
    (word >> 16, word & 0xffff)
}

/// Largest power-of-two shift whose size does not exceed `bytes` (minimum 4).
pub fn floor_shift(bytes: usize) -> u32 {
    let mut shift = 4;
    while (1usize << (shift + 1)) <= bytes && shift < 16 {
        shift += 1;
    }
    shift
}

/// Fragment word for streamed engines: sixteen fragments of roughly 10 ms.
pub fn stream_fragment_word(format: &PcmFormat) -> u32 {
    let shift = floor_shift(format.avg_bytes_per_sec() / 100);
    fragment_word(STREAM_FRAGMENTS, shift)
}

/// Search for the largest power-of-two fragment size that evenly divides
/// `length`, starting at `max_shift` and not going below ~1 ms of audio.
///
/// Returns the fragment word to request, or `None` when the buffer length has
/// no acceptable divisor and a staged copy is needed.
pub fn direct_fragment_word(format: &PcmFormat, length: usize, max_shift: u32) -> Option<u32> {
    if length == 0 {
        return None;
    }
    let min_shift = floor_shift(format.avg_bytes_per_sec() / 1_000);
    let mut shift = max_shift;
    while shift >= min_shift {
        let size = 1usize << shift;
        if length % size == 0 {
            let count = length / size;
            if (2..=0xffff).contains(&count) {
                return Some(fragment_word(count as u32, shift));
            }
        }
        if shift == 0 {
            break;
        }
        shift -= 1;
    }
    None
}

/// Requested representation of a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeFormat {
    /// Raw byte count.
    Bytes,
    /// Frame count.
    Samples,
    /// Milliseconds.
    Millis,
    /// Hours/minutes/seconds/frames at 30 fps.
    Smpte,
}

/// A position converted to the requested [`TimeFormat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmTime {
    /// Bytes.
    Bytes(u64),
    /// Frames.
    Samples(u64),
    /// Milliseconds.
    Millis(u64),
    /// SMPTE time code.
    Smpte {
        /// Hours.
        hour: u32,
        /// Minutes.
        min: u32,
        /// Seconds.
        sec: u32,
        /// Frame within the second.
        frame: u32,
        /// Frames per second.
        fps: u32,
    },
}

const SMPTE_FPS: u64 = 30;

/// Convert a byte position into `time_format`.
pub fn bytes_to_time(position: u64, format: &PcmFormat, time_format: TimeFormat) -> MmTime {
    let block = format.block_align().max(1) as u64;
    let rate = format.rate.max(1) as u64;
    match time_format {
        TimeFormat::Bytes => MmTime::Bytes(position),
        TimeFormat::Samples => MmTime::Samples(position / block),
        TimeFormat::Millis => MmTime::Millis(position * 1_000 / (block * rate)),
        TimeFormat::Smpte => {
            let mut frames = position / block;
            frames += rate / SMPTE_FPS - 1;
            let total_sec = frames / rate;
            frames -= total_sec * rate;
            let hour = total_sec / 3_600;
            let min = (total_sec / 60) % 60;
            let sec = total_sec % 60;
            MmTime::Smpte {
                hour: hour as u32,
                min: min as u32,
                sec: sec as u32,
                frame: (frames * SMPTE_FPS / rate) as u32,
                fps: SMPTE_FPS as u32,
            }
        }
    }
}
