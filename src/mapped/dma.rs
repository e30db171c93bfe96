//! Wrap-aware access to mapped regions.
//!
//! A [`DmaView`] is shared between the hardware (or the staging thread) and
//! the caller without a lock. Each region has one writer and one reader, and
//! the device cursor published by the watcher is the only synchronization
//! point: nobody writes a byte the other side has not finished with.

use std::io;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};

use crate::format::{PcmFormat, SampleFormat};

/// A mapped region viewed as a ring.
#[derive(Clone)]
pub struct DmaView {
    map: Arc<MmapRaw>,
}

impl DmaView {
    pub(crate) fn new(map: Arc<MmapRaw>) -> Self {
        Self { map }
    }

    /// Anonymous region of `len` bytes, used as a staging buffer.
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::new(Arc::new(MmapRaw::from(map))))
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset`, wrapping at the end of
    /// the region. Returns the number of bytes copied.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let total = self.len();
        if total == 0 || dst.is_empty() {
            return 0;
        }
        let length = dst.len().min(total);
        let mut offset = offset % total;
        let mut copied = 0;
        while copied < length {
            let take = (total - offset).min(length - copied);
            // SAFETY: offset + take <= total and dst has room for take bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.map.as_ptr().add(offset),
                    dst[copied..].as_mut_ptr(),
                    take,
                );
            }
            copied += take;
            offset = 0;
        }
        copied
    }

    /// Copy `src` into the region starting at `offset`, wrapping at the end.
    /// Returns the number of bytes copied.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let total = self.len();
        if total == 0 || src.is_empty() {
            return 0;
        }
        let length = src.len().min(total);
        let mut offset = offset % total;
        let mut copied = 0;
        while copied < length {
            let take = (total - offset).min(length - copied);
            // SAFETY: offset + take <= total and src holds take more bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src[copied..].as_ptr(),
                    self.map.as_mut_ptr().add(offset),
                    take,
                );
            }
            copied += take;
            offset = 0;
        }
        copied
    }

    /// Fill the whole region with `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: the region is exactly len() bytes long.
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr(), byte, self.len());
        }
    }

    /// Raw halves `[offset, end)` and `[0, rest)` covering `len` bytes from
    /// `offset`, for locking.
    pub(crate) fn split_at(&self, offset: usize, len: usize) -> ((*mut u8, usize), (*mut u8, usize)) {
        let total = self.len();
        let offset = offset % total.max(1);
        let len = len.min(total);
        let first = (total - offset).min(len);
        // SAFETY: offset < total, so the pointer stays inside the mapping.
        let start = unsafe { self.map.as_mut_ptr().add(offset) };
        ((start, first), (self.map.as_mut_ptr(), len - first))
    }

    pub(crate) fn same_region(&self, other: &DmaView) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }
}

impl std::fmt::Debug for DmaView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaView").field("len", &self.len()).finish()
    }
}

/// Copy `len` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
/// The two regions wrap independently.
pub(crate) fn copy_wrapped(
    src: &DmaView,
    src_offset: usize,
    dst: &DmaView,
    dst_offset: usize,
    len: usize,
) {
    if src.is_empty() || dst.is_empty() {
        return;
    }
    let mut chunk = [0u8; 1024];
    // A region shorter than the chunk copies at most its own length per pass.
    let step = chunk.len().min(src.len()).min(dst.len());
    let mut done = 0;
    while done < len {
        let take = (len - done).min(step);
        let read = src.read_at(src_offset + done, &mut chunk[..take]);
        let written = dst.write_at(dst_offset + done, &chunk[..read]);
        if written == 0 {
            break;
        }
        done += written;
    }
}

/// Byte value of silence in `format`.
pub fn silence(format: &PcmFormat) -> u8 {
    match format.sample {
        SampleFormat::U8 => 0x80,
        SampleFormat::S16Le => 0,
    }
}

/// Forward distance from `from` to `to` on a ring of `len` bytes.
pub(crate) fn ring_distance(from: usize, to: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (to % len + len - from % len) % len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_source_repeats_across_a_longer_destination() {
        let client = DmaView::anonymous(960).expect("client");
        let pattern: Vec<u8> = (0..960).map(|i| (i % 251) as u8).collect();
        client.write_at(0, &pattern);
        let hardware = DmaView::anonymous(4096).expect("hardware");

        copy_wrapped(&client, 100, &hardware, 3000, 4096);

        let mut out = vec![0u8; 4096];
        hardware.read_at(0, &mut out);
        for k in 0..4096 {
            let hw = (3000 + k) % 4096;
            assert_eq!(out[hw], pattern[(100 + k) % 960], "byte {k}");
        }
    }

    #[test]
    fn short_destination_wraps_in_step_with_the_source() {
        let hardware = DmaView::anonymous(2048).expect("hardware");
        let pattern: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        hardware.write_at(0, &pattern);
        let client = DmaView::anonymous(600).expect("client");

        copy_wrapped(&hardware, 1500, &client, 0, 1200);

        let mut out = vec![0u8; 600];
        client.read_at(0, &mut out);
        // The second lap overwrites the first one.
        for i in 0..600 {
            assert_eq!(out[i], pattern[(1500 + 600 + i) % 2048], "byte {i}");
        }
    }
}
