//! Software dsp device that advances in real time.
//!
//! A [`LoopbackDevice`] behaves like a small OSS card: it grants formats from
//! a fixed table, keeps a playback fifo that drains at the negotiated byte
//! rate while output is armed, produces a deterministic capture pattern while
//! input is armed, and exposes an anonymous mapping as its DMA buffer. Every
//! byte the "hardware" consumes is kept so callers can inspect what was
//! played.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use memmap2::{MmapOptions, MmapRaw};
use nix::libc;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    AFMT_S16_LE, AFMT_U8, Access, Backend, BufferInfo, CountInfo, DSP_CAP_DUPLEX, DSP_CAP_MMAP,
    DSP_CAP_REALTIME, DSP_CAP_TRIGGER, Dsp, PCM_ENABLE_INPUT, PCM_ENABLE_OUTPUT,
};
use crate::config::Quirks;
use crate::format::split_fragment_word;

/// Byte the loopback capture side produces at absolute position `index`.
pub fn capture_pattern(index: u64) -> u8 {
    (index % 251) as u8
}

/// Static description of a loopback card.
#[derive(Clone, Debug)]
pub struct LoopbackSpec {
    /// `GETCAPS` reply.
    pub caps: i32,
    /// Rates the card can run at; requests snap to the nearest.
    pub rates: Vec<u32>,
    /// Highest channel count.
    pub max_channels: u32,
    /// Mask of supported `AFMT_*` codes.
    pub formats: u32,
    /// Fragment layout used until `SETFRAGMENT` is called, as `(count, shift)`.
    pub default_fragment: (u32, u32),
    /// Largest hardware buffer in bytes.
    pub max_buffer: usize,
    /// Can be opened for playback.
    pub output: bool,
    /// Can be opened for capture.
    pub input: bool,
    /// Mixer node answering volume requests.
    pub mixer: Option<String>,
    /// Trigger mask rejected with `EINVAL`.
    pub reject_trigger: Option<i32>,
}

impl Default for LoopbackSpec {
    fn default() -> Self {
        Self {
            caps: DSP_CAP_DUPLEX | DSP_CAP_REALTIME | DSP_CAP_TRIGGER | DSP_CAP_MMAP,
            rates: vec![8_000, 11_025, 22_050, 44_100, 48_000],
            max_channels: 2,
            formats: AFMT_U8 | AFMT_S16_LE,
            default_fragment: (16, 12),
            max_buffer: 1 << 20,
            output: true,
            input: true,
            mixer: None,
            reject_trigger: None,
        }
    }
}

struct DeviceState {
    open: bool,
    access: Access,
    afmt: u32,
    rate: u32,
    channels: u32,
    frag_shift: u32,
    frag_count: u32,
    trigger: i32,
    needs_prime: bool,
    primed: bool,
    last_settle: Instant,
    carry_ns: u128,
    pending: VecDeque<u8>,
    played: Vec<u8>,
    consumed_total: u64,
    produced_total: u64,
    read_total: u64,
    dma: Option<Arc<MmapRaw>>,
    dma_out_total: u64,
    dma_in_total: u64,
    last_out_block: u64,
    last_in_block: u64,
    opens: usize,
    halts: usize,
    posts: usize,
    triggers: Vec<i32>,
}

impl DeviceState {
    fn new(spec: &LoopbackSpec) -> Self {
        Self {
            open: false,
            access: Access::ReadWrite,
            afmt: AFMT_U8,
            rate: 8_000,
            channels: 1,
            frag_shift: spec.default_fragment.1,
            frag_count: spec.default_fragment.0,
            trigger: 0,
            needs_prime: false,
            primed: false,
            last_settle: Instant::now(),
            carry_ns: 0,
            pending: VecDeque::new(),
            played: Vec::new(),
            consumed_total: 0,
            produced_total: 0,
            read_total: 0,
            dma: None,
            dma_out_total: 0,
            dma_in_total: 0,
            last_out_block: 0,
            last_in_block: 0,
            opens: 0,
            halts: 0,
            posts: 0,
            triggers: Vec::new(),
        }
    }

    fn reset_for_open(&mut self, spec: &LoopbackSpec, access: Access, needs_prime: bool) {
        let opens = self.opens;
        let halts = self.halts;
        let posts = self.posts;
        let played = std::mem::take(&mut self.played);
        let triggers = std::mem::take(&mut self.triggers);
        *self = DeviceState::new(spec);
        self.open = true;
        self.access = access;
        self.needs_prime = needs_prime;
        self.opens = opens + 1;
        self.halts = halts;
        self.posts = posts;
        self.played = played;
        self.triggers = triggers;
        // OSS enables every opened direction until told otherwise.
        if access.writable() {
            self.trigger |= PCM_ENABLE_OUTPUT;
        }
        if access.readable() {
            self.trigger |= PCM_ENABLE_INPUT;
        }
    }

    fn bytes_per_sec(&self) -> u128 {
        let width = if self.afmt == AFMT_S16_LE { 2 } else { 1 };
        self.rate as u128 * self.channels as u128 * width
    }

    fn frag_size(&self) -> usize {
        1usize << self.frag_shift
    }

    fn buffer_size(&self) -> usize {
        self.frag_size() * self.frag_count as usize
    }

    fn input_available(&self) -> usize {
        (self.produced_total - self.read_total) as usize
    }

    /// Advance the device clock to now.
    fn settle(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_settle).as_nanos();
        self.last_settle = now;
        let total = elapsed * self.bytes_per_sec() + self.carry_ns;
        let bytes = (total / 1_000_000_000) as usize;
        self.carry_ns = total % 1_000_000_000;
        if bytes == 0 {
            return;
        }

        if self.trigger & PCM_ENABLE_OUTPUT != 0 {
            if let Some(dma) = self.dma.clone() {
                self.advance_dma_output(&dma, bytes);
            } else if !self.needs_prime || self.primed {
                let n = bytes.min(self.pending.len());
                self.played.extend(self.pending.drain(..n));
                self.consumed_total += n as u64;
                if self.pending.is_empty() {
                    self.primed = false;
                }
            }
        }

        if self.trigger & PCM_ENABLE_INPUT != 0 {
            if let Some(dma) = self.dma.clone() {
                self.advance_dma_input(&dma, bytes);
            } else {
                self.produced_total += bytes as u64;
                let cap = self.buffer_size() as u64;
                if self.produced_total - self.read_total > cap {
                    self.read_total = self.produced_total - cap;
                }
            }
        }
    }

    fn advance_dma_output(&mut self, dma: &MmapRaw, bytes: usize) {
        let len = dma.len();
        if len == 0 {
            return;
        }
        let mut offset = (self.dma_out_total % len as u64) as usize;
        let mut remaining = bytes;
        while remaining > 0 {
            let take = (len - offset).min(remaining);
            let chunk = unsafe { std::slice::from_raw_parts(dma.as_ptr().add(offset), take) };
            self.played.extend_from_slice(chunk);
            remaining -= take;
            offset = 0;
        }
        self.dma_out_total += bytes as u64;
    }

    fn advance_dma_input(&mut self, dma: &MmapRaw, bytes: usize) {
        let len = dma.len();
        if len == 0 {
            return;
        }
        for i in 0..bytes as u64 {
            let absolute = self.dma_in_total + i;
            let offset = (absolute % len as u64) as usize;
            unsafe {
                *dma.as_mut_ptr().add(offset) = capture_pattern(absolute);
            }
        }
        self.dma_in_total += bytes as u64;
    }
}

/// A loopback card registered with a [`LoopbackBackend`].
pub struct LoopbackDevice {
    path: String,
    spec: LoopbackSpec,
    state: Mutex<DeviceState>,
}

impl LoopbackDevice {
    fn new(path: String, spec: LoopbackSpec) -> Self {
        let state = Mutex::new(DeviceState::new(&spec));
        Self { path, spec, state }
    }

    /// Node path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether a descriptor is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of times the node was opened.
    pub fn open_calls(&self) -> usize {
        self.state.lock().opens
    }

    /// Number of `HALT` calls.
    pub fn halt_calls(&self) -> usize {
        self.state.lock().halts
    }

    /// Number of `POST` calls.
    pub fn post_calls(&self) -> usize {
        self.state.lock().posts
    }

    /// Every trigger mask the device accepted, in order.
    pub fn trigger_history(&self) -> Vec<i32> {
        self.state.lock().triggers.clone()
    }

    /// Current trigger mask.
    pub fn trigger(&self) -> i32 {
        self.state.lock().trigger
    }

    /// Everything the device has played so far.
    pub fn played(&self) -> Vec<u8> {
        let mut state = self.state.lock();
        state.settle();
        state.played.clone()
    }

    /// Bytes played so far.
    pub fn played_len(&self) -> usize {
        let mut state = self.state.lock();
        state.settle();
        state.played.len()
    }

    /// `(fragment size, fragment count)` currently in effect.
    pub fn fragment_layout(&self) -> (usize, u32) {
        let state = self.state.lock();
        (state.frag_size(), state.frag_count)
    }
}

/// Backend serving [`LoopbackDevice`]s by path.
pub struct LoopbackBackend {
    devices: Mutex<HashMap<String, Arc<LoopbackDevice>>>,
    mixers: Mutex<HashMap<String, (u8, u8)>>,
    quirks: Quirks,
}

impl LoopbackBackend {
    /// Backend without quirks.
    pub fn new() -> Self {
        Self::with_quirks(Quirks::empty())
    }

    /// Backend declaring `quirks`.
    pub fn with_quirks(quirks: Quirks) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            mixers: Mutex::new(HashMap::new()),
            quirks,
        }
    }

    /// Register a card at `path`.
    pub fn add_device(&self, path: impl Into<String>, spec: LoopbackSpec) -> Arc<LoopbackDevice> {
        let path = path.into();
        if let Some(mixer) = &spec.mixer {
            self.mixers.lock().insert(mixer.clone(), (75, 75));
        }
        let device = Arc::new(LoopbackDevice::new(path.clone(), spec));
        self.devices.lock().insert(path, Arc::clone(&device));
        device
    }

    /// Look up a registered card.
    pub fn device(&self, path: &str) -> Option<Arc<LoopbackDevice>> {
        self.devices.lock().get(path).cloned()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn os_error(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl Backend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn exists(&self, path: &str) -> bool {
        self.devices.lock().contains_key(path)
    }

    fn open(&self, path: &str, access: Access) -> io::Result<Arc<dyn Dsp>> {
        let device = self.device(path).ok_or_else(|| os_error(libc::ENOENT))?;
        if (access.writable() && !device.spec.output) || (access.readable() && !device.spec.input)
        {
            return Err(os_error(libc::ENODEV));
        }
        {
            let mut state = device.state.lock();
            if state.open {
                return Err(os_error(libc::EBUSY));
            }
            let needs_prime = self.quirks.contains(Quirks::NEEDS_PRIME);
            state.reset_for_open(&device.spec, access, needs_prime);
        }
        debug!(path, ?access, "loopback node opened");
        Ok(Arc::new(LoopbackDsp { device }))
    }

    fn default_quirks(&self) -> Quirks {
        self.quirks
    }

    fn mixer_volume(&self, mixer: &str) -> io::Result<(u8, u8)> {
        self.mixers
            .lock()
            .get(mixer)
            .copied()
            .ok_or_else(|| os_error(libc::ENOENT))
    }

    fn set_mixer_volume(&self, mixer: &str, left: u8, right: u8) -> io::Result<()> {
        let mut mixers = self.mixers.lock();
        match mixers.get_mut(mixer) {
            Some(level) => {
                *level = (left.min(100), right.min(100));
                Ok(())
            }
            None => Err(os_error(libc::ENOENT)),
        }
    }
}

struct LoopbackDsp {
    device: Arc<LoopbackDevice>,
}

impl LoopbackDsp {
    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> T {
        let mut state = self.device.state.lock();
        state.settle();
        f(&mut state)
    }
}

impl Drop for LoopbackDsp {
    fn drop(&mut self) {
        let mut state = self.device.state.lock();
        state.settle();
        state.open = false;
        state.dma = None;
        state.pending.clear();
    }
}

impl Dsp for LoopbackDsp {
    fn set_duplex(&self) -> io::Result<()> {
        if self.device.spec.caps & DSP_CAP_DUPLEX == 0 {
            return Err(os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn set_fragment(&self, word: u32) -> io::Result<u32> {
        let spec = &self.device.spec;
        self.with_state(|state| {
            let (count, shift) = split_fragment_word(word);
            let shift = shift.clamp(4, 16);
            let max_count = (spec.max_buffer >> shift).max(2) as u32;
            let count = if count == 0 { state.frag_count } else { count };
            state.frag_shift = shift;
            state.frag_count = count.clamp(2, max_count);
            Ok((state.frag_count << 16) | state.frag_shift)
        })
    }

    fn set_format(&self, afmt: u32) -> io::Result<u32> {
        let supported = self.device.spec.formats;
        self.with_state(|state| {
            state.afmt = if supported & afmt != 0 {
                afmt
            } else if supported & AFMT_U8 != 0 {
                AFMT_U8
            } else {
                AFMT_S16_LE
            };
            Ok(state.afmt)
        })
    }

    fn set_speed(&self, rate: u32) -> io::Result<u32> {
        let rates = &self.device.spec.rates;
        self.with_state(|state| {
            let nearest = rates
                .iter()
                .copied()
                .min_by_key(|r| (*r as i64 - rate as i64).abs())
                .unwrap_or(rate);
            state.rate = nearest;
            Ok(nearest)
        })
    }

    fn set_channels(&self, channels: u32) -> io::Result<u32> {
        let max = self.device.spec.max_channels.max(1);
        self.with_state(|state| {
            state.channels = channels.clamp(1, max);
            Ok(state.channels)
        })
    }

    fn caps(&self) -> io::Result<i32> {
        Ok(self.device.spec.caps)
    }

    fn set_trigger(&self, mask: i32) -> io::Result<()> {
        if self.device.spec.caps & DSP_CAP_TRIGGER == 0 {
            return Err(os_error(libc::EINVAL));
        }
        if self.device.spec.reject_trigger == Some(mask) {
            return Err(os_error(libc::EINVAL));
        }
        self.with_state(|state| {
            state.trigger = mask;
            state.triggers.push(mask);
            Ok(())
        })
    }

    fn output_space(&self) -> io::Result<BufferInfo> {
        self.with_state(|state| {
            let size = state.buffer_size();
            let free = size.saturating_sub(state.pending.len());
            Ok(BufferInfo {
                fragments: (free / state.frag_size()) as i32,
                fragstotal: state.frag_count as i32,
                fragsize: state.frag_size() as i32,
                bytes: free as i32,
            })
        })
    }

    fn input_space(&self) -> io::Result<BufferInfo> {
        self.with_state(|state| {
            let available = state.input_available();
            Ok(BufferInfo {
                fragments: (available / state.frag_size()) as i32,
                fragstotal: state.frag_count as i32,
                fragsize: state.frag_size() as i32,
                bytes: available as i32,
            })
        })
    }

    fn output_ptr(&self) -> io::Result<CountInfo> {
        self.with_state(|state| {
            let total = if state.dma.is_some() {
                state.dma_out_total
            } else {
                state.consumed_total
            };
            let size = state.buffer_size().max(1) as u64;
            let block = total / state.frag_size() as u64;
            let blocks = block - state.last_out_block;
            state.last_out_block = block;
            Ok(CountInfo {
                bytes: total as i32,
                blocks: blocks as i32,
                ptr: (total % size) as i32,
            })
        })
    }

    fn input_ptr(&self) -> io::Result<CountInfo> {
        self.with_state(|state| {
            let total = if state.dma.is_some() {
                state.dma_in_total
            } else {
                state.produced_total
            };
            let size = state.buffer_size().max(1) as u64;
            let block = total / state.frag_size() as u64;
            let blocks = block - state.last_in_block;
            state.last_in_block = block;
            Ok(CountInfo {
                bytes: total as i32,
                blocks: blocks as i32,
                ptr: (total % size) as i32,
            })
        })
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.with_state(|state| {
            if !state.access.writable() {
                return Err(os_error(libc::EBADF));
            }
            let free = state.buffer_size().saturating_sub(state.pending.len());
            let n = data.len().min(free);
            state.pending.extend(&data[..n]);
            if state.pending.len() >= 2 * state.frag_size() {
                state.primed = true;
            }
            Ok(n)
        })
    }

    fn read(&self, data: &mut [u8]) -> io::Result<usize> {
        self.with_state(|state| {
            if !state.access.readable() {
                return Err(os_error(libc::EBADF));
            }
            let n = data.len().min(state.input_available());
            for (i, byte) in data[..n].iter_mut().enumerate() {
                *byte = capture_pattern(state.read_total + i as u64);
            }
            state.read_total += n as u64;
            Ok(n)
        })
    }

    fn post(&self) -> io::Result<()> {
        self.with_state(|state| {
            state.posts += 1;
            state.primed = true;
            Ok(())
        })
    }

    fn halt(&self) -> io::Result<()> {
        self.with_state(|state| {
            state.halts += 1;
            state.pending.clear();
            state.read_total = state.produced_total;
            state.primed = false;
            Ok(())
        })
    }

    fn map_dma(&self, len: usize) -> io::Result<Arc<MmapRaw>> {
        self.with_state(|state| {
            if len != state.buffer_size() {
                return Err(os_error(libc::EINVAL));
            }
            let map = MmapRaw::from(MmapOptions::new().len(len).map_anon()?);
            let map = Arc::new(map);
            state.dma = Some(Arc::clone(&map));
            state.dma_out_total = 0;
            state.dma_in_total = 0;
            Ok(map)
        })
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}
