//! Test-signal generation for the console and the self tests.

use std::time::Duration;

use dasp_signal::{self as signal, ConstHz, Signal, Sine};

use crate::format::{PcmFormat, SampleFormat};

/// Phase-continuous sine rendered as PCM bytes in a negotiated format.
pub struct ToneGenerator {
    format: PcmFormat,
    sine: Sine<ConstHz>,
    amplitude: f64,
}

impl ToneGenerator {
    /// Sine at `frequency` Hz scaled by `amplitude` (0.0..=1.0).
    pub fn new(format: PcmFormat, frequency: f64, amplitude: f64) -> Self {
        let sine = signal::rate(format.rate as f64).const_hz(frequency).sine();
        Self {
            format,
            sine,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Format the generator renders.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Fill `out` with whole frames; a trailing partial frame is left alone.
    /// Returns the number of frames written.
    pub fn fill(&mut self, out: &mut [u8]) -> usize {
        let frame_len = self.format.block_align().max(1);
        let width = (self.format.sample.bits() / 8) as usize;
        let mut frames = 0;
        for frame in out.chunks_exact_mut(frame_len) {
            let value = self.sine.next() * self.amplitude;
            for sample in frame.chunks_exact_mut(width) {
                encode(self.format.sample, value, sample);
            }
            frames += 1;
        }
        frames
    }

    /// Render `bytes` bytes (rounded down to whole frames).
    pub fn render(&mut self, bytes: usize) -> Vec<u8> {
        let frame_len = self.format.block_align().max(1);
        let mut out = vec![0; bytes - bytes % frame_len];
        self.fill(&mut out);
        out
    }

    /// Render `duration` worth of audio.
    pub fn render_for(&mut self, duration: Duration) -> Vec<u8> {
        let frames = (duration.as_secs_f64() * self.format.rate as f64) as usize;
        self.render(frames * self.format.block_align())
    }
}

fn encode(sample: SampleFormat, value: f64, out: &mut [u8]) {
    let value = value.clamp(-1.0, 1.0);
    match sample {
        SampleFormat::U8 => out[0] = ((value * 127.0) + 128.0).round() as u8,
        SampleFormat::S16Le => {
            let pcm = (value * i16::MAX as f64).round() as i16;
            out.copy_from_slice(&pcm.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_whole_frames() {
        let mut tone = ToneGenerator::new(PcmFormat::stereo16(48_000), 440.0, 0.5);
        let bytes = tone.render(1_003);
        assert_eq!(bytes.len(), 1_000);
    }

    #[test]
    fn u8_silence_sits_at_midpoint() {
        let format = PcmFormat::new(8_000, 1, SampleFormat::U8);
        let mut tone = ToneGenerator::new(format, 440.0, 0.0);
        assert!(tone.render(64).iter().all(|&b| b == 128));
    }

    #[test]
    fn channels_carry_the_same_sample() {
        let mut tone = ToneGenerator::new(PcmFormat::stereo16(44_100), 1_000.0, 0.8);
        let bytes = tone.render_for(Duration::from_millis(10));
        assert_eq!(bytes.len(), 441 * 4);
        for frame in bytes.chunks_exact(4) {
            assert_eq!(frame[..2], frame[2..]);
        }
    }
}
