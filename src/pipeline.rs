use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::audio::SAMPLES_PER_FRAME;
use crate::codec::OpusEncoder;
use crate::denoise::{Denoiser, DENOISE_FRAME};
use crate::error::VoiceError;

/// Pure data transformer from capture blocks to Opus packets.
///
/// Capture delivers arbitrarily sized blocks; the pipeline re-chunks them
/// to the 10ms boundary the denoiser wants and the 20ms boundary the
/// encoder wants, using one ring buffer on each side of the denoiser.
/// No I/O, no clocks.
pub struct AudioPipeline {
    denoiser: Denoiser,
    denoise_enabled: Arc<AtomicBool>,
    encoder: OpusEncoder,
    raw: VecDeque<f32>,
    clean: VecDeque<f32>,
}

impl AudioPipeline {
    pub fn new(denoise_enabled: Arc<AtomicBool>) -> Result<Self, VoiceError> {
        Ok(Self {
            denoiser: Denoiser::new(),
            denoise_enabled,
            encoder: OpusEncoder::new()?,
            raw: VecDeque::with_capacity(DENOISE_FRAME * 4),
            clean: VecDeque::with_capacity(SAMPLES_PER_FRAME * 2),
        })
    }

    /// Whether the denoiser stage is currently active. Toggling the flag
    /// takes effect on the next `process` call; the pipeline is not
    /// rebuilt.
    pub fn denoise_enabled(&self) -> bool {
        self.denoise_enabled.load(Ordering::Relaxed)
    }

    /// Accepts one capture block and returns zero or more Opus packets.
    /// A frame the encoder rejects is dropped; the stream continues.
    pub fn process(&mut self, block: &[f32]) -> Vec<Vec<u8>> {
        self.raw.extend(block.iter().copied());
        if self.denoise_enabled() {
            while self.raw.len() >= DENOISE_FRAME {
                let frame: Vec<f32> = self.raw.drain(..DENOISE_FRAME).collect();
                self.clean.extend(self.denoiser.process(&frame));
            }
        } else {
            self.clean.extend(self.raw.drain(..));
        }
        self.encode_ready()
    }

    /// Zero-pads and drains both stages. Call when capture stops.
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        if self.denoise_enabled() {
            if !self.raw.is_empty() {
                let tail: Vec<f32> = self.raw.drain(..).collect();
                self.clean.extend(self.denoiser.process(&tail));
            }
            self.clean.extend(self.denoiser.flush());
        } else {
            self.clean.extend(self.raw.drain(..));
        }
        if !self.clean.is_empty() {
            let pad = (SAMPLES_PER_FRAME - self.clean.len() % SAMPLES_PER_FRAME) % SAMPLES_PER_FRAME;
            for _ in 0..pad {
                self.clean.push_back(0.0);
            }
        }
        self.encode_ready()
    }

    fn encode_ready(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        while self.clean.len() >= SAMPLES_PER_FRAME {
            // Float leaves the pipeline here; clamp once at the boundary.
            let frame: Vec<i16> = self
                .clean
                .drain(..SAMPLES_PER_FRAME)
                .map(|s| (s.max(-1.0).min(1.0) * 32767.0) as i16)
                .collect();
            match self.encoder.encode(&frame) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("dropping frame the encoder rejected: {}", e),
            }
        }
        packets
    }

    #[cfg(test)]
    fn buffered(&self) -> (usize, usize) {
        (self.raw.len(), self.clean.len())
    }
}
