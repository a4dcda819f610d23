use nnnoiseless::DenoiseState;

/// Samples per denoiser frame (10ms of mono 48kHz audio).
pub const DENOISE_FRAME: usize = DenoiseState::FRAME_SIZE;

// The rnnoise model works on float samples in the 16-bit integer range;
// the pipeline works in [-1, 1], so we rescale at both edges.
const SCALE: f32 = 32767.0;

/// Stateful spectral noise suppression over 10ms frames.
///
/// Input below one full frame is held back; `process` returns whatever
/// whole frames the accumulated input yields.
pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
}

impl Denoiser {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::with_capacity(DENOISE_FRAME * 2),
        }
    }

    /// Feeds captured samples in [-1, 1] and returns the denoised samples
    /// available so far, in the same range. Empty until a full 10ms frame
    /// has accumulated.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let frames = self.pending.len() / DENOISE_FRAME;
        if frames == 0 {
            return Vec::new();
        }

        let mut output = Vec::with_capacity(frames * DENOISE_FRAME);
        let mut scaled = [0.0f32; DENOISE_FRAME];
        let mut denoised = [0.0f32; DENOISE_FRAME];
        for chunk in self.pending.chunks_exact(DENOISE_FRAME).take(frames) {
            for (dst, src) in scaled.iter_mut().zip(chunk) {
                *dst = src * SCALE;
            }
            let _vad = self.state.process_frame(&mut denoised, &scaled);
            output.extend(denoised.iter().map(|s| (s / SCALE).max(-1.0).min(1.0)));
        }
        self.pending.drain(..frames * DENOISE_FRAME);
        output
    }

    /// Zero-pads any held-back samples to a full frame and drains them.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.pending.resize(DENOISE_FRAME, 0.0);
        let tail = std::mem::replace(&mut self.pending, Vec::new());
        self.process(&tail)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new()
    }
}
