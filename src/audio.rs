//! Audio constants and the capture-side abstraction.

pub const SAMPLING_RATE: u32 = 48_000;
pub const CHANNELS: u8 = 1;
pub const FRAME_MILLIS: u32 = 20;
/// Samples per Opus frame (20ms of mono 48kHz audio).
pub const SAMPLES_PER_FRAME: usize = ((SAMPLING_RATE / 1000) * FRAME_MILLIS) as usize;
pub const BITRATE: i32 = 48_000;

pub trait CaptureSource: Send {
    /// Reads a block of mono 48kHz float samples in [-1, 1].
    /// Blocks until the capture device has data, at the device's own pace.
    /// Returns Some(num) where num is the number of samples written to the
    /// buffer, or None once the source has terminated.
    fn read_block(&mut self, buffer: &mut [f32]) -> Option<usize>;
}
