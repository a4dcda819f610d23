use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::audio::SAMPLES_PER_FRAME;
use crate::codec::OpusDecoder;
use crate::error::VoiceError;
use crate::jitter::{JitterBuffer, JitterConfig, PopResult, PushOutcome};
use crate::session::StatsCell;

/// Where decoded audio goes. One 20ms frame of mono 48kHz 16-bit PCM per
/// call, tagged with the source it belongs to. The sink may be shared
/// with other application sounds; implementations must not block on the
/// network.
pub trait AudioSink: Send {
    fn play(&mut self, ssrc: u32, frame: &[i16]);
}

/// A sink that discards everything; the default until the caller installs
/// a real one.
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&mut self, _ssrc: u32, _frame: &[i16]) {}
}

/// Ticks with no playable audio before the buffer forgets its playout
/// position. A source that resumes after a long pause may have advanced
/// its sequence arbitrarily; reseeding beats concealing the false gap.
const IDLE_RESET_TICKS: u32 = 100;

/// Decode state for one remote source: its jitter buffer and its decoder.
pub(crate) struct ReceiveStream {
    jitter: JitterBuffer,
    decoder: OpusDecoder,
    idle_ticks: u32,
}

impl ReceiveStream {
    pub(crate) fn new(config: JitterConfig) -> Result<Self, VoiceError> {
        Ok(Self {
            jitter: JitterBuffer::new(config),
            decoder: OpusDecoder::new()?,
            idle_ticks: 0,
        })
    }

    pub(crate) fn push(&mut self, sequence: u16, timestamp: u32, payload: Vec<u8>, stats: &StatsCell) {
        if self.jitter.push(sequence, timestamp, payload) == PushOutcome::Late {
            stats.late_packets.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// One 20ms playback tick. Returns the frame to hand to the sink, or
    /// None when the buffer is still building headroom or the source has
    /// gone quiet.
    pub(crate) fn tick(&mut self, stats: &StatsCell) -> Option<Vec<i16>> {
        use std::sync::atomic::Ordering::Relaxed;
        let frame = match self.jitter.pop() {
            PopResult::Frame(packet) => match self.decoder.decode(&packet.payload) {
                Ok(pcm) => Some(pcm),
                Err(e) => {
                    warn!(sequence = packet.sequence, "decode failed, concealing: {}", e);
                    stats.decode_errors.fetch_add(1, Relaxed);
                    Some(self.decoder.decode_missing())
                }
            },
            PopResult::Missing => {
                stats.plc_frames.fetch_add(1, Relaxed);
                Some(self.decoder.decode_missing())
            }
            PopResult::Silence => {
                stats.silence_frames.fetch_add(1, Relaxed);
                Some(vec![0i16; SAMPLES_PER_FRAME])
            }
            PopResult::Waiting => None,
        };
        if frame.is_some() {
            self.idle_ticks = 0;
        } else {
            self.idle_ticks += 1;
            if self.idle_ticks == IDLE_RESET_TICKS {
                self.reset();
            }
        }
        frame
    }

    pub(crate) fn reset(&mut self) {
        self.jitter.reset();
        self.idle_ticks = 0;
    }
}

/// Per-source scheduled-start-time bookkeeping for the 20ms playout tick.
/// When a source's clock has fallen into the past (a stall, a long gap)
/// it is snapped forward rather than chased.
pub(crate) struct PlayoutSchedule {
    starts: HashMap<u32, Instant>,
}

pub(crate) const TICK: Duration = Duration::from_millis(20);
const SNAP_FORWARD: Duration = Duration::from_millis(50);

impl PlayoutSchedule {
    pub(crate) fn new() -> Self {
        Self {
            starts: HashMap::new(),
        }
    }

    /// Returns the scheduled start for the next frame of `ssrc` and
    /// advances the clock by one frame.
    pub(crate) fn frame_start(&mut self, ssrc: u32) -> Instant {
        let now = Instant::now();
        let slot = self.starts.entry(ssrc).or_insert(now);
        if *slot < now {
            debug!(ssrc, "playout clock in the past, snapping forward");
            *slot = now + SNAP_FORWARD;
        }
        let start = *slot;
        *slot = start + TICK;
        start
    }

    /// Drops clocks for sources that no longer have a stream.
    pub(crate) fn prune(&mut self, live: &[u32]) {
        self.starts.retain(|ssrc, _| live.contains(ssrc));
    }

    pub(crate) fn clear(&mut self) {
        self.starts.clear();
    }
}
