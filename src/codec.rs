use audiopus::coder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use tracing::trace;

use crate::audio::{BITRATE, SAMPLES_PER_FRAME};
use crate::error::VoiceError;

/// Big enough for any Opus packet this encoder can emit; the ideal frame
/// tops out at 1275 bytes.
const MAX_PACKET: usize = 1500;

/// Mono VoIP encoder: one 20ms frame of PCM in, one Opus packet out.
pub struct OpusEncoder {
    inner: coder::Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, VoiceError> {
        let mut encoder = coder::Encoder::new(
            SampleRate::Hz48000,
            Channels::Mono,
            Application::Voip,
        )?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(BITRATE))?;
        Ok(Self { inner: encoder })
    }

    /// Encodes exactly one 960-sample frame.
    pub fn encode(&mut self, frame: &[i16]) -> Result<Vec<u8>, VoiceError> {
        let mut output = [0u8; MAX_PACKET];
        let size = self.inner.encode(frame, &mut output)?;
        trace!(bytes = size, "encoded opus frame");
        Ok(output[..size].to_vec())
    }
}

/// Mono decoder with packet-loss concealment.
pub struct OpusDecoder {
    inner: coder::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, VoiceError> {
        let decoder = coder::Decoder::new(SampleRate::Hz48000, Channels::Mono)?;
        Ok(Self { inner: decoder })
    }

    /// Decodes one packet into exactly one 20ms frame of 16-bit PCM.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, VoiceError> {
        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = self.inner.decode(Some(packet), &mut pcm, false)?;
        pcm.truncate(decoded);
        pcm.resize(SAMPLES_PER_FRAME, 0);
        Ok(pcm)
    }

    /// Produces the decoder's concealment estimate for one lost frame,
    /// falling back to silence if the decoder cannot provide one.
    pub fn decode_missing(&mut self) -> Vec<i16> {
        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        match self.inner.decode(None::<&[u8]>, &mut pcm, false) {
            Ok(decoded) => {
                pcm.truncate(decoded);
                pcm.resize(SAMPLES_PER_FRAME, 0);
                pcm
            }
            Err(_) => vec![0i16; SAMPLES_PER_FRAME],
        }
    }
}
