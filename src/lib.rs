//! A native voice client for SFU voice rooms.
//!
//! The crate implements the real-time half of a chat-and-voice client:
//! it negotiates keys over a signaling websocket, runs captured
//! microphone audio through optional noise suppression and an Opus
//! encoder, seals each packet with the session key behind a clear RTP
//! header, and symmetrically receives, reorders, conceals, decodes and
//! schedules playback of every other participant's packets. A supervisor
//! reconnects dropped transports with exponential backoff while keeping
//! the same `session_id`, so brief network interruptions do not end the
//! call.
//!
//! The entry point is [`VoiceSession`], built through
//! [`VoiceSessionBuilder`]:
//!
//! ```no_run
//! use native_voice::VoiceSession;
//!
//! let mut builder = VoiceSession::builder("wss://voice.example.com/session".to_string());
//! builder
//!     .room("room-1".to_string())
//!     .user("user-7".to_string())
//!     .auth("token".to_string());
//! let session = builder.build();
//! session.connect();
//! ```
//!
//! Audio I/O is abstracted: the caller supplies a [`CaptureSource`] of
//! mono 48kHz float samples and an [`AudioSink`] that accepts decoded
//! 16-bit frames tagged by synchronization source.

pub mod audio;
pub mod codec;
pub mod crypto;
pub mod denoise;
pub mod error;
pub mod jitter;
pub mod payloads;
pub mod pipeline;
pub mod playback;
mod protocol;
pub mod session;
mod state;

pub use crate::audio::CaptureSource;
pub use crate::error::VoiceError;
pub use crate::jitter::{JitterBuffer, JitterConfig};
pub use crate::payloads::SpeakingFlags;
pub use crate::pipeline::AudioPipeline;
pub use crate::playback::AudioSink;
pub use crate::session::{
    Participant, VoiceConfig, VoiceObserver, VoiceSession, VoiceSessionBuilder, VoiceStats,
};
pub use crate::state::ConnectionState;
