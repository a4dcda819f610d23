use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the voice client.
///
/// Packet-level faults (failed auth, malformed headers, single-frame codec
/// errors) never surface through this type during steady state; they are
/// counted and logged where they occur. `VoiceError` is what the connect
/// and reconnect machinery reports when a session cannot make progress.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("malformed signaling payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("opus codec error: {0}")]
    Opus(#[from] audiopus::error::Error),
    #[error("packet failed authentication")]
    AuthFailed,
    #[error("malformed rtp packet")]
    MalformedPacket,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::error::Error),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signaling channel closed (code: {0})")]
    Closed(u16),
    #[error("invalid signaling url: {0}")]
    BadUrl(String),
    #[error("unsupported encryption mode: {0}")]
    UnsupportedMode(String),
    #[error("secret key is not a 32-byte base64 value")]
    BadSecretKey,
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("heartbeat acknowledgements stopped")]
    HeartbeatLost,
    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

pub(crate) fn custom_error(text: &str) -> VoiceError {
    let inner = std::io::Error::new(std::io::ErrorKind::Other, text);
    VoiceError::Io(inner)
}
