use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};
use tracing::{debug, trace, warn};
use tungstenite::error::Error as TungError;
use tungstenite::protocol::{frame::coding::CloseCode, frame::CloseFrame, WebSocket};
use tungstenite::Message;

use crate::error::{custom_error, VoiceError};
use crate::payloads::*;
use crate::session::StatsCell;

/// A parsed `ws://` or `wss://` signaling endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub url: String,
}

pub(crate) fn parse_ws_url(raw: &str) -> Result<Endpoint, VoiceError> {
    let (secure, rest) = if let Some(rest) = raw.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(VoiceError::BadUrl(raw.to_owned()));
    };

    let authority = rest.splitn(2, '/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(VoiceError::BadUrl(raw.to_owned()));
    }

    let (host, port) = match authority.rfind(':') {
        Some(index) => {
            let port = authority[index + 1..]
                .parse::<u16>()
                .map_err(|_| VoiceError::BadUrl(raw.to_owned()))?;
            (authority[..index].to_owned(), port)
        }
        None => (authority.to_owned(), if secure { 443 } else { 80 }),
    };

    Ok(Endpoint {
        secure,
        host,
        port,
        url: raw.to_owned(),
    })
}

pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl MaybeTlsStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain(stream) => stream,
            MaybeTlsStream::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for MaybeTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.read(buf),
            MaybeTlsStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for MaybeTlsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.write(buf),
            MaybeTlsStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.flush(),
            MaybeTlsStream::Tls(stream) => stream.flush(),
        }
    }
}

/// One inbound signaling event, already parsed past the opcode envelope.
/// Untyped payloads never travel beyond this boundary.
#[derive(Debug)]
pub(crate) enum SignalingEvent {
    Ready(Ready),
    SessionDescribe(SessionDescribe),
    HeartbeatAck,
    UserJoin(UserJoin),
    UserLeave(UserLeave),
    UserSpeaking(UserSpeaking),
    Resumed,
    /// A binary frame: one sealed RTP packet.
    Media(Vec<u8>),
}

fn parse_payload<'a, T: serde::Deserialize<'a>>(
    name: &str,
    d: Option<&'a serde_json::value::RawValue>,
    stats: &StatsCell,
) -> Option<T> {
    let raw = match d {
        Some(raw) => raw.get(),
        None => "null",
    };
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("dropping {} with mismatched schema: {}", name, e);
            stats
                .schema_drops
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            None
        }
    }
}

/// Parses one text frame into an event. Unknown opcodes and schema
/// mismatches yield None; both are non-fatal by design of the protocol.
fn parse_signaling_text(raw: &str, stats: &StatsCell) -> Option<SignalingEvent> {
    use std::sync::atomic::Ordering::Relaxed;

    let payload: RawReceivedPayload = match serde_json::from_str(raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("dropping unparseable signaling frame: {}", e);
            stats.schema_drops.fetch_add(1, Relaxed);
            return None;
        }
    };

    match payload.op {
        Opcode::READY => {
            parse_payload::<Ready>("Ready", payload.d, stats).map(SignalingEvent::Ready)
        }
        Opcode::SESSION_DESCRIBE => {
            parse_payload::<SessionDescribe>("SessionDescribe", payload.d, stats)
                .map(SignalingEvent::SessionDescribe)
        }
        Opcode::HEARTBEAT_ACK => Some(SignalingEvent::HeartbeatAck),
        Opcode::USER_JOIN => {
            parse_payload::<UserJoin>("UserJoin", payload.d, stats).map(SignalingEvent::UserJoin)
        }
        Opcode::USER_LEAVE => {
            parse_payload::<UserLeave>("UserLeave", payload.d, stats).map(SignalingEvent::UserLeave)
        }
        Opcode::USER_SPEAKING => parse_payload::<UserSpeaking>("UserSpeaking", payload.d, stats)
            .map(SignalingEvent::UserSpeaking),
        Opcode::RESUMED => Some(SignalingEvent::Resumed),
        op => {
            debug!(op, "ignoring unknown opcode");
            stats.unknown_opcodes.fetch_add(1, Relaxed);
            None
        }
    }
}

/// The ordered duplex channel to the SFU: JSON opcodes as text frames,
/// sealed RTP packets as binary frames.
pub(crate) struct SignalingConnection {
    ws: WebSocket<MaybeTlsStream>,
    close_code: u16,
    stats: Arc<StatsCell>,
}

impl SignalingConnection {
    /// Opens the websocket. The handshake runs blocking; once the channel
    /// is up the socket switches to a short read timeout so `poll` can
    /// interleave with sends and heartbeats on one thread.
    pub fn open(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        read_timeout: Duration,
        stats: Arc<StatsCell>,
    ) -> Result<Self, VoiceError> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| VoiceError::BadUrl(endpoint.url.clone()))?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)?;
        tcp.set_nodelay(true)?;
        // A generous timeout while the TLS and websocket handshakes run;
        // tightened to the poll interval once the channel is up.
        tcp.set_read_timeout(Some(connect_timeout))?;

        let stream = if endpoint.secure {
            let connector = TlsConnector::new()?;
            let tls = connector
                .connect(&endpoint.host, tcp)
                .map_err(|e| custom_error(&e.to_string()))?;
            MaybeTlsStream::Tls(tls)
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        debug!(url = %endpoint.url, "opening signaling channel");
        let ws = match tungstenite::client::client(endpoint.url.as_str(), stream) {
            Ok((ws, _response)) => ws,
            Err(e) => return Err(custom_error(&e.to_string())),
        };
        ws.get_ref().tcp().set_read_timeout(Some(read_timeout))?;

        Ok(Self {
            ws,
            close_code: 1000,
            stats,
        })
    }

    /// Reads at most one frame. Ok(None) means the read timed out or the
    /// frame was dropped as unparseable; the caller just polls again.
    pub fn poll(&mut self) -> Result<Option<SignalingEvent>, VoiceError> {
        let msg = match self.ws.read_message() {
            Err(TungError::Io(ref e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(TungError::ConnectionClosed) | Err(TungError::AlreadyClosed) => {
                return Err(VoiceError::Closed(self.close_code));
            }
            Err(e) => return Err(VoiceError::from(e)),
            Ok(msg) => msg,
        };

        match msg {
            Message::Text(text) => Ok(parse_signaling_text(&text, &self.stats)),
            Message::Binary(frame) => {
                trace!(len = frame.len(), "received media frame");
                Ok(Some(SignalingEvent::Media(frame)))
            }
            Message::Close(frame) => {
                debug!("received close frame: {:?}", frame);
                if let Some(frame) = frame {
                    self.close_code = u16::from(frame.code);
                }
                Err(VoiceError::Closed(self.close_code))
            }
            _ => Ok(None),
        }
    }

    fn send_text<T: serde::Serialize>(&mut self, msg: &T) -> Result<(), VoiceError> {
        self.ws
            .write_message(Message::text(serde_json::to_string(msg)?))?;
        Ok(())
    }

    pub fn identify(&mut self, info: IdentifyInfo) -> Result<(), VoiceError> {
        debug!(room_id = %info.room_id, session_id = %info.session_id, "identifying");
        self.send_text(&Identify::new(info))
    }

    pub fn select_protocol(&mut self, mode: EncryptionMode) -> Result<(), VoiceError> {
        self.send_text(&SelectProtocol::from_mode(mode))
    }

    pub fn heartbeat(&mut self, nonce: u64) -> Result<(), VoiceError> {
        trace!(nonce, "heartbeating");
        self.send_text(&Heartbeat::new(nonce))
    }

    pub fn speaking(&mut self, flags: SpeakingFlags, ssrc: u32) -> Result<(), VoiceError> {
        debug!(flags = flags.bits(), ssrc, "sending speaking state");
        self.send_text(&Speaking::new(flags, ssrc))
    }

    pub fn client_disconnect(&mut self) -> Result<(), VoiceError> {
        self.send_text(&ClientDisconnect::new())
    }

    /// Sends one sealed RTP packet as a binary frame.
    pub fn send_media(&mut self, frame: Vec<u8>) -> Result<(), VoiceError> {
        self.ws.write_message(Message::Binary(frame))?;
        Ok(())
    }

    pub fn close(&mut self, code: u16) -> Result<(), VoiceError> {
        self.close_code = code;
        self.ws.close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: std::borrow::Cow::Owned("closing connection".to_string()),
        }))?;
        Ok(())
    }
}
