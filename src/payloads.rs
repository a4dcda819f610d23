use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::VoiceError;
use std::str::FromStr;

// Static typed models for the signaling wire format. Every message is a
// JSON object `{ op, d }`; binary frames on the same channel carry RTP
// packets and never reach this module.

pub struct Opcode;

impl Opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIBE: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const USER_JOIN: u8 = 7;
    pub const USER_LEAVE: u8 = 8;
    pub const USER_SPEAKING: u8 = 9;
    pub const RESUMED: u8 = 11;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

// These are sent

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub room_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub op: u8,
    pub d: IdentifyInfo,
}

impl Identify {
    pub(crate) fn new(info: IdentifyInfo) -> Self {
        Self {
            op: Opcode::IDENTIFY,
            d: info,
        }
    }
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolInfo {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolWrapper {
    pub protocol: String,
    pub data: SelectProtocolInfo,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub op: u8,
    pub d: SelectProtocolWrapper,
}

impl SelectProtocol {
    /// The address and port are informational on a stream transport; the
    /// server keys off `mode` alone.
    pub fn from_mode(mode: EncryptionMode) -> Self {
        Self {
            op: Opcode::SELECT_PROTOCOL,
            d: SelectProtocolWrapper {
                protocol: "udp".to_string(),
                data: SelectProtocolInfo {
                    address: "0.0.0.0".to_string(),
                    port: 0,
                    mode: mode.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub nonce: u64,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub op: u8,
    pub d: HeartbeatInfo,
}

impl Heartbeat {
    pub fn new(nonce: u64) -> Self {
        Self {
            op: Opcode::HEARTBEAT,
            d: HeartbeatInfo { nonce },
        }
    }
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub op: u8,
    pub d: EmptyPayload,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct EmptyPayload {}

impl ClientDisconnect {
    pub fn new() -> Self {
        Self {
            op: Opcode::CLIENT_DISCONNECT,
            d: EmptyPayload {},
        }
    }
}

// These can be received and sent

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakingFlags {
    value: u8,
}

impl Default for SpeakingFlags {
    fn default() -> Self {
        Self { value: 0 }
    }
}

impl SpeakingFlags {
    pub const MICROPHONE: u8 = 1 << 0;
    pub const SOUNDSHARE: u8 = 1 << 1;
    pub const PRIORITY: u8 = 1 << 2;

    pub fn new(value: u8) -> Self {
        Self { value }
    }

    pub fn off() -> Self {
        Self { value: 0 }
    }

    pub fn microphone() -> Self {
        Self {
            value: Self::MICROPHONE,
        }
    }

    pub fn soundshare() -> Self {
        Self {
            value: Self::SOUNDSHARE,
        }
    }

    pub fn priority() -> Self {
        Self {
            value: Self::PRIORITY,
        }
    }

    pub fn toggle(&mut self, value: u8) -> &mut Self {
        self.value |= value;
        self
    }

    pub fn contains(&self, value: u8) -> bool {
        self.value & value != 0
    }

    pub fn is_off(&self) -> bool {
        self.value == 0
    }

    pub fn bits(&self) -> u8 {
        self.value
    }
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SpeakingInfo {
    pub speaking: SpeakingFlags,
    pub delay: u8,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
    pub op: u8,
    pub d: SpeakingInfo,
}

impl Speaking {
    pub fn new(flags: SpeakingFlags, ssrc: u32) -> Self {
        Self {
            op: Opcode::SPEAKING,
            d: SpeakingInfo {
                speaking: flags,
                delay: 0,
                ssrc,
            },
        }
    }
}

// These are receive only

#[derive(Debug, Serialize, Deserialize)]
pub struct RawReceivedPayload<'a> {
    pub op: u8,
    #[serde(borrow, default)]
    pub d: Option<&'a RawValue>,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SessionDescribe {
    pub mode: String,
    pub secret_key: String,
    pub audio_codec: String,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct UserJoin {
    pub user_id: String,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct UserLeave {
    pub user_id: String,
}

#[derive(Debug, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct UserSpeaking {
    pub user_id: String,
    pub ssrc: u32,
    pub speaking: SpeakingFlags,
}

/// Encryption modes the client can negotiate, ordered by priority.
#[derive(Debug, PartialOrd, Ord, Eq, PartialEq, Copy, Clone)]
pub enum EncryptionMode {
    XSalsa20Poly1305,
}

impl Default for EncryptionMode {
    fn default() -> Self {
        EncryptionMode::XSalsa20Poly1305
    }
}

impl Into<String> for EncryptionMode {
    fn into(self) -> String {
        match self {
            EncryptionMode::XSalsa20Poly1305 => "xsalsa20_poly1305".to_owned(),
        }
    }
}

impl FromStr for EncryptionMode {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xsalsa20_poly1305" => Ok(EncryptionMode::XSalsa20Poly1305),
            other => Err(VoiceError::UnsupportedMode(other.to_owned())),
        }
    }
}

impl Ready {
    pub fn best_encryption_mode(&self) -> Result<EncryptionMode, VoiceError> {
        self.modes
            .iter()
            .map(|s| s.parse::<EncryptionMode>())
            .filter_map(Result::ok)
            .max()
            .ok_or_else(|| VoiceError::UnsupportedMode(self.modes.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_wire_shape() {
        let msg = Identify::new(IdentifyInfo {
            room_id: "room".into(),
            user_id: "user".into(),
            session_id: "sess".into(),
            token: "tok".into(),
        });
        let raw = serde_json::to_string(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["op"], 0);
        assert_eq!(value["d"]["room_id"], "room");
        assert_eq!(value["d"]["session_id"], "sess");
    }

    #[test]
    fn ready_parses() {
        let raw = r#"{"op":2,"d":{"ssrc":12345,"ip":"10.0.0.1","port":4433,"modes":["xsalsa20_poly1305"],"heartbeat_interval":5000}}"#;
        let payload: RawReceivedPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, Opcode::READY);
        let ready: Ready = serde_json::from_str(payload.d.unwrap().get()).unwrap();
        assert_eq!(ready.ssrc, 12345);
        assert_eq!(ready.heartbeat_interval, 5000);
        assert_eq!(
            ready.best_encryption_mode().unwrap(),
            EncryptionMode::XSalsa20Poly1305
        );
    }

    #[test]
    fn missing_payload_is_tolerated() {
        let raw = r#"{"op":6}"#;
        let payload: RawReceivedPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.op, Opcode::HEARTBEAT_ACK);
        assert!(payload.d.is_none());
    }

    #[test]
    fn speaking_carries_flags_and_ssrc() {
        let msg = Speaking::new(SpeakingFlags::microphone(), 777);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], 5);
        assert_eq!(value["d"]["speaking"], 1);
        assert_eq!(value["d"]["delay"], 0);
        assert_eq!(value["d"]["ssrc"], 777);
    }

    #[test]
    fn unknown_encryption_mode_is_rejected() {
        assert!("aes256_gcm".parse::<EncryptionMode>().is_err());
    }
}
