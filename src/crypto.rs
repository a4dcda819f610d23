use xsalsa20poly1305::aead::{generic_array::GenericArray, Aead, NewAead};
use xsalsa20poly1305::XSalsa20Poly1305;

use crate::error::VoiceError;
use crate::payloads::EncryptionMode;

pub const RTP_HEADER_LEN: usize = 12;
pub const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag appended to every sealed payload.
pub const TAG_LEN: usize = 16;

const RTP_VERSION: u8 = 0x80;
const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// The 12-byte framing header carried in the clear in front of every
/// sealed payload. The header doubles as the AEAD nonce prefix, so any
/// tampering with sequence, timestamp or SSRC fails authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    pub fn parse(wire: &[u8]) -> Result<Self, VoiceError> {
        if wire.len() < RTP_HEADER_LEN + TAG_LEN {
            return Err(VoiceError::MalformedPacket);
        }
        if wire[0] != RTP_VERSION || wire[1] != RTP_PAYLOAD_TYPE {
            return Err(VoiceError::MalformedPacket);
        }
        Ok(Self {
            sequence: u16::from_be_bytes([wire[2], wire[3]]),
            timestamp: u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]),
            ssrc: u32::from_be_bytes([wire[8], wire[9], wire[10], wire[11]]),
        })
    }
}

/// Nonce derivation: header bytes first, the remaining 12 bytes zero.
fn nonce_from_header(header: &[u8; RTP_HEADER_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0..RTP_HEADER_LEN].copy_from_slice(header);
    nonce
}

/// Wrap-aware signed distance between two sequence numbers:
/// `((a - b + 32768) mod 65536) - 32768`.
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// The shared symmetric key for one session, created from SessionDescribe
/// and replaced wholesale whenever a new one arrives (including after a
/// reconnect). No sealed frame can exist without an instance of this.
pub struct SessionKeys {
    pub mode: EncryptionMode,
    cipher: XSalsa20Poly1305,
}

impl SessionKeys {
    pub fn new(mode: &str, secret_key_b64: &str) -> Result<Self, VoiceError> {
        let mode = mode.parse::<EncryptionMode>()?;
        let raw = base64::decode(secret_key_b64).map_err(|_| VoiceError::BadSecretKey)?;
        if raw.len() != 32 {
            return Err(VoiceError::BadSecretKey);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        Ok(Self::from_raw(mode, &key))
    }

    pub fn from_raw(mode: EncryptionMode, secret_key: &[u8; 32]) -> Self {
        let key = GenericArray::clone_from_slice(secret_key);
        Self {
            mode,
            cipher: XSalsa20Poly1305::new(&key),
        }
    }

    /// Serializes the header and seals the payload behind it. The result
    /// is the complete wire frame: clear header followed by ciphertext
    /// and tag.
    pub fn seal(&self, header: &RtpHeader, plaintext: &[u8]) -> Result<Vec<u8>, VoiceError> {
        let header_bytes = header.to_bytes();
        let nonce = nonce_from_header(&header_bytes);
        let sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| VoiceError::AuthFailed)?;
        let mut wire = Vec::with_capacity(RTP_HEADER_LEN + sealed.len());
        wire.extend_from_slice(&header_bytes);
        wire.extend_from_slice(&sealed);
        Ok(wire)
    }

    /// Parses the clear header and opens the payload. Any bit flipped in
    /// header or ciphertext yields `AuthFailed`.
    pub fn open(&self, wire: &[u8]) -> Result<(RtpHeader, Vec<u8>), VoiceError> {
        let header = RtpHeader::parse(wire)?;
        let mut header_bytes = [0u8; RTP_HEADER_LEN];
        header_bytes.copy_from_slice(&wire[..RTP_HEADER_LEN]);
        let nonce = nonce_from_header(&header_bytes);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(&nonce), &wire[RTP_HEADER_LEN..])
            .map_err(|_| VoiceError::AuthFailed)?;
        Ok((header, plaintext))
    }
}
