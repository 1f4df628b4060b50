//! Peer identity: 16-byte random ID, stable for the lifetime of a session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Peer ID. Random (UUID v4 bytes); unique per device for the session lifetime.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Generate a fresh random peer ID.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse the 32-char hex form produced by `Display`.
    pub fn parse_hex(s: &str) -> Result<Self, ParsePeerIdError> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(ParsePeerIdError::Length(s.len()));
        }
        if !s.is_ascii() {
            return Err(ParsePeerIdError::Digit);
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParsePeerIdError::Digit)?;
        }
        Ok(PeerId(out))
    }

    /// First 4 bytes in hex; enough to tell peers apart in logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParsePeerIdError {
    #[error("expected 32 hex chars, got {0}")]
    Length(usize),
    #[error("invalid hex digit")]
    Digit,
}
