use thiserror::Error;

use super::commands::MAGIC;

/// Bytes before the payload: magic(3) + command + kind + length.
pub const HEADER_LEN: usize = MAGIC.len() + 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid magic: {0:02x?}")]
    BadMagic([u8; 3]),

    #[error("Length byte says {declared} but {actual} payload bytes follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload of {0} bytes does not fit a frame")]
    PayloadTooLong(usize),
}

/// A QXW protocol frame.
///
/// Wire format:
/// ```text
/// ["Q" "X" "W"] [command] [kind] [length] [payload: `length` bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub kind: u8,
    pub(super) payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting payloads the single length byte can't describe.
    pub fn new(command: u8, kind: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > u8::MAX as usize {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            command,
            kind,
            payload,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Value of the length byte; always equals the payload size.
    pub fn length(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Serialize this frame to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(HEADER_LEN + self.payload.len());
        result.extend_from_slice(&MAGIC);
        result.push(self.command);
        result.push(self.kind);
        result.push(self.length());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Strict parse: magic, header and an exact length match are required.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        if data[..3] != MAGIC {
            return Err(FrameError::BadMagic([data[0], data[1], data[2]]));
        }

        let declared = data[5] as usize;
        let actual = data.len() - HEADER_LEN;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        Self::new(data[3], data[4], data[HEADER_LEN..].to_vec())
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cmd={:02X} kind={:02X} len={} payload={}",
            self.command,
            self.kind,
            self.length(),
            super::hex(self.payload())
        )
    }
}
