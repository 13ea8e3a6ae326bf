//! Peer frame encoding for stream transports.
//!
//! Stream sockets have no message boundaries, so each [`PeerFrame`] is
//! prefixed with its kind and length. A malformed header poisons the stream;
//! the owning channel is closed.

use super::peer::PeerFrame;
use crate::error::{Error, Result};

/// Maximum payload size (1 MiB). File chunks stay well below this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Header size: kind (1) + length (4) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Kind byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// UTF-8 JSON control message.
    Text = 0x01,
    /// Raw bytes.
    Binary = 0x02,
}

impl FrameKind {
    /// Parse frame kind from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::Binary),
            _ => Err(Error::Protocol(format!("unknown frame kind: {:#04x}", byte))),
        }
    }
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.kind as u8;
        bytes[1..5].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Protocol("header too short".into()));
        }

        let kind = FrameKind::from_byte(bytes[0])?;
        let length = u32::from_be_bytes(
            bytes[1..5]
                .try_into()
                .map_err(|_| Error::Protocol("invalid length field".into()))?,
        );

        if length as usize > MAX_FRAME_SIZE {
            return Err(Error::Protocol("frame too large".into()));
        }

        Ok(Self { kind, length })
    }
}

impl PeerFrame {
    /// Serialize with a kind/length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (kind, payload) = match self {
            PeerFrame::Text(text) => (FrameKind::Text, text.as_bytes()),
            PeerFrame::Binary(data) => (FrameKind::Binary, data.as_slice()),
        };
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol("frame too large".into()));
        }

        let header = FrameHeader {
            kind,
            length: payload.len() as u32,
        };
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        Ok(bytes)
    }
}

/// Frame reader for streaming data.
///
/// Accumulates bytes and extracts complete frames.
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create a new frame reader.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(HEADER_SIZE + 64 * 1024),
        }
    }

    /// Add received bytes to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a complete frame.
    ///
    /// Returns `Ok(None)` if more data is needed. On error the buffer is
    /// cleared and the stream should be abandoned.
    pub fn try_read(&mut self) -> Result<Option<PeerFrame>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = match FrameHeader::from_bytes(&self.buffer) {
            Ok(h) => h,
            Err(e) => {
                self.buffer.clear();
                return Err(e);
            }
        };

        let total_size = HEADER_SIZE + header.length as usize;
        if self.buffer.len() < total_size {
            return Ok(None);
        }

        let payload: Vec<u8> = self.buffer.drain(..total_size).skip(HEADER_SIZE).collect();
        let frame = match header.kind {
            FrameKind::Text => PeerFrame::Text(
                String::from_utf8(payload)
                    .map_err(|_| Error::Protocol("text frame is not utf-8".into()))?,
            ),
            FrameKind::Binary => PeerFrame::Binary(payload),
        };

        Ok(Some(frame))
    }

    /// Get current buffer size.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_streaming() {
        let frame = PeerFrame::Text(r#"{"d":"hi"}"#.into());
        let bytes = frame.encode().expect("should encode");

        let mut reader = FrameReader::new();
        for (i, &byte) in bytes.iter().enumerate() {
            reader.push(&[byte]);
            if i < bytes.len() - 1 {
                assert!(reader.try_read().expect("no error").is_none());
            }
        }

        let parsed = reader.try_read().expect("no error").expect("should have frame");
        assert_eq!(parsed, frame);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_preserves_kind_and_order() {
        let mut reader = FrameReader::new();
        reader.push(&PeerFrame::Binary(vec![0x7b, 0x22]).encode().expect("encode"));
        reader.push(&PeerFrame::Text("{}".into()).encode().expect("encode"));

        assert_eq!(
            reader.try_read().expect("no error"),
            Some(PeerFrame::Binary(vec![0x7b, 0x22]))
        );
        assert_eq!(reader.try_read().expect("no error"), Some(PeerFrame::Text("{}".into())));
        assert_eq!(reader.try_read().expect("no error"), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = FrameKind::Binary as u8;
        header[1..5].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());

        let mut reader = FrameReader::new();
        reader.push(&header);
        assert!(reader.try_read().is_err());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(FrameKind::from_byte(0x09).is_err());
    }
}
