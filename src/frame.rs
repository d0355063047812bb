use std::collections::TryReserveError;

use thiserror::Error;

/// Byte used to fill data chunks. Content is never checked.
pub const FILLER: u8 = 0xAA;

/// Smallest chunk size that can never be mistaken for a control byte.
pub const MIN_CHUNK_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMessage {
    HandshakeRequest = 0x01,
    HandshakeAck = 0x02,
    Stop = 0x03,
    Continue = 0x04,
    Finish = 0x05,
}

impl ControlMessage {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ControlMessage::HandshakeRequest),
            0x02 => Some(ControlMessage::HandshakeAck),
            0x03 => Some(ControlMessage::Stop),
            0x04 => Some(ControlMessage::Continue),
            0x05 => Some(ControlMessage::Finish),
            _ => None,
        }
    }

    pub fn encode(self) -> [u8; 1] {
        [self as u8]
    }
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Data,
    Unknown,
}

/// Decode a frame by its length (and, for single bytes, the tag).
pub fn classify(bytes: &[u8], chunk_size: usize) -> Inbound {
    match bytes.len() {
        1 => ControlMessage::from_byte(bytes[0])
            .map(Inbound::Control)
            .unwrap_or(Inbound::Unknown),
        n if n == chunk_size => Inbound::Data,
        _ => Inbound::Unknown,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("chunk size {0} is below the minimum of {MIN_CHUNK_SIZE}")]
    ChunkTooSmall(usize),
    #[error("chunk size {size} exceeds link mtu {mtu}")]
    ChunkTooLarge { size: usize, mtu: usize },
}

pub fn check_chunk_size(size: usize, mtu: usize) -> Result<usize, FrameError> {
    if size < MIN_CHUNK_SIZE {
        return Err(FrameError::ChunkTooSmall(size));
    }
    if size > mtu {
        return Err(FrameError::ChunkTooLarge { size, mtu });
    }
    Ok(size)
}

/// A chunk of `size` filler bytes. Fails instead of aborting when the
/// allocation cannot be satisfied.
pub fn build_chunk(size: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut chunk = Vec::new();
    chunk.try_reserve_exact(size)?;
    chunk.resize(size, FILLER);
    Ok(chunk)
}

/// Wrapping byte sum used by the serial bridge framing.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bytes_classify_as_control() {
        for msg in [
            ControlMessage::HandshakeRequest,
            ControlMessage::HandshakeAck,
            ControlMessage::Stop,
            ControlMessage::Continue,
            ControlMessage::Finish,
        ] {
            assert_eq!(classify(&msg.encode(), 1024), Inbound::Control(msg));
        }
    }

    #[test]
    fn chunk_length_is_data_regardless_of_content() {
        let mut chunk = build_chunk(128).unwrap();
        assert_eq!(classify(&chunk, 128), Inbound::Data);
        chunk[0] = 0x03;
        assert_eq!(classify(&chunk, 128), Inbound::Data);
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(classify(&[], 1024), Inbound::Unknown);
        assert_eq!(classify(&[0x09], 1024), Inbound::Unknown);
        assert_eq!(classify(&[0x01, 0x02], 1024), Inbound::Unknown);
        assert_eq!(classify(&build_chunk(1023).unwrap(), 1024), Inbound::Unknown);
        assert_eq!(classify(&build_chunk(1024).unwrap(), 128), Inbound::Unknown);
    }

    #[test]
    fn chunk_size_bounds() {
        assert_eq!(check_chunk_size(1, 250), Err(FrameError::ChunkTooSmall(1)));
        assert_eq!(
            check_chunk_size(1024, 250),
            Err(FrameError::ChunkTooLarge {
                size: 1024,
                mtu: 250
            })
        );
        assert_eq!(check_chunk_size(250, 250), Ok(250));
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0);
    }
}
