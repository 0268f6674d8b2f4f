//! Reservation / Data frame codec
//!
//! Frames are kept minimal since every byte on air widens the collision window:
//!
//! - Reservation: `[0x01, duration_ms (u32 LE)]`
//! - Data: `[0x02, len (u8), payload[len]]`
//!
//! Decoding fails closed, anything that does not match exactly is rejected.

use core::fmt;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use strum::FromRepr;

use crate::config::MAX_PAYLOAD_LEN;

/// Encoded length of a reservation frame
pub const RESERVATION_LEN: usize = 5;

/// Data frame overhead ahead of the payload
pub const DATA_HEADER_LEN: usize = 2;

/// Largest encoded frame
pub const MAX_FRAME_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD_LEN;

/// Owned payload storage
pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// Frame kind tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameKind {
    Reservation = 0x01,
    Data = 0x02,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Announces a data frame of the provided airtime
    Reservation { duration_ms: u32 },
    /// Application payload
    Data { payload: Payload },
}

/// Frame decode errors, all of which classify the frame as unparseable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Empty buffer
    Empty,
    /// Unrecognised kind tag
    UnknownKind(u8),
    /// Length does not match the frame kind or length prefix
    InvalidLength(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::UnknownKind(k) => write!(f, "unknown frame kind 0x{:02x}", k),
            Self::InvalidLength(n) => write!(f, "invalid frame length {}", n),
        }
    }
}

impl Frame {
    pub fn reservation(duration_ms: u32) -> Self {
        Frame::Reservation { duration_ms }
    }

    /// Build a data frame, `None` if the payload exceeds the frame limit
    pub fn data(data: &[u8]) -> Option<Self> {
        Vec::from_slice(data).ok().map(|payload| Frame::Data { payload })
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Reservation { .. } => FrameKind::Reservation,
            Frame::Data { .. } => FrameKind::Data,
        }
    }

    /// Length of the encoded frame
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Reservation { .. } => RESERVATION_LEN,
            Frame::Data { payload } => DATA_HEADER_LEN + payload.len(),
        }
    }

    /// Encode into the provided buffer, returning the encoded length.
    ///
    /// Panics if `buf` is shorter than [`Frame::encoded_len`]
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.kind() as u8;

        match self {
            Frame::Reservation { duration_ms } => {
                LittleEndian::write_u32(&mut buf[1..RESERVATION_LEN], *duration_ms);
                RESERVATION_LEN
            },
            Frame::Data { payload } => {
                let n = payload.len();
                buf[1] = n as u8;
                buf[DATA_HEADER_LEN..DATA_HEADER_LEN + n].copy_from_slice(payload);
                DATA_HEADER_LEN + n
            },
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let tag = *buf.first().ok_or(DecodeError::Empty)?;

        match FrameKind::from_repr(tag) {
            Some(FrameKind::Reservation) => {
                if buf.len() != RESERVATION_LEN {
                    return Err(DecodeError::InvalidLength(buf.len()));
                }

                let duration_ms = LittleEndian::read_u32(&buf[1..RESERVATION_LEN]);

                Ok(Frame::Reservation { duration_ms })
            },
            Some(FrameKind::Data) => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(DecodeError::InvalidLength(buf.len()));
                }

                let n = buf[1] as usize;
                if n > MAX_PAYLOAD_LEN || buf.len() != DATA_HEADER_LEN + n {
                    return Err(DecodeError::InvalidLength(buf.len()));
                }

                let payload = Vec::from_slice(&buf[DATA_HEADER_LEN..])
                    .map_err(|_| DecodeError::InvalidLength(buf.len()))?;

                Ok(Frame::Data { payload })
            },
            None => Err(DecodeError::UnknownKind(tag)),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl From<Frame> for std::vec::Vec<u8> {
    fn from(f: Frame) -> Self {
        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = f.encode(&mut buff);
        buff[..n].to_vec()
    }
}
