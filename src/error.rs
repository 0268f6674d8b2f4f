//! MAC error types
//
// Copyright 2021 Ryan Kurte

use core::fmt::{self, Debug};

use crate::config::ConfigError;

/// MAC errors, generic over the underlying radio error
#[derive(Debug, Clone, PartialEq)]
pub enum MacError<E> {
    /// A payload is already pending and the send policy rejects another
    Busy,

    /// Payload exceeds the configured maximum
    PayloadTooLarge(usize),

    /// Receive buffer shorter than the queued payload
    BufferTooSmall(usize),

    /// Reservation already transmitted, the send can no longer be cancelled
    Committed,

    /// Radio failed to transmit, the pending payload is dropped
    TransmitFailed(E),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),

    /// Configuration rejected at construction
    InvalidConfig(ConfigError),
}

impl <E> From<ConfigError> for MacError<E> {
    fn from(e: ConfigError) -> Self {
        MacError::InvalidConfig(e)
    }
}

impl <E: Debug> fmt::Display for MacError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacError::Busy => write!(f, "send already pending"),
            MacError::PayloadTooLarge(n) => write!(f, "payload of {} bytes too large", n),
            MacError::BufferTooSmall(n) => write!(f, "receive buffer too small for {} byte payload", n),
            MacError::Committed => write!(f, "reservation sent, send cannot be cancelled"),
            MacError::TransmitFailed(e) => write!(f, "transmit failed: {:?}", e),
            MacError::Radio(e) => write!(f, "radio error: {:?}", e),
            MacError::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl <E: Debug> std::error::Error for MacError<E> {}
