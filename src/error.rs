//! Crate-level error type
//!
//! Policy-level registry failures have their own small error type
//! ([`crate::registry::RegistryError`]) because they map to typed wire
//! replies rather than connection teardown; everything else funnels here.

use thiserror::Error;

use crate::registry::RegistryError;

/// Error type for hub operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("datagram too short: {len} bytes (need {need})")]
    DatagramTooShort { len: usize, need: usize },

    #[error("datagram payload length mismatch: declared {declared}, got {got}")]
    DatagramLengthMismatch { declared: usize, got: usize },

    #[error("read timed out mid-frame")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("registry unavailable")]
    RegistryGone,

    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
