//! Error types shared by the NATTRA crates

use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Decoding failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Encoded datagram exceeds the configured maximum
    #[error("Datagram too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Port allocation errors of the NAT emulator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Port preservation requested a port that is already mapped
    #[error("Port {0} already allocated")]
    PortTaken(u16),

    /// Every port of the range is mapped
    #[error("Out of ports in range {min}..={max}")]
    OutOfPorts {
        /// Range start
        min: u16,
        /// Range end
        max: u16,
    },
}
