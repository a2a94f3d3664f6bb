//! Transport abstraction
//!
//! A [`Transport`] moves raw datagrams for one local socket. The event loop
//! owns one transport per local address of the component it drives.

use async_trait::async_trait;
use nattra_core::CodecError;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Binding a local address failed
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed {
        /// Address being bound
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },

    /// No socket is bound for a datagram source address
    #[error("No socket bound for {0}")]
    NoSocket(SocketAddr),

    /// Datagram could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Datagram transport bound to one local address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `buf` to `addr`, returning the number of bytes sent
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed or the send fails
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`
    ///
    /// # Errors
    /// Returns `TransportError` if the transport is closed or the receive fails
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Bound local address
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop sending and receiving
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// True once closed
    fn is_closed(&self) -> bool;

    /// Traffic counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Failed receives
    pub recv_errors: u64,
}
