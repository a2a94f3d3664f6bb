//! Transport configuration

use nattra_core::codec::MAX_DATAGRAM_SIZE;

/// Socket and event loop configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Kernel receive buffer size per socket
    pub recv_buffer_size: usize,

    /// Kernel send buffer size per socket
    pub send_buffer_size: usize,

    /// Allow rebinding an address still in `TIME_WAIT`
    pub reuse_address: bool,

    /// Largest datagram accepted or produced
    pub max_datagram_size: usize,

    /// Inbound datagrams buffered between the sockets and the event loop
    pub inbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1024 * 1024, // 1 MB
            send_buffer_size: 1024 * 1024, // 1 MB
            reuse_address: false,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            inbound_queue: 1024,
        }
    }
}

impl TransportConfig {
    /// Check the configuration for unusable values
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(format!(
                "max_datagram_size must be in 1..={MAX_DATAGRAM_SIZE}, got {}",
                self.max_datagram_size
            ));
        }
        if self.inbound_queue == 0 {
            return Err("inbound_queue must be at least 1".to_string());
        }
        Ok(())
    }
}
