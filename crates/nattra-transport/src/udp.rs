//! Tokio UDP transport

use crate::config::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// UDP transport on a tokio socket configured through socket2
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl AsyncUdpTransport {
    /// Bind `addr` with default socket options
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be set up
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind `addr` with the socket options of `config`
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be set up
    pub async fn bind_with_config(
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let bind_failed = |e: std::io::Error| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        };

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(bind_failed)?;

        socket
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_failed)?;
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_failed)?;
        socket
            .set_reuse_address(config.reuse_address)
            .map_err(bind_failed)?;
        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;
        tracing::debug!("Bound UDP socket {}", addr);

        Ok(Self::from_socket(socket))
    }

    /// Wrap an already bound tokio socket
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, from)) => {
                self.counters
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((size, from))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_bind_with_config() {
        let config = TransportConfig {
            recv_buffer_size: 256 * 1024,
            ..TransportConfig::default()
        };
        let transport = AsyncUdpTransport::bind_with_config(loopback(), &config)
            .await
            .unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_udp_send_recv_and_stats() {
        let server = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let client = AsyncUdpTransport::bind(loopback()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        assert_eq!(client.send_to(b"echo", server_addr).await.unwrap(), 4);

        let mut buf = vec![0u8; 1500];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..size], b"echo");
        assert_eq!(from, client.local_addr().unwrap());

        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().bytes_received, 4);
    }

    #[tokio::test]
    async fn test_udp_closed_rejects_io() {
        let transport = AsyncUdpTransport::bind(loopback()).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport.send_to(b"x", "127.0.0.1:9".parse().unwrap()).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
