//! Datagram wire codec
//!
//! IP and port come from the socket, so only the node ids and the payload are
//! encoded. The codec is built once at startup and shared by reference.

use crate::address::{Address, NodeId};
use crate::error::CodecError;
use crate::message::{Datagram, Payload};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    src: NodeId,
    dst: NodeId,
    payload: &'a Payload,
}

#[derive(Deserialize)]
struct Envelope {
    src: NodeId,
    dst: NodeId,
    payload: Payload,
}

/// Encodes datagrams to bytes and back
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_datagram_size: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

impl WireCodec {
    /// Create a codec rejecting datagrams above `max_datagram_size`
    #[must_use]
    pub fn new(max_datagram_size: usize) -> Self {
        Self { max_datagram_size }
    }

    /// Configured maximum datagram size
    #[must_use]
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// Encode a datagram
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if serialization fails or the result is too large.
    pub fn encode(&self, datagram: &Datagram) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef {
            src: datagram.src.id,
            dst: datagram.dst.id,
            payload: &datagram.payload,
        };
        let bytes =
            bincode::serialize(&envelope).map_err(|e| CodecError::Serialization(e.to_string()))?;

        if bytes.len() > self.max_datagram_size {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: self.max_datagram_size,
            });
        }

        Ok(bytes)
    }

    /// Decode bytes received on `local` from `from`
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the bytes are not a valid envelope.
    pub fn decode(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        local: SocketAddr,
    ) -> Result<Datagram, CodecError> {
        if bytes.len() > self.max_datagram_size {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: self.max_datagram_size,
            });
        }

        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))?;

        Ok(Datagram {
            src: Address::new(from, envelope.src),
            dst: Address::new(local, envelope.dst),
            payload: envelope.payload,
        })
    }
}
