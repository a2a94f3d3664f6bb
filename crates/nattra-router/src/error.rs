//! Router errors

use nattra_core::NodeId;
use thiserror::Error;

/// Errors raised by the connection router
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No traversal technique connects the two NAT classes
    #[error("no traversal path to {0}")]
    Unfeasible(NodeId),

    /// The connection attempt to the node failed
    #[error("connection attempt to {0} failed")]
    ConnectFailed(NodeId),

    /// The pending queue for the node is full
    #[error("pending queue for {0} is full ({1} messages)")]
    QueueFull(NodeId, usize),

    /// There is no connection to the node
    #[error("no connection to {0}")]
    NoConnection(NodeId),
}

impl RouterError {
    /// Returns true if retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::QueueFull(..))
    }
}
