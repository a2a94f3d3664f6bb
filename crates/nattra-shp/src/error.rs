//! Hole punching errors

use nattra_core::Address;
use thiserror::Error;

/// Errors raised by the hole punching roles
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShpError {
    /// The target advertises no parent to relay through
    #[error("target {0} has no parents")]
    NoParents(Address),

    /// A relay named a node that is not a registered child
    #[error("{0} is not a registered child")]
    UnknownChild(Address),

    /// A control message came from a node that is not one of our parents
    #[error("{0} is not one of our parents")]
    NotAParent(Address),
}
