//! STUN classification errors

use crate::session::Phase;
use nattra_core::EchoKind;
use thiserror::Error;

/// Terminal failure of a classification run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    /// An address measurement probe went unanswered
    #[error("mapping allocation timeout at probe {0}")]
    MappingAllocationTimeout(u8),

    /// A server answered with `Echo.Reset`
    #[error("server reset {kind} echo during {phase}")]
    ServerReset {
        /// Phase the run was in
        phase: Phase,
        /// Echo the server refused
        kind: EchoKind,
    },

    /// A response carried no observed address
    #[error("echo response without observed address during {0}")]
    MissingObservedAddress(Phase),
}
