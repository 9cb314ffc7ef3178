//! Driver error types

use crate::ownership::Holder;
use parol_protocol::ProtocolError;
use thiserror::Error;

/// Driver error type
#[derive(Error, Debug)]
pub enum DriverError {
    /// No correlated reply within the query window
    #[error("Operation timeout")]
    Timeout,

    /// Only malformed replies arrived before the deadline
    #[error("Malformed response: {0}")]
    Malformed(ProtocolError),

    /// Transport reported the peer as unreachable
    #[error("Controller unreachable: {0}")]
    Unreachable(String),

    /// Request issued by a component that does not hold the link
    #[error("Command channel is owned by {holder:?}")]
    NotOwner { holder: Holder },

    /// Program ownership already claimed
    #[error("Command channel already claimed by a program")]
    AlreadyClaimed,

    /// Controller process could not be spawned
    #[error("Failed to spawn controller: {0}")]
    Spawn(String),

    /// Supervisor is stopping or stopped
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// Command could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Whether the error reflects a missing or silent peer.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Malformed(_) | Self::Unreachable(_) | Self::Io(_)
        )
    }
}
