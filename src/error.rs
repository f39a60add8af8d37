use crate::message::{ErrorKind, PeerId};
use thiserror::Error;

/// Failure of one remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The peer couldn't be reached; it is presumed dead.
    #[error("peer {peer} is unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },
    /// The peer answered with an error.
    #[error("peer {peer} answered with {kind}: {details}")]
    Remote {
        peer: PeerId,
        kind: ErrorKind,
        details: String,
    },
}

/// Misuse of the lock by the owning application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("release called while the token is not held (state is {0})")]
    NotHeld(&'static str),
}
