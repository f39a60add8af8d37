//! Token-passing distributed mutual exclusion.
//!
//! Peers pass a single token around on demand; only the peer holding it may
//! enter the critical section. See [`lock::DistributedLock`].

pub mod error;
pub mod local;
pub mod lock;
pub mod log;
pub mod message;
pub mod peer;
pub mod poisson;
pub mod registry;
pub mod remote;
pub mod server;
pub mod state;

pub use error::{LockError, RemoteError};
pub use lock::DistributedLock;
pub use state::{LockStatus, TokenState};

/// Default number of critical sections per second a peer asks for.
pub const RATE: f64 = 1.;
