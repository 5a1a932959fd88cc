//! Collective backend and replicas in host memory.
//!
//! Runs the full synchronization protocol without accelerators. All ranks of
//! a group must share one OS process.

mod backend;
mod replica;
mod stream;

pub use backend::{HostBackend, HostComm};
pub use replica::{HostReplica, HostShard};
pub use stream::HostStream;
