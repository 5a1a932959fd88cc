use crate::types::{DataType, Device, DeviceKind};

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no local devices given to the synchronizer")]
    NoDevices,

    #[error("the {backend} communicator can only be used with {expected} devices, got {device}")]
    UnsupportedDevice {
        device: Device,
        backend: &'static str,
        expected: DeviceKind,
    },

    #[error("presently, all shards must have the same size: {total} elements over {num_shards} shards")]
    UnevenShards { total: usize, num_shards: usize },

    #[error("rendezvous id has {actual} bytes, expected {expected}")]
    RendezvousIdSize { expected: usize, actual: usize },

    #[error("unsupported precision {dtype} for {operation}")]
    UnsupportedPrecision {
        dtype: DataType,
        operation: &'static str,
    },

    #[error("replica {index} on {device}: {reason}")]
    ReplicaMismatch {
        index: usize,
        device: Device,
        reason: String,
    },

    #[error("process layout error: {reason}")]
    ProcessLayout { reason: String },

    #[error("{call} failed: {reason}")]
    Collective { call: &'static str, reason: String },

    #[error("messaging error: {message}")]
    Messaging {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("size mismatch in {context}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("checkpoint item mismatch: {reason}")]
    ItemMismatch { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl SyncError {
    /// Create a `Collective` error for a failing backend call.
    pub fn collective(call: &'static str, reason: impl Into<String>) -> Self {
        Self::Collective {
            call,
            reason: reason.into(),
        }
    }

    /// Create a `Messaging` error with just a message.
    pub fn messaging(msg: impl Into<String>) -> Self {
        Self::Messaging {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Messaging` error with a message and a source error.
    pub fn messaging_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Messaging {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for errors caused by how the synchronizer was set up rather than
    /// by a failure while running.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::NoDevices
                | SyncError::UnsupportedDevice { .. }
                | SyncError::UnevenShards { .. }
                | SyncError::RendezvousIdSize { .. }
                | SyncError::UnsupportedPrecision { .. }
                | SyncError::ReplicaMismatch { .. }
                | SyncError::ProcessLayout { .. }
        )
    }
}
