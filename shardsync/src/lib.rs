pub mod collective;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod item;
pub mod process;
mod reduce;
pub mod replica;
pub mod shard;
pub mod signal;
pub mod sync;
pub mod topology;
pub mod types;

pub use collective::{CollectiveBackend, CollectiveChannel, DeviceBuffers, RendezvousId};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use executor::ParallelExecutor;
pub use host::{HostBackend, HostReplica, HostShard};
pub use item::CheckpointItem;
pub use process::{ProcessGroup, TcpProcessGroup};
pub use replica::{DeviceReplica, ShardedTensor};
pub use shard::{ShardPlanner, shard_range, shard_size};
pub use signal::{BlockSignal, MaskScope};
pub use sync::DistributedSynchronizer;
pub use topology::ParticipantSet;
pub use types::{BufferKind, DataType, Device, DeviceKind, Rank};
