//! Interfaces consumed from the tensor engine and the optimizer.

use std::ops::Range;

use crate::error::Result;
use crate::item::CheckpointItem;
use crate::types::{BufferKind, DataType, Device};

/// One device's copy of the model: a parameter buffer and a gradient buffer,
/// both `len()` elements of `dtype()`, laid out identically on every device.
///
/// Ranges are element ranges. Pointers are device addresses in the memory
/// space the collective backend operates on.
///
/// # Safety
/// Implementors guarantee that `buffer_ptr(kind)` stays valid for
/// `len() * dtype().size_in_bytes()` bytes, at a fixed address, for as long as
/// the replica is alive, and that `len()` and `dtype()` never change.
/// The synchronizer hands these pointers to collective calls.
pub unsafe trait DeviceReplica: Send + Sync {
    /// The device this replica lives on.
    fn device(&self) -> Device;

    /// Element type of both buffers.
    fn dtype(&self) -> DataType;

    /// Number of elements in each buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device address of the first element of `kind`.
    fn buffer_ptr(&self, kind: BufferKind) -> u64;

    /// Block until all compute work queued on this device has finished.
    fn synchronize(&self) -> Result<()>;

    /// Set `range` of `kind` to zero.
    fn fill_zero(&self, kind: BufferKind, range: Range<usize>) -> Result<()>;

    /// Copy `range` of `kind` to host memory.
    fn read(&self, kind: BufferKind, range: Range<usize>) -> Result<Vec<u8>>;

    /// Copy `bytes` from host memory into `kind`, starting at element `offset`.
    fn write(&self, kind: BufferKind, offset: usize, bytes: &[u8]) -> Result<()>;
}

/// An optimizer-owned tensor holding one device's shard of some state,
/// such as smoothed parameters.
pub trait ShardedTensor: Send + Sync {
    /// Size of the shard in bytes.
    fn size_bytes(&self) -> usize;

    /// Snapshot the shard to host memory.
    fn to_item(&self) -> Result<CheckpointItem>;

    /// Overwrite the shard from host memory; `bytes.len()` equals `size_bytes()`.
    fn set(&self, bytes: &[u8]) -> Result<()>;
}
