//! The multi-process messaging layer.

pub mod tcp;

pub use tcp::TcpProcessGroup;

use crate::error::{Result, SyncError};
use crate::item::CheckpointItem;
use crate::types::Rank;

/// Blocking collective primitives across host processes.
///
/// Every method is collective: all processes call it in the same order with
/// the same root. After `broadcast` returns, every process holds the root's
/// bytes.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process.
    fn rank(&self) -> Rank;

    /// Number of processes.
    fn num_processes(&self) -> usize;

    /// Block until every process has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Broadcast a variable-length buffer from `root`. Non-root contents are
    /// replaced, including their length.
    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: Rank) -> Result<()>;

    /// Tag for log lines, identifying this process.
    fn id_string(&self) -> String;

    /// Broadcast a fixed-size buffer from `root`. Fails if the root's buffer
    /// has a different size than this process's.
    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        let mut data = buf.to_vec();
        self.broadcast_bytes(&mut data, root)?;
        if data.len() != buf.len() {
            return Err(SyncError::SizeMismatch {
                context: "broadcast",
                expected: buf.len(),
                actual: data.len(),
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Broadcast a checkpoint item (name, type tag and payload) from `root`.
    fn broadcast_item(&self, item: &mut CheckpointItem, root: Rank) -> Result<()> {
        let mut frame = if self.rank() == root {
            item.to_frame()
        } else {
            Vec::new()
        };
        self.broadcast_bytes(&mut frame, root)?;
        if self.rank() != root {
            *item = CheckpointItem::from_frame(&frame)?;
        }
        Ok(())
    }
}
