//! Per-step synchronization of sharded gradients, parameters and optimizer state.

use std::ops::Range;
use std::sync::Arc;

use crate::collective::{CollectiveBackend, CollectiveChannel, DeviceBuffers, check_precision};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::executor::ParallelExecutor;
use crate::item::CheckpointItem;
use crate::process::ProcessGroup;
use crate::replica::{DeviceReplica, ShardedTensor};
use crate::shard::ShardPlanner;
use crate::types::{BufferKind, DataType, Rank};

/// Keeps model replicas on all devices of all processes consistent.
///
/// Every global rank owns one equal-sized shard of the aggregate gradient and
/// parameter buffers. After [`scatter_reduce_and_reset_grads`] a device's
/// gradient buffer holds the global sum over its own shard and zeros
/// elsewhere; the optimizer updates that shard of the parameters, and
/// [`all_gather_params`] redistributes the result to every device.
///
/// All operations are collective: every process must call them in the same
/// order.
///
/// [`scatter_reduce_and_reset_grads`]: Self::scatter_reduce_and_reset_grads
/// [`all_gather_params`]: Self::all_gather_params
pub struct DistributedSynchronizer<B: CollectiveBackend> {
    executor: ParallelExecutor,
    channel: CollectiveChannel<B>,
    replicas: Vec<Arc<dyn DeviceReplica>>,
    dtype: DataType,
    len: usize,
    shard_size: usize,
}

impl<B: CollectiveBackend> DistributedSynchronizer<B> {
    /// Set up collective communication for `replicas`, this process's model
    /// copies in local-device order.
    ///
    /// Fails with a configuration error if replicas disagree in size or element
    /// type, if the buffer size does not divide evenly over all global ranks, or
    /// if a device is not of the kind `backend` drives.
    pub fn new(
        backend: B,
        replicas: Vec<Arc<dyn DeviceReplica>>,
        process_group: Option<Arc<dyn ProcessGroup>>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let first = replicas.first().ok_or(SyncError::NoDevices)?;
        let (dtype, len) = (first.dtype(), first.len());
        for (index, replica) in replicas.iter().enumerate().skip(1) {
            if replica.dtype() != dtype || replica.len() != len {
                return Err(SyncError::ReplicaMismatch {
                    index,
                    device: replica.device(),
                    reason: format!(
                        "{} x {} elements, device 0 has {} x {}",
                        replica.len(),
                        replica.dtype(),
                        len,
                        dtype
                    ),
                });
            }
        }
        check_precision(dtype, "DistributedSynchronizer::new")?;

        let num_processes = process_group.as_ref().map_or(1, |pg| pg.num_processes());
        let planner = ShardPlanner::new(len, replicas.len() * num_processes)?;
        let shard_size = planner.shard_size()?;

        let devices = replicas.iter().map(|r| r.device()).collect();
        let channel = CollectiveChannel::new(backend, devices, process_group, config)?;
        let ranges = (0..replicas.len())
            .map(|i| planner.range(channel.global_rank(i)))
            .collect();
        let executor = ParallelExecutor::new(ranges, config)?;

        tracing::debug!(
            len,
            %dtype,
            num_ranks = channel.num_ranks(),
            shard_size,
            "synchronizer ready"
        );

        Ok(Self {
            executor,
            channel,
            replicas,
            dtype,
            len,
            shard_size,
        })
    }

    /// Sum gradients over all ranks, leaving each device with the reduced
    /// values of its own shard and zeros everywhere else in its gradient buffer.
    pub fn scatter_reduce_and_reset_grads(&self) -> Result<()> {
        self.synchronize_replicas()?;

        let elem = self.dtype.size_in_bytes() as u64;
        let buffers: Vec<DeviceBuffers> = self
            .replicas
            .iter()
            .enumerate()
            .map(|(i, replica)| {
                let base = replica.buffer_ptr(BufferKind::Grads);
                DeviceBuffers {
                    send_ptr: base,
                    recv_ptr: base + self.executor.shard_range(i).start as u64 * elem,
                }
            })
            .collect();
        // SAFETY: each gradient buffer holds shard_size * num_ranks elements and
        // the receive slice lies inside it at this device's shard offset.
        unsafe {
            self.channel
                .reduce_scatter(&buffers, self.shard_size, self.dtype)?;
        }

        let len = self.len;
        self.executor.run_all_and(
            |i, shard| {
                let replica = &self.replicas[i];
                if shard.start > 0 {
                    replica.fill_zero(BufferKind::Grads, 0..shard.start)?;
                }
                if shard.end < len {
                    replica.fill_zero(BufferKind::Grads, shard.end..len)?;
                }
                Ok(true)
            },
            true,
        )?;
        tracing::trace!(shard_size = self.shard_size, "gradients reduced and reset");
        Ok(())
    }

    /// Distribute every device's parameter shard to all devices, so every
    /// replica ends up with the same full parameter vector.
    pub fn all_gather_params(&self) -> Result<()> {
        self.synchronize_replicas()?;

        let elem = self.dtype.size_in_bytes() as u64;
        let buffers: Vec<DeviceBuffers> = self
            .replicas
            .iter()
            .enumerate()
            .map(|(i, replica)| {
                let base = replica.buffer_ptr(BufferKind::Params);
                DeviceBuffers {
                    send_ptr: base + self.executor.shard_range(i).start as u64 * elem,
                    recv_ptr: base,
                }
            })
            .collect();
        // SAFETY: as in scatter_reduce_and_reset_grads, with send and receive
        // roles exchanged.
        unsafe {
            self.channel
                .all_gather(&buffers, self.shard_size, self.dtype)?;
        }
        tracing::trace!(shard_size = self.shard_size, "parameters gathered");
        Ok(())
    }

    /// Hand each local device its slice of `item`, which every process holds
    /// identically. Purely local.
    ///
    /// Slices are whole elements of the item's type, `ceil(elements / num_ranks)`
    /// per rank with the tail clipped; trailing ranks may receive empty slices.
    pub fn scatter_state<F>(&self, item: &CheckpointItem, mut set: F) -> Result<()>
    where
        F: FnMut(usize, &[u8]) -> Result<()>,
    {
        let elem = item.dtype.size_in_bytes();
        if item.len() % elem != 0 {
            return Err(SyncError::ItemMismatch {
                reason: format!(
                    "item '{}' holds {} bytes, not a whole number of {} elements",
                    item.name,
                    item.len(),
                    item.dtype
                ),
            });
        }
        let planner = ShardPlanner::new(item.num_elements(), self.num_ranks())?;
        for i in 0..self.local_count() {
            let range = planner.range(self.channel.global_rank(i));
            set(i, &item.bytes[range.start * elem..range.end * elem])?;
        }
        Ok(())
    }

    /// Collect every device's piece of some sharded state into one item that
    /// is identical on every process, ordered by global rank.
    pub fn gather_state<F>(&self, mut get: F) -> Result<CheckpointItem>
    where
        F: FnMut(usize) -> Result<CheckpointItem>,
    {
        let mut local = get(0)?;
        for i in 1..self.local_count() {
            local.append(&get(i)?)?;
        }

        let pg = match self.channel.process_group() {
            Some(pg) if self.channel.participants().is_multi_process() => pg,
            _ => return Ok(local),
        };

        let me = pg.rank();
        let mut gathered = CheckpointItem::new(local.name.clone(), local.dtype, Vec::new());
        for root in 0..pg.num_processes() {
            let mut part = if root == me {
                local.clone()
            } else {
                CheckpointItem::new(String::new(), local.dtype, Vec::new())
            };
            pg.broadcast_item(&mut part, root)?;
            gathered.append(&part)?;
        }
        tracing::debug!(
            name = %gathered.name,
            bytes = gathered.len(),
            "gathered state from {} processes",
            pg.num_processes()
        );
        Ok(gathered)
    }

    /// Exchange the live parameters with a sharded snapshot such as smoothed
    /// parameters: afterwards every replica holds the former snapshot and
    /// `shards` hold the former parameters.
    ///
    /// `shards[i]` belongs to local device `i` and must be that device's shard
    /// size. Assumes all replicas hold identical parameters, as they do after
    /// [`all_gather_params`](Self::all_gather_params).
    pub fn swap_params(&self, shards: &[Arc<dyn ShardedTensor>]) -> Result<()> {
        if shards.len() != self.local_count() {
            return Err(SyncError::SizeMismatch {
                context: "swap_params shard count",
                expected: self.local_count(),
                actual: shards.len(),
            });
        }
        let shard_bytes = self.shard_size * self.dtype.size_in_bytes();
        for shard in shards {
            if shard.size_bytes() != shard_bytes {
                return Err(SyncError::SizeMismatch {
                    context: "swap_params shard size",
                    expected: shard_bytes,
                    actual: shard.size_bytes(),
                });
            }
        }
        self.synchronize_replicas()?;

        let snapshot = self.gather_state(|i| shards[i].to_item())?;
        if snapshot.dtype != self.dtype {
            return Err(SyncError::ItemMismatch {
                reason: format!(
                    "snapshot '{}' is {}, parameters are {}",
                    snapshot.name, snapshot.dtype, self.dtype
                ),
            });
        }
        let live = CheckpointItem::new(
            "params",
            self.dtype,
            self.replicas[0].read(BufferKind::Params, 0..self.len)?,
        );
        if snapshot.len() != live.len() {
            return Err(SyncError::SizeMismatch {
                context: "swap_params gathered snapshot",
                expected: live.len(),
                actual: snapshot.len(),
            });
        }

        self.scatter_state(&live, |i, bytes| shards[i].set(bytes))?;
        self.executor.run_all_and(
            |i, _| {
                self.replicas[i].write(BufferKind::Params, 0, &snapshot.bytes)?;
                Ok(true)
            },
            true,
        )?;
        tracing::debug!(bytes = live.len(), "swapped parameters with sharded snapshot");
        Ok(())
    }

    /// Run `func(device_index, shard_range)` for every local device and fold
    /// the results with `acc`. See [`ParallelExecutor::run_all`].
    pub fn run_all<T, F, A>(&self, func: F, acc: A, init: T, parallel: bool) -> Result<T>
    where
        T: Send,
        F: Fn(usize, Range<usize>) -> Result<T> + Sync,
        A: FnMut(T, T) -> T,
    {
        self.executor.run_all(func, acc, init, parallel)
    }

    /// [`run_all`](Self::run_all) with logical AND.
    pub fn run_all_and<F>(&self, func: F, parallel: bool) -> Result<bool>
    where
        F: Fn(usize, Range<usize>) -> Result<bool> + Sync,
    {
        self.executor.run_all_and(func, parallel)
    }

    pub fn replicas(&self) -> &[Arc<dyn DeviceReplica>] {
        &self.replicas
    }

    pub fn channel(&self) -> &CollectiveChannel<B> {
        &self.channel
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Number of elements in each aggregate buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements per shard.
    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    pub fn num_ranks(&self) -> usize {
        self.channel.num_ranks()
    }

    pub fn local_count(&self) -> usize {
        self.replicas.len()
    }

    /// Global rank of local device `index`.
    pub fn global_rank(&self, index: usize) -> Rank {
        self.channel.global_rank(index)
    }

    /// Element range of the aggregate buffers owned by local device `index`.
    pub fn local_shard_range(&self, index: usize) -> Range<usize> {
        self.executor.shard_range(index)
    }

    fn synchronize_replicas(&self) -> Result<()> {
        self.executor.run_all_and(
            |i, _| {
                self.replicas[i].synchronize()?;
                Ok(true)
            },
            true,
        )?;
        Ok(())
    }
}
