use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::process::ProcessGroup;
use crate::signal;
use crate::topology::ParticipantSet;
use crate::types::{DataType, Device, Rank};

use super::{CollectiveBackend, RendezvousId, check_precision};

/// Send and receive addresses of one local device for one collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffers {
    pub send_ptr: u64,
    pub recv_ptr: u64,
}

/// Per-device resources. Field order is drop order: stream, then communicator.
struct DeviceSlot<B: CollectiveBackend> {
    device: Device,
    stream: B::Stream,
    comm: B::Comm,
}

/// Collective communication among all local devices of all processes.
///
/// Owns one stream and one communicator per local device, created once at
/// construction from a rendezvous id generated on process rank 0, and
/// destroyed when the channel is dropped.
pub struct CollectiveChannel<B: CollectiveBackend> {
    slots: Vec<DeviceSlot<B>>,
    participants: ParticipantSet,
    process_group: Option<Arc<dyn ProcessGroup>>,
    backend: B,
}

impl<B: CollectiveBackend> CollectiveChannel<B> {
    /// Form the communication group over `devices` (this process's devices, in
    /// local-index order) and, if given, every process in `process_group`.
    ///
    /// All processes must call this collectively with the same number of devices.
    pub fn new(
        backend: B,
        devices: Vec<Device>,
        process_group: Option<Arc<dyn ProcessGroup>>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let (process_rank, num_processes) = match &process_group {
            Some(pg) => (pg.rank(), pg.num_processes()),
            None => (0, 1),
        };
        let participants = ParticipantSet::new(devices, process_rank, num_processes)?;
        for &device in &participants.devices {
            if device.kind != backend.device_kind() {
                return Err(SyncError::UnsupportedDevice {
                    device,
                    backend: backend.name(),
                    expected: backend.device_kind(),
                });
            }
        }

        let pg = process_group.as_deref();
        check_layout(&participants, pg)?;
        let tag = log_tag(pg);
        // barriers only keep the log lines of all processes together
        barrier(pg)?;
        tracing::info!(
            "{tag}[comm] using {} {} for device communication{}",
            backend.name(),
            backend.version().unwrap_or_default(),
            if participants.is_multi_process() {
                " and multi-process messaging"
            } else {
                ""
            }
        );
        barrier(pg)?;

        let streams = participants
            .devices
            .iter()
            .map(|&device| backend.create_stream(device))
            .collect::<Result<Vec<_>>>()?;

        let comms = {
            let _masked = signal::block_both(config.mask_signal);
            let id = exchange_id(&backend, &participants, pg)?;
            tracing::debug!(?id, num_ranks = participants.num_ranks(), "initializing communicators");
            in_group(&backend, || {
                participants
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(i, &device)| {
                        backend.comm_init_rank(
                            device,
                            participants.num_ranks(),
                            &id,
                            participants.global_rank(i),
                        )
                    })
                    .collect::<Result<Vec<_>>>()
            })?
        };

        let slots = participants
            .devices
            .iter()
            .zip(streams)
            .zip(comms)
            .map(|((&device, stream), comm)| DeviceSlot {
                device,
                stream,
                comm,
            })
            .collect();

        barrier(pg)?;
        tracing::info!("{tag}[comm] collective channel constructed successfully");
        barrier(pg)?;

        Ok(Self {
            slots,
            participants,
            process_group,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    pub fn process_group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        self.process_group.as_ref()
    }

    /// Total number of ranks across all processes.
    pub fn num_ranks(&self) -> usize {
        self.participants.num_ranks()
    }

    /// Number of devices in this process.
    pub fn local_count(&self) -> usize {
        self.slots.len()
    }

    /// Global rank of local device `local_index`.
    pub fn global_rank(&self, local_index: usize) -> Rank {
        self.participants.global_rank(local_index)
    }

    /// Block until every collective stream has drained.
    pub fn synchronize(&self) -> Result<()> {
        for slot in &self.slots {
            self.backend.synchronize(&slot.stream)?;
        }
        Ok(())
    }

    /// Sum-reduce across all ranks and leave each local device's shard of
    /// `recv_count` elements at its `recv_ptr`. Returns after the collective
    /// streams have drained.
    ///
    /// The caller must have synchronized the compute work producing the inputs.
    ///
    /// # Safety
    /// `buffers[i]` belongs to local device `i`: `send_ptr` valid for
    /// `recv_count * num_ranks` elements, `recv_ptr` for `recv_count` elements.
    pub unsafe fn reduce_scatter(
        &self,
        buffers: &[DeviceBuffers],
        recv_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        check_precision(dtype, "reduce_scatter")?;
        self.check_buffers(buffers)?;
        in_group(&self.backend, || {
            for (slot, buf) in self.slots.iter().zip(buffers) {
                unsafe {
                    self.backend.reduce_scatter(
                        &slot.comm,
                        &slot.stream,
                        buf.send_ptr,
                        buf.recv_ptr,
                        recv_count,
                        dtype,
                    )?;
                }
            }
            Ok(())
        })?;
        self.synchronize()
    }

    /// Gather `send_count` elements from every rank into each local device's
    /// `recv_ptr`, ordered by global rank. Returns after the collective streams
    /// have drained.
    ///
    /// # Safety
    /// `buffers[i]` belongs to local device `i`: `send_ptr` valid for
    /// `send_count` elements, `recv_ptr` for `send_count * num_ranks` elements.
    pub unsafe fn all_gather(
        &self,
        buffers: &[DeviceBuffers],
        send_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        check_precision(dtype, "all_gather")?;
        self.check_buffers(buffers)?;
        in_group(&self.backend, || {
            for (slot, buf) in self.slots.iter().zip(buffers) {
                unsafe {
                    self.backend.all_gather(
                        &slot.comm,
                        &slot.stream,
                        buf.send_ptr,
                        buf.recv_ptr,
                        send_count,
                        dtype,
                    )?;
                }
            }
            Ok(())
        })?;
        self.synchronize()
    }

    /// Broadcast a host buffer from the process owning global rank `root`.
    ///
    /// Local devices share the host buffer, so with a single process this is a
    /// no-op. Across processes the messaging layer carries the bytes.
    pub fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        if root >= self.num_ranks() {
            return Err(SyncError::ProcessLayout {
                reason: format!("broadcast root {root} out of range for {} ranks", self.num_ranks()),
            });
        }
        match &self.process_group {
            Some(pg) if self.participants.is_multi_process() => {
                pg.broadcast(buf, self.participants.process_of(root))
            }
            _ => Ok(()),
        }
    }

    fn check_buffers(&self, buffers: &[DeviceBuffers]) -> Result<()> {
        if buffers.len() != self.slots.len() {
            return Err(SyncError::ProcessLayout {
                reason: format!(
                    "got buffers for {} devices, channel drives {}",
                    buffers.len(),
                    self.slots.len()
                ),
            });
        }
        Ok(())
    }
}

impl<B: CollectiveBackend> Drop for CollectiveChannel<B> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            tracing::debug!(device = %slot.device, "destroying stream and communicator");
            drop(slot);
        }
    }
}

/// Run `f` inside a group bracket. `group_end` is issued even if `f` fails;
/// the first error is returned.
fn in_group<B: CollectiveBackend, T>(backend: &B, f: impl FnOnce() -> Result<T>) -> Result<T> {
    backend.group_start()?;
    let result = f();
    let end = backend.group_end();
    let value = result?;
    end?;
    Ok(value)
}

/// Every process announces its local device count in turn, so all of them
/// reject an uneven layout together instead of stalling in `comm_init_rank`.
fn check_layout(participants: &ParticipantSet, pg: Option<&dyn ProcessGroup>) -> Result<()> {
    let pg = match pg {
        Some(pg) if participants.is_multi_process() => pg,
        _ => return Ok(()),
    };
    let mut counts = Vec::with_capacity(participants.num_processes);
    for root in 0..participants.num_processes {
        let mut bytes = (participants.local_count() as u64).to_le_bytes().to_vec();
        pg.broadcast_bytes(&mut bytes, root)?;
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| SyncError::SizeMismatch {
            context: "device count broadcast",
            expected: 8,
            actual: bytes.len(),
        })?;
        counts.push(u64::from_le_bytes(raw));
    }
    if counts.iter().any(|&n| n != counts[0]) {
        return Err(SyncError::ProcessLayout {
            reason: format!("processes drive different numbers of devices: {counts:?}"),
        });
    }
    Ok(())
}

/// Generate the id on process rank 0 and share it with every process.
fn exchange_id<B: CollectiveBackend>(
    backend: &B,
    participants: &ParticipantSet,
    pg: Option<&dyn ProcessGroup>,
) -> Result<RendezvousId> {
    let id = if participants.is_root_process() {
        backend.unique_id()?
    } else {
        RendezvousId::zeroed()
    };
    match pg {
        Some(pg) if participants.is_multi_process() => {
            let mut bytes = id.as_bytes().to_vec();
            pg.broadcast_bytes(&mut bytes, 0)?;
            RendezvousId::from_bytes(&bytes)
        }
        _ => Ok(id),
    }
}

fn barrier(pg: Option<&dyn ProcessGroup>) -> Result<()> {
    match pg {
        Some(pg) => pg.barrier(),
        None => Ok(()),
    }
}

pub(crate) fn log_tag(pg: Option<&dyn ProcessGroup>) -> String {
    match pg {
        Some(pg) if pg.num_processes() > 1 => format!("[{}] ", pg.id_string()),
        _ => String::new(),
    }
}
