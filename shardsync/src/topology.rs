use crate::error::{Result, SyncError};
use crate::types::{Device, Rank};

/// The fixed set of participants from this process's perspective.
///
/// Every process drives the same number of local devices, so global ranks are
/// laid out process-major: `process_rank * devices_per_process + local_index`.
#[derive(Debug, Clone)]
pub struct ParticipantSet {
    /// Devices driven by this process, in local-index order.
    pub devices: Vec<Device>,
    /// Rank of this process in the messaging layer.
    pub process_rank: Rank,
    /// Number of processes taking part.
    pub num_processes: usize,
}

impl ParticipantSet {
    pub fn new(devices: Vec<Device>, process_rank: Rank, num_processes: usize) -> Result<Self> {
        if devices.is_empty() {
            return Err(SyncError::NoDevices);
        }
        if num_processes == 0 || process_rank >= num_processes {
            return Err(SyncError::ProcessLayout {
                reason: format!("process rank {process_rank} out of range for {num_processes} processes"),
            });
        }
        Ok(Self {
            devices,
            process_rank,
            num_processes,
        })
    }

    /// A single-process set over `devices`.
    pub fn local(devices: Vec<Device>) -> Result<Self> {
        Self::new(devices, 0, 1)
    }

    /// Number of devices in this process.
    pub fn local_count(&self) -> usize {
        self.devices.len()
    }

    /// Total number of participants across all processes.
    pub fn num_ranks(&self) -> usize {
        self.num_processes * self.devices.len()
    }

    /// Global rank of the local device at `local_index`.
    pub fn global_rank(&self, local_index: usize) -> Rank {
        self.process_rank * self.devices.len() + local_index
    }

    /// Process owning `global_rank`.
    pub fn process_of(&self, global_rank: Rank) -> Rank {
        global_rank / self.devices.len()
    }

    /// True for the participant that generates the rendezvous id.
    pub fn is_root_process(&self) -> bool {
        self.process_rank == 0
    }

    /// True when more than one process takes part.
    pub fn is_multi_process(&self) -> bool {
        self.num_processes > 1
    }
}
