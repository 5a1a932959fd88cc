use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use rand::RngCore;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::collective::{CollectiveBackend, RENDEZVOUS_ID_BYTES, RendezvousId};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::reduce::sum_into;
use crate::types::{DataType, Device, DeviceKind};

use super::stream::HostStream;

/// Groups formed in this OS process, keyed by rendezvous id. Entries die with
/// the last communicator of their group.
static REGISTRY: LazyLock<Mutex<HashMap<RendezvousId, Weak<HostGroup>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Collective backend over host memory.
///
/// Every rank of a group must live in the same OS process: ranks meet through
/// a process-wide registry keyed by the rendezvous id. Several synchronizers
/// in one process, each with its own messaging endpoint, can still form one
/// group, which is how multi-process configurations are exercised on one host.
#[derive(Debug, Clone)]
pub struct HostBackend {
    thread_prefix: String,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::from_config(&SyncConfig::default())
    }

    /// Stream threads are named after `config.thread_name_prefix`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::with_thread_prefix(config.thread_name_prefix.clone())
    }

    pub fn with_thread_prefix(prefix: impl Into<String>) -> Self {
        Self {
            thread_prefix: prefix.into(),
        }
    }

    pub fn thread_prefix(&self) -> &str {
        &self.thread_prefix
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One rank's ends of the all-to-all links of a group: a sender to every
/// rank and a receiver from every rank, indexed by peer.
struct RankLinks {
    to: Vec<UnboundedSender<Vec<u8>>>,
    from: Mutex<Vec<UnboundedReceiver<Vec<u8>>>>,
}

impl RankLinks {
    /// Send `part(peer)` to every peer, then collect one message from each
    /// peer in rank order. Links are point-to-point FIFOs, so consecutive
    /// exchanges cannot interleave.
    fn exchange(&self, part: impl Fn(usize) -> Vec<u8>) -> Result<Vec<Vec<u8>>> {
        for (peer, tx) in self.to.iter().enumerate() {
            tx.send(part(peer)).map_err(|_| {
                SyncError::collective("host exchange", format!("rank {peer} left the group"))
            })?;
        }
        let mut from = self
            .from
            .lock()
            .map_err(|_| SyncError::LockPoisoned("host rank links"))?;
        from.iter_mut()
            .enumerate()
            .map(|(peer, rx)| {
                rx.blocking_recv().ok_or_else(|| {
                    SyncError::collective("host exchange", format!("rank {peer} left the group"))
                })
            })
            .collect()
    }
}

/// Shared state of one communication group: the links not yet claimed by a
/// joining rank.
struct HostGroup {
    num_ranks: usize,
    unclaimed: Mutex<Vec<Option<RankLinks>>>,
}

impl HostGroup {
    fn new(num_ranks: usize) -> Self {
        let mut to: Vec<Vec<UnboundedSender<Vec<u8>>>> = (0..num_ranks).map(|_| Vec::new()).collect();
        let mut from: Vec<Vec<UnboundedReceiver<Vec<u8>>>> =
            (0..num_ranks).map(|_| Vec::new()).collect();
        // link (src, dst) carries src's messages to dst
        for src_to in to.iter_mut() {
            for dst_from in from.iter_mut() {
                let (tx, rx) = unbounded_channel();
                src_to.push(tx);
                dst_from.push(rx);
            }
        }
        let unclaimed = to
            .into_iter()
            .zip(from)
            .map(|(to, from)| {
                Some(RankLinks {
                    to,
                    from: Mutex::new(from),
                })
            })
            .collect();
        Self {
            num_ranks,
            unclaimed: Mutex::new(unclaimed),
        }
    }

    fn claim(&self, rank: usize) -> Result<RankLinks> {
        let mut unclaimed = self
            .unclaimed
            .lock()
            .map_err(|_| SyncError::LockPoisoned("host group"))?;
        unclaimed[rank].take().ok_or_else(|| {
            SyncError::collective("hostCommInitRank", format!("rank {rank} joined twice"))
        })
    }
}

/// One rank's membership in a [`HostGroup`].
pub struct HostComm {
    group: Arc<HostGroup>,
    links: Arc<RankLinks>,
    rank: usize,
}

impl HostComm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.group.num_ranks
    }
}

impl CollectiveBackend for HostBackend {
    type Stream = HostStream;
    type Comm = HostComm;

    fn name(&self) -> &'static str {
        "host"
    }

    fn version(&self) -> Option<String> {
        Some(env!("CARGO_PKG_VERSION").to_string())
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn unique_id(&self) -> Result<RendezvousId> {
        let mut bytes = [0u8; RENDEZVOUS_ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Ok(RendezvousId::new(bytes))
    }

    fn create_stream(&self, device: Device) -> Result<HostStream> {
        HostStream::new(device, &self.thread_prefix)
    }

    fn group_start(&self) -> Result<()> {
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        Ok(())
    }

    fn comm_init_rank(
        &self,
        _device: Device,
        num_ranks: usize,
        id: &RendezvousId,
        rank: usize,
    ) -> Result<HostComm> {
        if rank >= num_ranks {
            return Err(SyncError::collective(
                "hostCommInitRank",
                format!("rank {rank} out of range for {num_ranks} ranks"),
            ));
        }
        let mut registry = REGISTRY
            .lock()
            .map_err(|_| SyncError::LockPoisoned("host rendezvous registry"))?;
        registry.retain(|_, group| group.strong_count() > 0);
        let group = match registry.get(id).and_then(Weak::upgrade) {
            Some(group) => group,
            None => {
                let group = Arc::new(HostGroup::new(num_ranks));
                registry.insert(id.clone(), Arc::downgrade(&group));
                group
            }
        };
        if group.num_ranks != num_ranks {
            return Err(SyncError::collective(
                "hostCommInitRank",
                format!(
                    "group {id:?} has {} ranks, rank {rank} joined expecting {num_ranks}",
                    group.num_ranks
                ),
            ));
        }
        let links = Arc::new(group.claim(rank)?);
        Ok(HostComm { group, links, rank })
    }

    unsafe fn reduce_scatter(
        &self,
        comm: &HostComm,
        stream: &HostStream,
        send_ptr: u64,
        recv_ptr: u64,
        recv_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        let links = Arc::clone(&comm.links);
        let chunk = recv_count * dtype.size_in_bytes();
        let total = chunk * comm.num_ranks();
        stream.enqueue(move || {
            // staged copy, so send and recv may overlap
            let input = unsafe { read_host(send_ptr, total) };
            let parts = links.exchange(|peer| input[peer * chunk..(peer + 1) * chunk].to_vec())?;
            let mut parts = parts.into_iter();
            let mut acc = parts.next().unwrap_or_default();
            for part in parts {
                sum_into(&mut acc, &part, dtype)?;
            }
            unsafe { write_host(recv_ptr, &acc) };
            Ok(())
        })
    }

    unsafe fn all_gather(
        &self,
        comm: &HostComm,
        stream: &HostStream,
        send_ptr: u64,
        recv_ptr: u64,
        send_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        let links = Arc::clone(&comm.links);
        let chunk = send_count * dtype.size_in_bytes();
        stream.enqueue(move || {
            let input = unsafe { read_host(send_ptr, chunk) };
            let gathered = links.exchange(|_| input.clone())?.concat();
            unsafe { write_host(recv_ptr, &gathered) };
            Ok(())
        })
    }

    fn synchronize(&self, stream: &HostStream) -> Result<()> {
        stream.synchronize()
    }
}

/// # Safety
/// `ptr` must be valid for reads of `len` bytes.
unsafe fn read_host(ptr: u64, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len).to_vec() }
}

/// # Safety
/// `ptr` must be valid for writes of `data.len()` bytes.
unsafe fn write_host(ptr: u64, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) }
}
