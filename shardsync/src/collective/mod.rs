//! Device-to-device collective communication.

mod channel;

pub use channel::{CollectiveChannel, DeviceBuffers};

use crate::error::{Result, SyncError};
use crate::types::{DataType, Device, DeviceKind};

/// Size of a rendezvous id in bytes; the size of an `ncclUniqueId`.
pub const RENDEZVOUS_ID_BYTES: usize = 128;

/// Token generated once on global rank 0 and shared with every participant
/// to form one communication group.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RendezvousId([u8; RENDEZVOUS_ID_BYTES]);

impl RendezvousId {
    /// The all-zero id non-root processes hold before the broadcast.
    pub const fn zeroed() -> Self {
        Self([0; RENDEZVOUS_ID_BYTES])
    }

    pub const fn new(bytes: [u8; RENDEZVOUS_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Build an id from bytes received over the network.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; RENDEZVOUS_ID_BYTES] =
            bytes.try_into().map_err(|_| SyncError::RendezvousIdSize {
                expected: RENDEZVOUS_ID_BYTES,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; RENDEZVOUS_ID_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for RendezvousId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RendezvousId(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Native collective library driving one communicator per local device.
///
/// Collective calls are enqueued on a device's stream and complete
/// asynchronously; [`synchronize`](Self::synchronize) waits for them. Calls
/// for several local devices issued between [`group_start`](Self::group_start)
/// and [`group_end`](Self::group_end) are launched together, so a single
/// thread can drive all local ranks of one collective without deadlocking.
///
/// `Stream` and `Comm` own their native resources and release them on drop.
pub trait CollectiveBackend: Send + Sync {
    type Stream: Send + Sync;
    type Comm: Send + Sync;

    /// Short name used in logs and errors, e.g. `"nccl"`.
    fn name(&self) -> &'static str;

    /// Library version, if the backend can report one.
    fn version(&self) -> Option<String> {
        None
    }

    /// The device class this backend can drive.
    fn device_kind(&self) -> DeviceKind;

    /// Generate a fresh rendezvous id. Called on global rank 0 only.
    fn unique_id(&self) -> Result<RendezvousId>;

    /// Create a dedicated stream for collective work on `device`.
    fn create_stream(&self, device: Device) -> Result<Self::Stream>;

    fn group_start(&self) -> Result<()>;

    fn group_end(&self) -> Result<()>;

    /// Join the group identified by `id` as global `rank` of `num_ranks`.
    fn comm_init_rank(
        &self,
        device: Device,
        num_ranks: usize,
        id: &RendezvousId,
        rank: usize,
    ) -> Result<Self::Comm>;

    /// Sum `recv_count * num_ranks` elements at `send_ptr` across all ranks and
    /// leave this rank's `recv_count`-element slice of the result at `recv_ptr`.
    ///
    /// # Safety
    /// - `send_ptr`: valid for `recv_count * num_ranks * dtype.size_in_bytes()` bytes.
    /// - `recv_ptr`: valid for `recv_count * dtype.size_in_bytes()` bytes.
    /// - Both stay valid until the stream is synchronized.
    unsafe fn reduce_scatter(
        &self,
        comm: &Self::Comm,
        stream: &Self::Stream,
        send_ptr: u64,
        recv_ptr: u64,
        recv_count: usize,
        dtype: DataType,
    ) -> Result<()>;

    /// Concatenate every rank's `send_count` elements, in rank order, at `recv_ptr`.
    ///
    /// # Safety
    /// - `send_ptr`: valid for `send_count * dtype.size_in_bytes()` bytes.
    /// - `recv_ptr`: valid for `send_count * num_ranks * dtype.size_in_bytes()` bytes.
    /// - Both stay valid until the stream is synchronized.
    unsafe fn all_gather(
        &self,
        comm: &Self::Comm,
        stream: &Self::Stream,
        send_ptr: u64,
        recv_ptr: u64,
        send_count: usize,
        dtype: DataType,
    ) -> Result<()>;

    /// Block until all work queued on `stream` has completed.
    fn synchronize(&self, stream: &Self::Stream) -> Result<()>;
}

/// Reject element types the collectives do not carry.
pub fn check_precision(dtype: DataType, operation: &'static str) -> Result<()> {
    match dtype {
        DataType::F32 | DataType::F16 => Ok(()),
        _ => Err(SyncError::UnsupportedPrecision { dtype, operation }),
    }
}
