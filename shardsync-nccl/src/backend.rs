use std::ffi::{c_char, c_void};
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::{result as nccl, sys};
use shardsync::collective::{CollectiveBackend, RENDEZVOUS_ID_BYTES, RendezvousId};
use shardsync::{DataType, Device, DeviceKind, Result, SyncError};

use crate::error::CheckExt;
use crate::types::to_nccl_dtype;

/// NCCL over CUDA devices.
///
/// Uses cudarc's `result` layer directly (raw pointers) rather than the `safe`
/// layer, because buffers arrive as `u64` device addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NcclBackend;

/// A dedicated CUDA stream for collective work on one device.
pub struct NcclStream {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl NcclStream {
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    fn cu_stream(&self) -> sys::cudaStream_t {
        self.stream.cu_stream() as sys::cudaStream_t
    }
}

/// One device's NCCL communicator.
pub struct NcclComm {
    ctx: Arc<CudaContext>,
    comm: sys::ncclComm_t,
    rank: usize,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization; the channel issues calls on one comm from one
// thread at a time.
unsafe impl Send for NcclComm {}
unsafe impl Sync for NcclComm {}

impl NcclComm {
    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl Drop for NcclComm {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.bind_to_thread() {
            tracing::warn!(rank = self.rank, "cannot select device for ncclCommDestroy: {e:?}");
        }
        if let Err(e) = unsafe { nccl::comm_destroy(self.comm) } {
            tracing::warn!(rank = self.rank, "ncclCommDestroy failed: {e:?}");
        }
    }
}

impl CollectiveBackend for NcclBackend {
    type Stream = NcclStream;
    type Comm = NcclComm;

    fn name(&self) -> &'static str {
        "nccl"
    }

    fn version(&self) -> Option<String> {
        let mut code = 0i32;
        let rc = unsafe { sys::ncclGetVersion(&mut code) };
        if rc != sys::ncclResult_t::ncclSuccess {
            return None;
        }
        Some(format!(
            "{}.{}.{}",
            code / 10000,
            (code % 10000) / 100,
            code % 100
        ))
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn unique_id(&self) -> Result<RendezvousId> {
        let id = nccl::get_uniqueid().check("ncclGetUniqueId")?;
        Ok(rendezvous_from_nccl(&id))
    }

    fn create_stream(&self, device: Device) -> Result<NcclStream> {
        let ctx = CudaContext::new(device.ordinal).check("cuDevicePrimaryCtxRetain")?;
        let stream = ctx.new_stream().check("cuStreamCreate")?;
        Ok(NcclStream { ctx, stream })
    }

    fn group_start(&self) -> Result<()> {
        nccl_ok(unsafe { sys::ncclGroupStart() }, "ncclGroupStart")
    }

    fn group_end(&self) -> Result<()> {
        nccl_ok(unsafe { sys::ncclGroupEnd() }, "ncclGroupEnd")
    }

    fn comm_init_rank(
        &self,
        device: Device,
        num_ranks: usize,
        id: &RendezvousId,
        rank: usize,
    ) -> Result<NcclComm> {
        let ctx = CudaContext::new(device.ordinal).check("cuDevicePrimaryCtxRetain")?;
        ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                num_ranks as i32,
                nccl_from_rendezvous(id),
                rank as i32,
            )
            .check("ncclCommInitRank")?;
        }
        Ok(NcclComm {
            ctx,
            comm: unsafe { comm.assume_init() },
            rank,
        })
    }

    unsafe fn reduce_scatter(
        &self,
        comm: &NcclComm,
        stream: &NcclStream,
        send_ptr: u64,
        recv_ptr: u64,
        recv_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        comm.ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        unsafe {
            nccl::reduce_scatter(
                send_ptr as *const c_void,
                recv_ptr as *mut c_void,
                recv_count,
                to_nccl_dtype(dtype)?,
                sys::ncclRedOp_t::ncclSum,
                comm.comm,
                stream.cu_stream(),
            )
            .check("ncclReduceScatter")?;
        }
        Ok(())
    }

    unsafe fn all_gather(
        &self,
        comm: &NcclComm,
        stream: &NcclStream,
        send_ptr: u64,
        recv_ptr: u64,
        send_count: usize,
        dtype: DataType,
    ) -> Result<()> {
        comm.ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        unsafe {
            nccl::all_gather(
                send_ptr as *const c_void,
                recv_ptr as *mut c_void,
                send_count,
                to_nccl_dtype(dtype)?,
                comm.comm,
                stream.cu_stream(),
            )
            .check("ncclAllGather")?;
        }
        Ok(())
    }

    fn synchronize(&self, stream: &NcclStream) -> Result<()> {
        stream.ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        stream.stream.synchronize().check("cuStreamSynchronize")
    }
}

fn nccl_ok(rc: sys::ncclResult_t, call: &'static str) -> Result<()> {
    if rc == sys::ncclResult_t::ncclSuccess {
        Ok(())
    } else {
        Err(SyncError::collective(call, format!("{rc:?}")))
    }
}

/// The opaque bytes of an NCCL unique id, as shipped between processes.
pub fn rendezvous_from_nccl(id: &sys::ncclUniqueId) -> RendezvousId {
    let mut bytes = [0u8; RENDEZVOUS_ID_BYTES];
    for (dst, &c) in bytes.iter_mut().zip(id.internal.iter()) {
        *dst = c as u8;
    }
    RendezvousId::new(bytes)
}

pub fn nccl_from_rendezvous(id: &RendezvousId) -> sys::ncclUniqueId {
    let mut internal = [0 as c_char; RENDEZVOUS_ID_BYTES];
    for (dst, &b) in internal.iter_mut().zip(id.as_bytes()) {
        *dst = b as c_char;
    }
    sys::ncclUniqueId { internal }
}
