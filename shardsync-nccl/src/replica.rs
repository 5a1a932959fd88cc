use std::ops::Range;
use std::sync::Arc;

use cudarc::driver::{CudaContext, result as driver, sys::CUdeviceptr};
use shardsync::{BufferKind, DataType, Device, DeviceReplica, Result, SyncError};

use crate::error::CheckExt;

/// Parameter and gradient buffers allocated directly in device memory.
///
/// Suited to driving the synchronizer without a full tensor engine, e.g. in
/// tests and benchmarks. All copies are synchronous.
pub struct CudaReplica {
    device: Device,
    dtype: DataType,
    len: usize,
    ctx: Arc<CudaContext>,
    params: CUdeviceptr,
    grads: CUdeviceptr,
}

impl CudaReplica {
    /// Zero-filled buffers of `len` elements on GPU `ordinal`.
    pub fn new(ordinal: usize, dtype: DataType, len: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).check("cuDevicePrimaryCtxRetain")?;
        ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        // cuMemAlloc rejects zero-byte requests
        let bytes = (len * dtype.size_in_bytes()).max(1);
        let params = unsafe { driver::malloc_sync(bytes).check("cuMemAlloc")? };
        let grads = match unsafe { driver::malloc_sync(bytes).check("cuMemAlloc") } {
            Ok(p) => p,
            Err(e) => {
                let _ = unsafe { driver::free_sync(params) };
                return Err(e);
            }
        };
        let replica = Self {
            device: Device::gpu(ordinal),
            dtype,
            len,
            ctx,
            params,
            grads,
        };
        replica.fill_zero(BufferKind::Params, 0..len)?;
        replica.fill_zero(BufferKind::Grads, 0..len)?;
        Ok(replica)
    }

    fn ptr(&self, kind: BufferKind) -> CUdeviceptr {
        match kind {
            BufferKind::Params => self.params,
            BufferKind::Grads => self.grads,
        }
    }

    /// Device address and byte length of `range`, after bounds checking.
    fn span(&self, kind: BufferKind, range: Range<usize>, context: &'static str) -> Result<(CUdeviceptr, usize)> {
        if range.start > range.end || range.end > self.len {
            return Err(SyncError::SizeMismatch {
                context,
                expected: self.len,
                actual: range.end,
            });
        }
        let elem = self.dtype.size_in_bytes();
        self.ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        Ok((
            self.ptr(kind) + (range.start * elem) as CUdeviceptr,
            range.len() * elem,
        ))
    }
}

// SAFETY: both allocations are `len * dtype` bytes (at least one), owned by the
// replica and freed only on drop.
unsafe impl DeviceReplica for CudaReplica {
    fn device(&self) -> Device {
        self.device
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }

    fn buffer_ptr(&self, kind: BufferKind) -> u64 {
        self.ptr(kind) as u64
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.bind_to_thread().check("cuCtxSetCurrent")?;
        self.ctx.synchronize().check("cuCtxSynchronize")
    }

    fn fill_zero(&self, kind: BufferKind, range: Range<usize>) -> Result<()> {
        let (ptr, bytes) = self.span(kind, range, "CudaReplica::fill_zero")?;
        if bytes == 0 {
            return Ok(());
        }
        unsafe { driver::memset_d8_sync(ptr, 0, bytes).check("cuMemsetD8") }
    }

    fn read(&self, kind: BufferKind, range: Range<usize>) -> Result<Vec<u8>> {
        let (ptr, bytes) = self.span(kind, range, "CudaReplica::read")?;
        let mut host = vec![0u8; bytes];
        if bytes > 0 {
            unsafe { driver::memcpy_dtoh_sync(&mut host, ptr).check("cuMemcpyDtoH")? };
        }
        Ok(host)
    }

    fn write(&self, kind: BufferKind, offset: usize, bytes: &[u8]) -> Result<()> {
        let elem = self.dtype.size_in_bytes();
        if bytes.len() % elem != 0 {
            return Err(SyncError::SizeMismatch {
                context: "CudaReplica::write",
                expected: bytes.len() / elem * elem,
                actual: bytes.len(),
            });
        }
        let (ptr, n) = self.span(kind, offset..offset + bytes.len() / elem, "CudaReplica::write")?;
        if n == 0 {
            return Ok(());
        }
        unsafe { driver::memcpy_htod_sync(ptr, bytes).check("cuMemcpyHtoD") }
    }
}

impl Drop for CudaReplica {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.bind_to_thread() {
            tracing::warn!(device = %self.device, "cannot select device to free replica: {e:?}");
        }
        for ptr in [self.params, self.grads] {
            if let Err(e) = unsafe { driver::free_sync(ptr) } {
                tracing::warn!(device = %self.device, "cuMemFree failed: {e:?}");
            }
        }
    }
}
