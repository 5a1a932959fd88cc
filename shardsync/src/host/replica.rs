use std::ops::Range;
use std::sync::Mutex;

use half::f16;

use crate::error::{Result, SyncError};
use crate::item::CheckpointItem;
use crate::replica::{DeviceReplica, ShardedTensor};
use crate::types::{BufferKind, DataType, Device};

/// Fixed heap allocation addressed through its raw pointer.
struct HostBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the allocation is owned; concurrent access is coordinated by callers
// the same way device memory is (disjoint ranges, stream ordering).
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    fn zeroed(len: usize) -> Self {
        let ptr = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        Self { ptr, len }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn check(&self, range: &Range<usize>, context: &'static str) -> Result<()> {
        if range.start > range.end || range.end > self.len {
            return Err(SyncError::SizeMismatch {
                context,
                expected: self.len,
                actual: range.end,
            });
        }
        Ok(())
    }

    fn read(&self, range: Range<usize>) -> Result<Vec<u8>> {
        self.check(&range, "host buffer read")?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(range.start), range.len()) }.to_vec())
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(&(offset..offset + bytes.len()), "host buffer write")?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len()) };
        Ok(())
    }

    fn fill_zero(&self, range: Range<usize>) -> Result<()> {
        self.check(&range, "host buffer fill")?;
        unsafe { std::ptr::write_bytes(self.ptr.add(range.start), 0, range.len()) };
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr and len come from Box::into_raw in `zeroed`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr, self.len)));
        }
    }
}

/// A model replica in host memory, for the host backend and for tests.
pub struct HostReplica {
    device: Device,
    dtype: DataType,
    len: usize,
    params: HostBuffer,
    grads: HostBuffer,
}

impl HostReplica {
    /// Zero-filled parameter and gradient buffers of `len` elements.
    pub fn new(device: Device, dtype: DataType, len: usize) -> Self {
        let bytes = len * dtype.size_in_bytes();
        Self {
            device,
            dtype,
            len,
            params: HostBuffer::zeroed(bytes),
            grads: HostBuffer::zeroed(bytes),
        }
    }

    fn buffer(&self, kind: BufferKind) -> &HostBuffer {
        match kind {
            BufferKind::Params => &self.params,
            BufferKind::Grads => &self.grads,
        }
    }

    fn byte_range(&self, range: Range<usize>) -> Range<usize> {
        let elem = self.dtype.size_in_bytes();
        range.start * elem..range.end * elem
    }

    /// Store `values` into `kind`, converting to the replica's element type.
    pub fn load_f32(&self, kind: BufferKind, values: &[f32]) -> Result<()> {
        if values.len() != self.len {
            return Err(SyncError::SizeMismatch {
                context: "HostReplica::load_f32",
                expected: self.len,
                actual: values.len(),
            });
        }
        let bytes: Vec<u8> = match self.dtype {
            DataType::F32 => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            DataType::F16 => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_ne_bytes())
                .collect(),
            dtype => {
                return Err(SyncError::UnsupportedPrecision {
                    dtype,
                    operation: "HostReplica::load_f32",
                });
            }
        };
        self.buffer(kind).write(0, &bytes)
    }

    /// Read `kind` back as f32 values.
    pub fn to_f32(&self, kind: BufferKind) -> Result<Vec<f32>> {
        let bytes = self.read(kind, 0..self.len)?;
        match self.dtype {
            DataType::F32 => Ok(bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect()),
            DataType::F16 => Ok(bytes
                .chunks_exact(2)
                .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
                .collect()),
            dtype => Err(SyncError::UnsupportedPrecision {
                dtype,
                operation: "HostReplica::to_f32",
            }),
        }
    }
}

// SAFETY: both buffers are fixed allocations of `len * dtype` bytes, freed
// only when the replica drops.
unsafe impl DeviceReplica for HostReplica {
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
        self.buffer(kind).addr()
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn fill_zero(&self, kind: BufferKind, range: Range<usize>) -> Result<()> {
        self.buffer(kind).fill_zero(self.byte_range(range))
    }

    fn read(&self, kind: BufferKind, range: Range<usize>) -> Result<Vec<u8>> {
        self.buffer(kind).read(self.byte_range(range))
    }

    fn write(&self, kind: BufferKind, offset: usize, bytes: &[u8]) -> Result<()> {
        self.buffer(kind)
            .write(offset * self.dtype.size_in_bytes(), bytes)
    }
}

/// An optimizer shard held in host memory.
#[derive(Debug)]
pub struct HostShard {
    name: String,
    dtype: DataType,
    bytes: Mutex<Vec<u8>>,
}

impl HostShard {
    pub fn new(name: impl Into<String>, dtype: DataType, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            bytes: Mutex::new(bytes),
        }
    }

    pub fn from_f32(name: impl Into<String>, values: &[f32]) -> Self {
        let item = CheckpointItem::from_f32(name, values);
        Self::new(item.name, item.dtype, item.bytes)
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        Ok(self.to_item()?.to_f32())
    }
}

impl ShardedTensor for HostShard {
    fn size_bytes(&self) -> usize {
        self.bytes
            .lock()
            .map(|b| b.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    fn to_item(&self) -> Result<CheckpointItem> {
        let bytes = self
            .bytes
            .lock()
            .map_err(|_| SyncError::LockPoisoned("host shard"))?;
        Ok(CheckpointItem::new(self.name.clone(), self.dtype, bytes.clone()))
    }

    fn set(&self, bytes: &[u8]) -> Result<()> {
        let mut current = self
            .bytes
            .lock()
            .map_err(|_| SyncError::LockPoisoned("host shard"))?;
        if current.len() != bytes.len() {
            return Err(SyncError::SizeMismatch {
                context: "HostShard::set",
                expected: current.len(),
                actual: bytes.len(),
            });
        }
        current.copy_from_slice(bytes);
        Ok(())
    }
}
