use cudarc::nccl::sys;
use shardsync::{DataType, Result, SyncError};

/// NCCL element type for the precisions collectives run in.
pub fn to_nccl_dtype(dtype: DataType) -> Result<sys::ncclDataType_t> {
    match dtype {
        DataType::F32 => Ok(sys::ncclDataType_t::ncclFloat32),
        DataType::F16 => Ok(sys::ncclDataType_t::ncclFloat16),
        dtype => Err(SyncError::UnsupportedPrecision {
            dtype,
            operation: "nccl collective",
        }),
    }
}
