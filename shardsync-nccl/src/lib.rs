pub mod backend;
pub mod error;
pub mod replica;
pub mod types;

pub use backend::{NcclBackend, NcclComm, NcclStream, nccl_from_rendezvous, rendezvous_from_nccl};
pub use error::CheckExt;
pub use replica::CudaReplica;
pub use types::to_nccl_dtype;
