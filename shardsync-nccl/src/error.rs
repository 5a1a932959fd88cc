use shardsync::SyncError;

/// Turn a CUDA driver or NCCL result into a [`SyncError::Collective`] naming
/// the failing call.
pub trait CheckExt<T> {
    fn check(self, call: &'static str) -> shardsync::Result<T>;
}

impl<T, E: std::fmt::Debug> CheckExt<T> for std::result::Result<T, E> {
    fn check(self, call: &'static str) -> shardsync::Result<T> {
        self.map_err(|e| SyncError::collective(call, format!("{e:?}")))
    }
}
