//! Per-device fan-out over a bounded worker pool.

use std::ops::Range;

use rayon::prelude::*;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Runs one callback per local device and folds the results.
///
/// The pool holds exactly one thread per local device and is only built when
/// there is more than one device; otherwise everything runs on the caller's
/// thread. Each task receives its device index and that device's shard range,
/// so tasks touch disjoint state and need no locking.
pub struct ParallelExecutor {
    pool: Option<rayon::ThreadPool>,
    shard_ranges: Vec<Range<usize>>,
    parallel: bool,
}

impl ParallelExecutor {
    /// `shard_ranges[i]` is the shard owned by local device `i`.
    pub fn new(shard_ranges: Vec<Range<usize>>, config: &SyncConfig) -> Result<Self> {
        if shard_ranges.is_empty() {
            return Err(SyncError::NoDevices);
        }
        let n = shard_ranges.len();
        let pool = if n > 1 && config.parallel {
            let prefix = config.thread_name_prefix.clone();
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(move |idx| format!("{prefix}-dev{idx}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            pool,
            shard_ranges,
            parallel: config.parallel,
        })
    }

    /// Number of local devices.
    pub fn num_devices(&self) -> usize {
        self.shard_ranges.len()
    }

    /// Shard range of local device `index`.
    pub fn shard_range(&self, index: usize) -> Range<usize> {
        self.shard_ranges[index].clone()
    }

    /// Invoke `func(device_index, shard_range)` once per local device and fold
    /// the results into `init` with `acc`, in device-index order.
    ///
    /// With `parallel` (and more than one device) the calls run concurrently on
    /// the pool and the caller blocks until all have finished. Every call runs
    /// to completion; if any failed, the error of the lowest device index is
    /// returned and the others are logged.
    pub fn run_all<T, F, A>(&self, func: F, mut acc: A, init: T, parallel: bool) -> Result<T>
    where
        T: Send,
        F: Fn(usize, Range<usize>) -> Result<T> + Sync,
        A: FnMut(T, T) -> T,
    {
        let pool = match &self.pool {
            Some(pool) if parallel && self.parallel => pool,
            _ => {
                let mut value = init;
                for (i, range) in self.shard_ranges.iter().enumerate() {
                    value = acc(value, func(i, range.clone())?);
                }
                return Ok(value);
            }
        };

        let results: Vec<Result<T>> = pool.install(|| {
            self.shard_ranges
                .par_iter()
                .enumerate()
                .map(|(i, range)| func(i, range.clone()))
                .collect()
        });

        let mut value = Some(init);
        let mut first_err = None;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(v) => {
                    if let Some(cur) = value.take() {
                        value = Some(acc(cur, v));
                    }
                }
                Err(e) => {
                    tracing::error!(device = i, "per-device task failed: {e}");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    value = None;
                }
            }
        }
        match (first_err, value) {
            (Some(e), _) => Err(e),
            (None, Some(v)) => Ok(v),
            (None, None) => unreachable!("value is only cleared on error"),
        }
    }

    /// [`run_all`](Self::run_all) with logical AND over an initial `true`:
    /// "did this step succeed on every device".
    pub fn run_all_and<F>(&self, func: F, parallel: bool) -> Result<bool>
    where
        F: Fn(usize, Range<usize>) -> Result<bool> + Sync,
    {
        self.run_all(func, |x, y| x && y, true, parallel)
    }
}
