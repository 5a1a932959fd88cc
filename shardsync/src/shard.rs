//! Mapping of a flat aggregate buffer onto per-rank shards.

use std::ops::Range;

use crate::error::{Result, SyncError};
use crate::types::Rank;

/// Size of one shard when `total` elements are split over `num_shards` ranks.
///
/// Fails unless every shard has the same size: the collective backends move
/// one fixed-size slice per rank and cannot express a shorter last shard.
pub fn shard_size(total: usize, num_shards: usize) -> Result<usize> {
    ShardPlanner::new(total, num_shards)?.shard_size()
}

/// Half-open element range `[begin, end)` owned by `rank`.
pub fn shard_range(rank: Rank, total: usize, num_shards: usize) -> Result<Range<usize>> {
    let planner = ShardPlanner::new(total, num_shards)?;
    planner.shard_size()?;
    Ok(planner.range(rank))
}

/// Shard arithmetic for a buffer of `total` elements over `num_shards` ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlanner {
    total: usize,
    num_shards: usize,
}

impl ShardPlanner {
    /// Fails with `ProcessLayout` when there are no shards to plan for.
    pub fn new(total: usize, num_shards: usize) -> Result<Self> {
        if num_shards == 0 {
            return Err(SyncError::ProcessLayout {
                reason: format!("cannot split {total} elements over zero shards"),
            });
        }
        Ok(Self { total, num_shards })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// `ceil(total / num_shards)`: the size of every shard except possibly the last.
    pub fn max_shard_size(&self) -> usize {
        self.total.div_ceil(self.num_shards)
    }

    /// The uniform shard size, or `UnevenShards` if `total` does not divide.
    pub fn shard_size(&self) -> Result<usize> {
        let size = self.max_shard_size();
        if size * self.num_shards != self.total {
            return Err(SyncError::UnevenShards {
                total: self.total,
                num_shards: self.num_shards,
            });
        }
        Ok(size)
    }

    /// Range of `rank`, clipped to `total`. With uniform shards the clip
    /// never triggers; for uneven splits the tail shards come out short or empty.
    pub fn range(&self, rank: Rank) -> Range<usize> {
        let size = self.max_shard_size();
        let begin = (rank * size).min(self.total);
        let end = (begin + size).min(self.total);
        begin..end
    }

    /// All shard ranges in rank order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.num_shards).map(|rank| self.range(rank))
    }
}
