//! Rank bookkeeping for data-parallel training.

use super::error::{DistributedError, Result};

/// Trait for process group operations.
///
/// A process group assigns ranks and is the foundation for collectives.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this worker (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of workers in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node.
    fn local_rank(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-worker group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group for a single worker, or a fixed rank for tests.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Single worker (world_size = 1).
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// A group with an explicit rank and size.
    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pg_is_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
        assert_eq!(pg.local_rank(), 0);
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4).unwrap();
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    fn local_pg_invalid_rank() {
        let err = LocalProcessGroup::with_rank(5, 4).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::InvalidRank {
                rank: 5,
                world_size: 4
            }
        ));
    }
}
