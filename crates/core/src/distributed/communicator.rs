//! Device communicator for collective operations.
//!
//! Provides the collectives data-parallel training needs: all_reduce,
//! all_gather, broadcast and barrier.

use candle_core::Tensor;

use super::error::Result;
use super::process_group::ProcessGroup;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

/// Trait for rank-to-rank communication.
///
/// Collectives never record autograd history: results are fresh leaves.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// For a single rank, this is identity.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: concatenate tensors from all ranks in rank order.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Broadcast: every rank receives `src_rank`'s tensor.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;

    /// Mark the group failed. Peers blocked in a collective, and every later
    /// collective, return [`DistributedError::Aborted`].
    ///
    /// [`DistributedError::Aborted`]: super::DistributedError::Aborted
    fn abort(&self, _reason: &str) {}

    fn rank(&self) -> usize {
        self.process_group().rank()
    }

    fn world_size(&self) -> usize {
        self.process_group().world_size()
    }
}

/// Mock communicator for single-rank execution.
///
/// With one rank every collective is the identity. A multi-rank mock
/// simulates peers holding identical data.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    /// Create a new mock communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let tensor = tensor.detach();
        if self.process_group.is_single() {
            return Ok(tensor);
        }
        // identical peers: only Sum differs from the local value
        match op {
            ReduceOp::Sum => Ok(tensor.affine(self.process_group.world_size() as f64, 0.0)?),
            ReduceOp::Min | ReduceOp::Max | ReduceOp::Average => Ok(tensor),
        }
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        let tensor = tensor.detach();
        if self.process_group.is_single() {
            return Ok(tensor);
        }
        let world_size = self.process_group.world_size();
        let tensors: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn broadcast(&self, tensor: &Tensor, _src_rank: usize) -> Result<Tensor> {
        Ok(tensor.detach())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalProcessGroup;
    use candle_core::Device;

    #[test]
    fn mock_single_gpu_all_reduce_identity() {
        let comm = MockCommunicator::new(LocalProcessGroup::new());
        let tensor = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();

        let result = comm.all_reduce(&tensor, ReduceOp::Sum).unwrap();
        assert_eq!(result.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn mock_single_gpu_all_gather_identity() {
        let comm = MockCommunicator::new(LocalProcessGroup::new());
        let tensor = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();

        let result = comm.all_gather(&tensor, 0).unwrap();
        assert_eq!(result.dims(), &[2, 2]);
    }

    #[test]
    fn mock_multi_rank_all_gather() {
        let pg = LocalProcessGroup::with_rank(0, 4).unwrap();
        let comm = MockCommunicator::new(pg);
        let tensor = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();

        let result = comm.all_gather(&tensor, 0).unwrap();
        assert_eq!(result.dims(), &[4, 2]);
        assert_eq!(comm.world_size(), 4);
    }

    #[test]
    fn mock_multi_rank_sum_scales() {
        let pg = LocalProcessGroup::with_rank(1, 2).unwrap();
        let comm = MockCommunicator::new(pg);
        let tensor = Tensor::new(&[1.5f32, -1.0], &Device::Cpu).unwrap();

        let sum = comm.all_reduce(&tensor, ReduceOp::Sum).unwrap();
        assert_eq!(sum.to_vec1::<f32>().unwrap(), vec![3.0, -2.0]);
        let avg = comm.all_reduce(&tensor, ReduceOp::Average).unwrap();
        assert_eq!(avg.to_vec1::<f32>().unwrap(), vec![1.5, -1.0]);
    }

    #[test]
    fn mock_barrier_and_broadcast() {
        let comm = MockCommunicator::new(LocalProcessGroup::new());
        assert!(comm.barrier().is_ok());
        let tensor = Tensor::new(&[7u32], &Device::Cpu).unwrap();
        let out = comm.broadcast(&tensor, 0).unwrap();
        assert_eq!(out.to_vec1::<u32>().unwrap(), vec![7]);
    }
}
