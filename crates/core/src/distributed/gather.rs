//! Batch-level gathers used by the contrastive and matching losses.

use candle_core::Tensor;

use super::communicator::DeviceCommunicator;
use super::error::{DistributedError, Result};

/// Gather `tensor` from every rank along dim 0. No slice carries gradient.
pub fn concat_all_gather(comm: &dyn DeviceCommunicator, tensor: &Tensor) -> Result<Tensor> {
    let local = tensor.detach();
    if comm.world_size() == 1 {
        return Ok(local);
    }
    comm.all_gather(&local, 0)
}

/// Gather `tensor` from every rank along dim 0, keeping the local slice's
/// autograd graph.
///
/// Remote slices are detached; the trainer averages gradients across ranks
/// after backward, which supplies their contribution.
pub fn all_gather_with_grad(comm: &dyn DeviceCommunicator, tensor: &Tensor) -> Result<Tensor> {
    let world_size = comm.world_size();
    if world_size == 1 {
        return Ok(tensor.clone());
    }
    let gathered = comm.all_gather(tensor, 0)?;
    let local_rows = tensor.dim(0)?;
    if gathered.dim(0)? != local_rows * world_size {
        let mut expected = tensor.dims().to_vec();
        expected[0] = local_rows * world_size;
        return Err(DistributedError::ShapeMismatch {
            expected,
            actual: gathered.dims().to_vec(),
        });
    }
    let rank = comm.rank();
    let parts = (0..world_size)
        .map(|r| {
            if r == rank {
                Ok(tensor.clone())
            } else {
                gathered.narrow(0, r * local_rows, local_rows)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 0)?)
}
