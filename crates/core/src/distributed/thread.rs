//! In-process collectives for data-parallel training on threads.
//!
//! Every rank deposits its tensor in a shared exchange, waits on a
//! rendezvous, reads all deposits, then waits again so no rank overwrites a
//! slot while a peer is still reading it. A rank that fails aborts the group,
//! which releases every waiting peer with an error.

use std::sync::{Arc, Condvar, Mutex};

use candle_core::Tensor;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

#[derive(Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
}

/// Reusable barrier that can be aborted.
struct Rendezvous {
    state: Mutex<RendezvousState>,
    released: Condvar,
    world_size: usize,
}

impl Rendezvous {
    fn new(world_size: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState::default()),
            released: Condvar::new(),
            world_size,
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if let Some(reason) = &state.aborted {
            return Err(DistributedError::Aborted(reason.clone()));
        }
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        let state = self
            .released
            .wait_while(state, |s| s.generation == generation && s.aborted.is_none())
            .map_err(|_| poisoned())?;
        match &state.aborted {
            Some(reason) if state.generation == generation => {
                Err(DistributedError::Aborted(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    fn abort(&self, reason: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.aborted.is_none() {
            state.aborted = Some(reason.to_string());
        }
        self.released.notify_all();
    }
}

fn poisoned() -> DistributedError {
    DistributedError::Aborted("exchange poisoned".to_string())
}

struct Exchange {
    slots: Mutex<Vec<Option<Tensor>>>,
    rendezvous: Rendezvous,
    world_size: usize,
}

/// A group of ranks that communicate through shared memory.
#[derive(Clone)]
pub struct ThreadGroup {
    exchange: Arc<Exchange>,
}

impl ThreadGroup {
    pub fn new(world_size: usize) -> Self {
        let world_size = world_size.max(1);
        Self {
            exchange: Arc::new(Exchange {
                slots: Mutex::new(vec![None; world_size]),
                rendezvous: Rendezvous::new(world_size),
                world_size,
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.exchange.world_size
    }

    /// Fail every pending and future collective of the group.
    pub fn abort(&self, reason: &str) {
        self.exchange.rendezvous.abort(reason);
    }

    /// Communicator for one rank. Each rank must be driven by its own thread.
    pub fn communicator(&self, rank: usize) -> Result<ThreadCommunicator> {
        let world_size = self.world_size();
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(ThreadCommunicator {
            rank: ThreadRank { rank, world_size },
            exchange: Arc::clone(&self.exchange),
        })
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<ThreadCommunicator> {
        (0..self.world_size())
            .map(|rank| ThreadCommunicator {
                rank: ThreadRank {
                    rank,
                    world_size: self.world_size(),
                },
                exchange: Arc::clone(&self.exchange),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ThreadRank {
    rank: usize,
    world_size: usize,
}

impl ProcessGroup for ThreadRank {
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

/// Per-rank handle into a [`ThreadGroup`].
pub struct ThreadCommunicator {
    rank: ThreadRank,
    exchange: Arc<Exchange>,
}

impl ThreadCommunicator {
    /// Deposit `tensor` and return every rank's deposit in rank order.
    fn exchange(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        let ex = &self.exchange;
        {
            let mut slots = ex.slots.lock().map_err(|_| poisoned())?;
            slots[self.rank.rank] = Some(tensor.detach());
        }
        ex.rendezvous.wait()?;
        let gathered = {
            let slots = ex.slots.lock().map_err(|_| poisoned())?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        DistributedError::Aborted(format!("rank {rank} did not contribute"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };
        ex.rendezvous.wait()?;
        gathered
    }
}

impl DeviceCommunicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.rank
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.rank.is_single() {
            return Ok(tensor.detach());
        }
        let parts = self.exchange(tensor)?;
        for part in &parts {
            if part.dims() != tensor.dims() {
                return Err(DistributedError::ShapeMismatch {
                    expected: tensor.dims().to_vec(),
                    actual: part.dims().to_vec(),
                });
            }
        }
        let stacked = Tensor::stack(&parts, 0)?;
        let reduced = match op {
            ReduceOp::Sum => stacked.sum(0)?,
            ReduceOp::Average => stacked.mean(0)?,
            ReduceOp::Min => stacked.min(0)?,
            ReduceOp::Max => stacked.max(0)?,
        };
        Ok(reduced)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.rank.is_single() {
            return Ok(tensor.detach());
        }
        let parts = self.exchange(tensor)?;
        let expected: Vec<usize> = tensor
            .dims()
            .iter()
            .enumerate()
            .filter(|(d, _)| *d != gather_dim)
            .map(|(_, s)| *s)
            .collect();
        for part in &parts {
            let actual: Vec<usize> = part
                .dims()
                .iter()
                .enumerate()
                .filter(|(d, _)| *d != gather_dim)
                .map(|(_, s)| *s)
                .collect();
            if actual != expected {
                return Err(DistributedError::ShapeMismatch { expected, actual });
            }
        }
        Ok(Tensor::cat(&parts, gather_dim)?)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.rank.world_size;
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        if self.rank.is_single() {
            return Ok(tensor.detach());
        }
        let mut parts = self.exchange(tensor)?;
        Ok(parts.swap_remove(src_rank))
    }

    fn barrier(&self) -> Result<()> {
        if self.rank.is_single() {
            return Ok(());
        }
        self.exchange.rendezvous.wait()
    }

    fn abort(&self, reason: &str) {
        let reason = format!("rank {}: {reason}", self.rank.rank);
        self.exchange.rendezvous.abort(&reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn run_ranks<T: Send>(
        world_size: usize,
        f: impl Fn(ThreadCommunicator) -> T + Sync,
    ) -> Vec<T> {
        let group = ThreadGroup::new(world_size);
        std::thread::scope(|s| {
            let handles: Vec<_> = group
                .communicators()
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let results = run_ranks(3, |comm| {
            let t = Tensor::new(&[[comm.rank() as f32, 1.0]], &Device::Cpu).unwrap();
            comm.all_gather(&t, 0).unwrap().to_vec2::<f32>().unwrap()
        });
        for r in results {
            assert_eq!(r, vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 1.0]]);
        }
    }

    #[test]
    fn all_reduce_average_and_sum() {
        let results = run_ranks(2, |comm| {
            let t = Tensor::new(&[comm.rank() as f32 * 2.0, 4.0], &Device::Cpu).unwrap();
            let avg = comm.all_reduce(&t, ReduceOp::Average).unwrap();
            let sum = comm.all_reduce(&t, ReduceOp::Sum).unwrap();
            (avg.to_vec1::<f32>().unwrap(), sum.to_vec1::<f32>().unwrap())
        });
        for (avg, sum) in results {
            assert_eq!(avg, vec![1.0, 4.0]);
            assert_eq!(sum, vec![2.0, 8.0]);
        }
    }

    #[test]
    fn broadcast_from_rank_zero() {
        let results = run_ranks(4, |comm| {
            let t = Tensor::new(&[comm.rank() as u32 + 10], &Device::Cpu).unwrap();
            comm.broadcast(&t, 0).unwrap().to_vec1::<u32>().unwrap()
        });
        assert!(results.iter().all(|r| r == &vec![10]));
    }

    #[test]
    fn repeated_collectives_do_not_mix_rounds() {
        let results = run_ranks(2, |comm| {
            let mut seen = Vec::new();
            for step in 0..5u32 {
                let t = Tensor::new(&[step * 10 + comm.rank() as u32], &Device::Cpu).unwrap();
                seen.push(comm.all_gather(&t, 0).unwrap().to_vec1::<u32>().unwrap());
            }
            seen
        });
        for seen in results {
            for (step, row) in seen.iter().enumerate() {
                let step = step as u32;
                assert_eq!(row, &vec![step * 10, step * 10 + 1]);
            }
        }
    }

    #[test]
    fn failed_rank_releases_waiting_peers() {
        let results = run_ranks(3, |comm| {
            let t = Tensor::new(&[comm.rank() as f32], &Device::Cpu).unwrap();
            comm.all_reduce(&t, ReduceOp::Sum).unwrap();
            if comm.rank() == 2 {
                comm.abort("bad batch");
                return None;
            }
            Some(comm.all_reduce(&t, ReduceOp::Sum))
        });
        for result in results.into_iter().flatten() {
            match result {
                Err(DistributedError::Aborted(reason)) => {
                    assert!(reason.contains("rank 2"), "{reason}");
                    assert!(reason.contains("bad batch"), "{reason}");
                }
                other => panic!("expected abort, got {other:?}"),
            }
        }
    }

    #[test]
    fn aborted_group_fails_fast() {
        let group = ThreadGroup::new(2);
        group.abort("shutdown");
        let comm = group.communicator(0).unwrap();
        assert!(matches!(comm.barrier(), Err(DistributedError::Aborted(_))));
        let t = Tensor::new(&[1f32], &Device::Cpu).unwrap();
        assert!(comm.all_gather(&t, 0).is_err());
    }

    #[test]
    fn invalid_rank_rejected() {
        let group = ThreadGroup::new(2);
        assert!(group.communicator(2).is_err());
        assert!(group.communicator(1).is_ok());
    }
}
