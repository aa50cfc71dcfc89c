//! Distributed abstractions for data-parallel training.
//!
//! - [`ProcessGroup`] - rank and world size
//! - [`DeviceCommunicator`] - collectives (all_reduce, all_gather, broadcast, barrier)
//! - [`ThreadGroup`] - in-process ranks, one thread each
//! - [`concat_all_gather`] / [`all_gather_with_grad`] - batch gathers for the
//!   contrastive and matching losses
//!
//! A world of size 1 bypasses every collective.
//!
//! # Usage
//!
//! ```ignore
//! use daiv_core::distributed::{DeviceCommunicator, ThreadGroup};
//!
//! let group = ThreadGroup::new(2);
//! for comm in group.communicators() {
//!     std::thread::spawn(move || train_rank(comm));
//! }
//! ```

mod communicator;
mod error;
mod gather;
mod process_group;
mod thread;

pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
pub use error::{DistributedError, Result};
pub use gather::{all_gather_with_grad, concat_all_gather};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use thread::{ThreadCommunicator, ThreadGroup};

use std::sync::Arc;

/// Communicator for a single worker.
pub fn single_rank() -> Arc<dyn DeviceCommunicator> {
    Arc::new(MockCommunicator::new(LocalProcessGroup::new()))
}
