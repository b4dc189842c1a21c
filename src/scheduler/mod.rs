//! Vertex schedulers.
//!
//! A scheduler hands (local vertex id, message) pairs to worker
//! fibers. Signalling an already-pending vertex merges the messages
//! with the user's associative-commutative `merge`; programs are
//! written assuming one invocation subsumes all pending signals, so
//! combining is a correctness requirement, not an optimization.

mod fifo;
mod sweep;

pub use fifo::FifoScheduler;
pub use sweep::SweepScheduler;

use crate::error::{EngineError, Result};
use crate::graph::LocalVid;

/// Engine message. `merge` must be associative and commutative: both
/// the scheduler and the mirror-forwarding path combine in arrival
/// order, which nothing constrains.
pub trait Message: Clone + Send + Sync + 'static {
    fn merge(&mut self, other: Self);
}

impl Message for () {
    fn merge(&mut self, _other: Self) {}
}

/// All methods are called concurrently from worker fibers and RPC
/// handler threads.
pub trait Scheduler<M: Message>: Send + Sync + std::fmt::Debug {
    /// Called once by the engine before the first `get_next`.
    fn start(&self);

    /// Signals a vertex, merging with any pending message.
    fn schedule(&self, lvid: LocalVid, msg: M);

    /// Next pending vertex for this worker, or `None` when the
    /// scheduler has nothing for it right now. A vertex signalled
    /// since its last pickup is eventually returned by some worker.
    fn get_next(&self, worker: usize) -> Option<(LocalVid, M)>;

    fn is_empty(&self) -> bool;

    /// Approximate number of pending vertices; the engine bounds
    /// fiber respawn with it.
    fn approx_size(&self) -> usize;
}

/// Builds a scheduler by name. Unknown names are a configuration
/// error, reported before the engine starts.
pub fn new_scheduler<M: Message>(
    name: &str,
    num_vertices: usize,
    nworkers: usize,
) -> Result<Box<dyn Scheduler<M>>> {
    match name {
        "fifo" => Ok(Box::new(FifoScheduler::new(num_vertices, nworkers))),
        "sweep" => Ok(Box::new(SweepScheduler::new(num_vertices, nworkers))),
        other => Err(EngineError::UnknownScheduler(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_knows_its_names() {
        assert!(new_scheduler::<()>("fifo", 8, 2).is_ok());
        assert!(new_scheduler::<()>("sweep", 8, 2).is_ok());
        let err = new_scheduler::<()>("priority", 8, 2).unwrap_err();
        assert!(matches!(err, EngineError::UnknownScheduler(_)));
    }
}
