use crate::error::{EngineError, Result};
use crate::locks::ScopeKind;

/// How a program invocation is isolated from its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Take only the per-vertex spin mutex around the program body.
    /// Neighbor access goes through sub-tasks, which tolerate bounded
    /// staleness on mirrors.
    VertexSpin,
    /// Acquire a full distributed scope lock of the given kind before
    /// running the program, and release it afterwards.
    Scoped(ScopeKind),
}

/// Traversal order used by `signal_all` and `signal_vset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOrder {
    Shuffle,
    Ascending,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker lanes used to hash sub-task queues and to size
    /// the sub-task executor pool.
    pub ncpus: usize,
    /// Number of program-executor fibers launched per round.
    pub num_vthreads: usize,
    /// Stack size for each fiber.
    pub fiber_stack_size: usize,
    /// Scheduler selected by name ("fifo" or "sweep").
    pub scheduler: String,
    pub lock_strategy: LockStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let ncpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            ncpus,
            num_vthreads: 128,
            fiber_stack_size: 256 * 1024,
            scheduler: "fifo".to_string(),
            lock_strategy: LockStrategy::VertexSpin,
        }
    }
}

impl EngineConfig {
    /// Small configuration for unit and integration tests: few fibers,
    /// deterministic scheduler sweep still exercised through options.
    pub fn small() -> Self {
        Self {
            ncpus: 2,
            num_vthreads: 16,
            ..Self::default()
        }
    }

    /// Applies a string engine option. Unknown keys and unparsable
    /// values are fatal, matching the option front-end contract.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "num_vthreads" => {
                self.num_vthreads = value
                    .parse()
                    .map_err(|_| EngineError::Config(format!("num_vthreads = {value:?}")))?;
            }
            "scheduler" => {
                self.scheduler = value.to_string();
            }
            _ => return Err(EngineError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ncpus == 0 {
            return Err(EngineError::Config("ncpus must be nonzero".into()));
        }
        if self.num_vthreads == 0 {
            return Err(EngineError::Config("num_vthreads must be nonzero".into()));
        }
        Ok(())
    }
}
