pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod fiber;
pub mod graph;
pub mod locks;
pub mod primitives;
pub mod rpc;
pub mod scheduler;

pub use crate::config::{EngineConfig, LockStrategy, SignalOrder};
pub use crate::engine::context::Context;
pub use crate::engine::task::{EdgeDirection, TaskParam, TaskValue};
pub use crate::engine::{Engine, ExecutionStatus};
pub use crate::error::{EngineError, Result};
pub use crate::graph::{DistributedGraph, GlobalVid, GraphBuilder, LocalVid};
pub use crate::locks::ScopeKind;
pub use crate::primitives::hash::{ContentHash, ContentHasher};
pub use crate::rpc::{Cluster, DistributedControl, ProcId};
pub use crate::scheduler::Message;
