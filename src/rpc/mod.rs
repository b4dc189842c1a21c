pub mod consensus;
pub mod transport;

pub use consensus::Consensus;
pub use transport::{
    Cluster, DistObject, DistributedControl, ProcId, ReplyFuture, ReplyHandle,
};
