//! Distributed scope locking.

pub mod graph_lock;

pub use graph_lock::GraphLockManager;

use crate::primitives::deferred_lock::LockKind;

/// What a program may touch around its center vertex, and therefore
/// what the scope lock must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// No locking at all; the handler runs immediately.
    Null,
    /// Write the center vertex only.
    VertexConsistency,
    /// Read the center vertex only.
    VertexReadConsistency,
    /// Read the center and all adjacent vertices.
    ReadConsistency,
    /// Write the center, read adjacent. Sufficient for edge mutation.
    EdgeConsistency,
    /// Write the center and all adjacent vertices.
    FullConsistency,
}

impl ScopeKind {
    /// Lock taken on the center vertex.
    pub fn central_lock(self) -> LockKind {
        match self {
            ScopeKind::Null => LockKind::None,
            ScopeKind::VertexReadConsistency | ScopeKind::ReadConsistency => LockKind::Read,
            ScopeKind::VertexConsistency
            | ScopeKind::EdgeConsistency
            | ScopeKind::FullConsistency => LockKind::Write,
        }
    }

    /// Lock taken on each adjacent vertex.
    pub fn adjacent_lock(self) -> LockKind {
        match self {
            ScopeKind::Null
            | ScopeKind::VertexConsistency
            | ScopeKind::VertexReadConsistency => LockKind::None,
            ScopeKind::ReadConsistency | ScopeKind::EdgeConsistency => LockKind::Read,
            ScopeKind::FullConsistency => LockKind::Write,
        }
    }

    /// Whether the scope spans the neighborhood, and therefore every
    /// replica machine, rather than just the center's owner.
    pub fn locks_adjacent(self) -> bool {
        self.adjacent_lock() != LockKind::None
    }
}
