//! The distributed scope-lock manager.
//!
//! Locking is two families of continuations. The outer family, one
//! record per scope request, iterates the owners of the vertex's
//! replicas and issues a partial-lock request to each in turn. The
//! inner family completes the lock on one machine: it walks the local
//! neighborhood in strictly ascending local-vertex-id order (a merge
//! of the sorted in- and out-edge neighbor lists with the center
//! spliced in by id), issuing one deferred lock per member. A step
//! that queues suspends the walk; the grant callback resumes it by
//! tag. Ghost vertices are skipped — their locks are acquired by the
//! partial lock running on their owner.
//!
//! Continuation records live in stable-id arenas and their ids travel
//! in lock messages; a record is erased only by the machine that owns
//! it, after observing completion.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::graph::{DistributedGraph, GlobalVid, LocalVid};
use crate::locks::ScopeKind;
use crate::primitives::deferred_lock::{DeferredRwLock, LockKind, Request};
use crate::primitives::lazy_deque::LazyDeque;
use crate::rpc::transport::{DistObject, DistributedControl};
use crate::rpc::ProcId;

const SENTINEL: LocalVid = LocalVid::MAX;

#[derive(Clone)]
enum LockMsg {
    PartialRequest {
        gvid: GlobalVid,
        scope: ScopeKind,
        outer_tag: usize,
    },
    PartialDone {
        outer_tag: usize,
    },
    PartialUnlock {
        gvid: GlobalVid,
        scope: ScopeKind,
    },
}

type ScopeHandler = Box<dyn FnOnce(GlobalVid) + Send>;

struct ScopeCont {
    gvid: GlobalVid,
    scope: ScopeKind,
    replicas: SmallVec<[ProcId; 4]>,
    next_replica: usize,
    handler: Option<ScopeHandler>,
}

struct PartialCont {
    lvid: LocalVid,
    in_idx: usize,
    out_idx: usize,
    cur_locked: bool,
    scope: ScopeKind,
    src_proc: ProcId,
    outer_tag: usize,
}

enum WalkOutcome {
    Blocked,
    Complete { src: ProcId, outer_tag: usize },
}

enum ScopeStep {
    Dispatch {
        dst: ProcId,
        gvid: GlobalVid,
        scope: ScopeKind,
    },
    Done {
        handler: ScopeHandler,
        gvid: GlobalVid,
    },
}

pub struct GraphLockManager<V, E> {
    dc: Arc<DistributedControl>,
    obj: DistObject<LockMsg>,
    graph: Arc<DistributedGraph<V, E>>,
    /// Lock `i` guards owned local vertex `i`; owned vertices come
    /// first in the local store by construction.
    locks: Vec<DeferredRwLock>,
    scope_conts: Mutex<LazyDeque<ScopeCont>>,
    partial_conts: Mutex<LazyDeque<PartialCont>>,
}

impl<V, E> GraphLockManager<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(
        dc: &Arc<DistributedControl>,
        graph: Arc<DistributedGraph<V, E>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let handler_weak = weak.clone();
            let obj = dc.register(move |src, msg: LockMsg| {
                let Some(mgr) = handler_weak.upgrade() else {
                    return;
                };
                match msg {
                    LockMsg::PartialRequest {
                        gvid,
                        scope,
                        outer_tag,
                    } => mgr.handle_partial_request(src, gvid, scope, outer_tag),
                    LockMsg::PartialDone { outer_tag } => mgr.continue_scope_lock(outer_tag),
                    LockMsg::PartialUnlock { gvid, scope } => {
                        mgr.partial_unlock_local(gvid, scope)
                    }
                }
            });
            let locks = (0..graph.num_local_own_vertices())
                .map(|_| DeferredRwLock::new())
                .collect();
            Self {
                dc: Arc::clone(dc),
                obj,
                graph,
                locks,
                scope_conts: Mutex::new(LazyDeque::new()),
                partial_conts: Mutex::new(LazyDeque::new()),
            }
        })
    }

    fn procid(&self) -> ProcId {
        self.dc.procid()
    }

    /// Requests a lock on the scope around `gvid`, which must be
    /// mastered on this machine. `handler` runs exactly once, when
    /// the whole scope is held; it may run on the caller's stack (a
    /// fully synchronous grant) or on an RPC handler thread, and must
    /// not block.
    pub fn scope_request<F>(&self, gvid: GlobalVid, scope: ScopeKind, handler: F)
    where
        F: FnOnce(GlobalVid) + Send + 'static,
    {
        if scope == ScopeKind::Null {
            handler(gvid);
            return;
        }
        let lvid = self.graph.global_to_local(gvid).expect("vertex present");
        assert!(
            self.graph.is_master(lvid),
            "scope request on a non-master replica"
        );
        let replicas = self.replica_span(lvid, scope);
        debug!(proc = self.procid(), gvid, ?scope, "lock.scope.request");
        let tag = self.scope_conts.lock().push_anywhere(ScopeCont {
            gvid,
            scope,
            replicas,
            next_replica: 0,
            handler: Some(Box::new(handler)),
        });
        self.continue_scope_lock(tag);
    }

    /// Releases a previously granted scope. Every lock freed here may
    /// resume other walks, which continue on this thread.
    pub fn scope_unlock(&self, gvid: GlobalVid, scope: ScopeKind) {
        if scope == ScopeKind::Null {
            return;
        }
        let lvid = self.graph.global_to_local(gvid).expect("vertex present");
        debug!(proc = self.procid(), gvid, ?scope, "lock.scope.unlock");
        for &p in &self.replica_span(lvid, scope) {
            if p == self.procid() {
                self.partial_unlock_local(gvid, scope);
            } else {
                self.obj.remote_call(p, LockMsg::PartialUnlock { gvid, scope });
            }
        }
    }

    /// Machines that participate in the scope: every replica when the
    /// neighborhood is locked, otherwise only this (owner) machine.
    fn replica_span(&self, lvid: LocalVid, scope: ScopeKind) -> SmallVec<[ProcId; 4]> {
        if scope.locks_adjacent() {
            self.graph.replicas(lvid)
        } else {
            smallvec![self.procid()]
        }
    }

    fn continue_scope_lock(&self, tag: usize) {
        let step = {
            let mut conts = self.scope_conts.lock();
            let cont = conts.get_mut(tag).expect("live scope continuation");
            if cont.next_replica < cont.replicas.len() {
                let dst = cont.replicas[cont.next_replica];
                cont.next_replica += 1;
                ScopeStep::Dispatch {
                    dst,
                    gvid: cont.gvid,
                    scope: cont.scope,
                }
            } else {
                let handler = cont.handler.take().expect("handler not yet invoked");
                let gvid = cont.gvid;
                conts.erase(tag);
                ScopeStep::Done { handler, gvid }
            }
        };
        match step {
            ScopeStep::Dispatch { dst, gvid, scope } => {
                if dst == self.procid() {
                    self.handle_partial_request(self.procid(), gvid, scope, tag);
                } else {
                    self.obj.remote_call(
                        dst,
                        LockMsg::PartialRequest {
                            gvid,
                            scope,
                            outer_tag: tag,
                        },
                    );
                }
            }
            ScopeStep::Done { handler, gvid } => {
                debug!(proc = self.procid(), gvid, "lock.scope.granted");
                handler(gvid);
            }
        }
    }

    fn handle_partial_request(
        &self,
        src: ProcId,
        gvid: GlobalVid,
        scope: ScopeKind,
        outer_tag: usize,
    ) {
        debug!(
            proc = self.procid(),
            src, gvid, "lock.partial.request"
        );
        let lvid = self
            .graph
            .global_to_local(gvid)
            .expect("partial lock request for an absent vertex");
        let mut cont = PartialCont {
            lvid,
            in_idx: 0,
            out_idx: 0,
            cur_locked: false,
            scope,
            src_proc: src,
            outer_tag,
        };
        if !scope.locks_adjacent() {
            // No neighborhood walk: jump both cursors to the end so
            // only the center remains to lock.
            cont.in_idx = usize::MAX;
            cont.out_idx = usize::MAX;
        }
        let tag = self.partial_conts.lock().push_anywhere(cont);
        self.continue_partial_lock(tag);
    }

    /// Advances the walk for partial continuation `tag` until it
    /// either queues on a lock or finishes the scope's local part.
    ///
    /// The arena mutex is held for the whole advance; a release on
    /// another thread that grants one of this walk's requests blocks
    /// on it until the walk has parked, so a continuation is only
    /// ever driven by one thread.
    fn continue_partial_lock(&self, tag: usize) {
        let outcome = {
            let mut conts = self.partial_conts.lock();
            let cont = conts.get_mut(tag).expect("live partial continuation");
            match self.advance_walk(cont, tag) {
                WalkOutcome::Blocked => WalkOutcome::Blocked,
                done @ WalkOutcome::Complete { .. } => {
                    conts.erase(tag);
                    done
                }
            }
        };
        if let WalkOutcome::Complete { src, outer_tag } = outcome {
            if src == self.procid() {
                self.continue_scope_lock(outer_tag);
            } else {
                self.obj.remote_call(src, LockMsg::PartialDone { outer_tag });
            }
        }
    }

    fn advance_walk(&self, cont: &mut PartialCont, tag: usize) -> WalkOutcome {
        let lvid = cont.lvid;
        let central = cont.scope.central_lock();
        let adjacent = cont.scope.adjacent_lock();
        let in_list = self.graph.in_edge_ids(lvid);
        let out_list = self.graph.out_edge_ids(lvid);
        // Merge the two sorted neighbor sequences, splicing the
        // center in at its id position. Duplicate ids across the two
        // lists are locked exactly once.
        while cont.in_idx < in_list.len() || cont.out_idx < out_list.len() {
            let inv = if cont.in_idx < in_list.len() {
                self.graph.source(in_list[cont.in_idx])
            } else {
                SENTINEL
            };
            let outv = if cont.out_idx < out_list.len() {
                self.graph.target(out_list[cont.out_idx])
            } else {
                SENTINEL
            };
            if !cont.cur_locked && lvid < inv && lvid < outv {
                cont.cur_locked = true;
                if !self.issue_deferred_lock(lvid, tag, central) {
                    return WalkOutcome::Blocked;
                }
            } else if inv < outv {
                cont.in_idx += 1;
                if !self.issue_deferred_lock(inv, tag, adjacent) {
                    return WalkOutcome::Blocked;
                }
            } else if outv < inv {
                cont.out_idx += 1;
                if !self.issue_deferred_lock(outv, tag, adjacent) {
                    return WalkOutcome::Blocked;
                }
            } else {
                cont.in_idx += 1;
                cont.out_idx += 1;
                if !self.issue_deferred_lock(inv, tag, adjacent) {
                    return WalkOutcome::Blocked;
                }
            }
        }
        if !cont.cur_locked {
            cont.cur_locked = true;
            if !self.issue_deferred_lock(lvid, tag, central) {
                return WalkOutcome::Blocked;
            }
        }
        WalkOutcome::Complete {
            src: cont.src_proc,
            outer_tag: cont.outer_tag,
        }
    }

    /// Issues one deferred lock. Returns `true` when granted inline;
    /// `false` means the request is queued, and by the time the grant
    /// callback fires the continuation may already be gone from under
    /// the caller — it must not touch the record after this.
    fn issue_deferred_lock(&self, lvid: LocalVid, tag: usize, kind: LockKind) -> bool {
        if self.graph.lvid_is_ghost(lvid) {
            return true;
        }
        trace!(
            proc = self.procid(),
            gvid = self.graph.local_to_global(lvid),
            ?kind,
            "lock.issue"
        );
        match kind {
            LockKind::None => true,
            LockKind::Read => self.locks[lvid as usize].try_read(Request {
                tag,
                kind: LockKind::Read,
            }),
            LockKind::Write => self.locks[lvid as usize].try_write(Request {
                tag,
                kind: LockKind::Write,
            }),
        }
    }

    fn partial_unlock_local(&self, gvid: GlobalVid, scope: ScopeKind) {
        let lvid = self.graph.global_to_local(gvid).expect("vertex present");
        let mut granted = Vec::new();
        self.for_each_scope_member(lvid, scope, |member, kind| {
            if self.graph.lvid_is_ghost(member) {
                return;
            }
            match kind {
                LockKind::None => {}
                LockKind::Read => granted.extend(self.locks[member as usize].release_read()),
                LockKind::Write => granted.extend(self.locks[member as usize].release_write()),
            }
        });
        for req in granted {
            self.continue_partial_lock(req.tag);
        }
    }

    /// Enumerates the scope's local members in walk order with the
    /// lock kind each one was acquired with.
    fn for_each_scope_member(
        &self,
        lvid: LocalVid,
        scope: ScopeKind,
        mut f: impl FnMut(LocalVid, LockKind),
    ) {
        let central = scope.central_lock();
        if !scope.locks_adjacent() {
            f(lvid, central);
            return;
        }
        let adjacent = scope.adjacent_lock();
        let in_list = self.graph.in_edge_ids(lvid);
        let out_list = self.graph.out_edge_ids(lvid);
        let (mut in_idx, mut out_idx) = (0usize, 0usize);
        let mut center_done = false;
        while in_idx < in_list.len() || out_idx < out_list.len() {
            let inv = if in_idx < in_list.len() {
                self.graph.source(in_list[in_idx])
            } else {
                SENTINEL
            };
            let outv = if out_idx < out_list.len() {
                self.graph.target(out_list[out_idx])
            } else {
                SENTINEL
            };
            if !center_done && lvid < inv && lvid < outv {
                center_done = true;
                f(lvid, central);
            } else if inv < outv {
                in_idx += 1;
                f(inv, adjacent);
            } else if outv < inv {
                out_idx += 1;
                f(outv, adjacent);
            } else {
                in_idx += 1;
                out_idx += 1;
                f(inv, adjacent);
            }
        }
        if !center_done {
            f(lvid, central);
        }
    }

    #[cfg(test)]
    fn pending_continuations(&self) -> (usize, usize) {
        (
            self.scope_conts.lock().len(),
            self.partial_conts.lock().len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::rpc::transport::Cluster;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// A path 0 - 1 - 2 - 3 with all vertices on one machine.
    fn local_path_manager(cluster: &Cluster) -> Arc<GraphLockManager<u32, ()>> {
        let mut builder = GraphBuilder::new();
        for gvid in 0..4 {
            builder.add_vertex_on(gvid, 0u32, 0);
        }
        builder.add_edge(0, 1, ()).add_edge(1, 2, ()).add_edge(2, 3, ());
        let graph = Arc::new(builder.build(0, 1).unwrap());
        GraphLockManager::new(&cluster.proc(0), graph)
    }

    #[test]
    fn null_scope_invokes_handler_immediately() {
        let cluster = Cluster::new(1);
        let mgr = local_path_manager(&cluster);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        mgr.scope_request(2, ScopeKind::Null, move |gvid| {
            assert_eq!(gvid, 2);
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(mgr.pending_continuations(), (0, 0));
        cluster.shutdown();
    }

    #[test]
    fn uncontended_scope_grants_synchronously() {
        let cluster = Cluster::new(1);
        let mgr = local_path_manager(&cluster);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        mgr.scope_request(1, ScopeKind::FullConsistency, move |_| {
            fired2.store(true, Ordering::SeqCst);
        });
        // Everything is local and free: granted on the caller's stack.
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(mgr.pending_continuations(), (0, 0));
        mgr.scope_unlock(1, ScopeKind::FullConsistency);
        cluster.shutdown();
    }

    #[test]
    fn zero_neighbor_vertex_locks_center_only() {
        let cluster = Cluster::new(1);
        let mut builder: GraphBuilder<(), ()> = GraphBuilder::new();
        builder.add_vertex_on(7, (), 0);
        let graph = Arc::new(builder.build(0, 1).unwrap());
        let mgr = GraphLockManager::new(&cluster.proc(0), graph);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        mgr.scope_request(7, ScopeKind::EdgeConsistency, move |_| {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
        mgr.scope_unlock(7, ScopeKind::EdgeConsistency);
        cluster.shutdown();
    }

    #[test]
    fn overlapping_scopes_serialize_through_release() {
        let cluster = Cluster::new(1);
        let mgr = local_path_manager(&cluster);
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let first2 = Arc::clone(&first);
        let second2 = Arc::clone(&second);
        mgr.scope_request(1, ScopeKind::FullConsistency, move |_| {
            first2.store(true, Ordering::SeqCst);
        });
        assert!(first.load(Ordering::SeqCst));
        // Scope of 2 shares vertices 1 and 2 with the held scope of 1.
        mgr.scope_request(2, ScopeKind::FullConsistency, move |_| {
            second2.store(true, Ordering::SeqCst);
        });
        assert!(!second.load(Ordering::SeqCst), "must wait for release");
        mgr.scope_unlock(1, ScopeKind::FullConsistency);
        assert!(
            second.load(Ordering::SeqCst),
            "release resumes the blocked walk to completion"
        );
        mgr.scope_unlock(2, ScopeKind::FullConsistency);
        assert_eq!(mgr.pending_continuations(), (0, 0));
        cluster.shutdown();
    }

    #[test]
    fn read_scopes_share_vertices() {
        let cluster = Cluster::new(1);
        let mgr = local_path_manager(&cluster);
        let grants = Arc::new(AtomicUsize::new(0));
        for center in [1u64, 2] {
            let grants2 = Arc::clone(&grants);
            mgr.scope_request(center, ScopeKind::ReadConsistency, move |_| {
                grants2.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Both scopes read-lock the shared vertices, so neither waits.
        assert_eq!(grants.load(Ordering::SeqCst), 2);
        mgr.scope_unlock(1, ScopeKind::ReadConsistency);
        mgr.scope_unlock(2, ScopeKind::ReadConsistency);
        assert_eq!(mgr.pending_continuations(), (0, 0));
        cluster.shutdown();
    }

    #[test]
    fn distributed_scope_spans_replicas() {
        // Vertices 0 (machine 0) and 1 (machine 1) joined by an edge;
        // both machines therefore replicate both vertices.
        let results = Cluster::run(2, |dc| {
            let mut builder = GraphBuilder::new();
            builder.add_vertex_on(0, 0u32, 0);
            builder.add_vertex_on(1, 0u32, 1);
            builder.add_edge(0, 1, ());
            let graph = Arc::new(builder.build(dc.procid(), 2).unwrap());
            let mgr = GraphLockManager::new(&dc, graph);
            dc.full_barrier();
            let my_vertex = dc.procid() as GlobalVid;
            let granted = Arc::new(AtomicBool::new(false));
            let granted2 = Arc::clone(&granted);
            mgr.scope_request(my_vertex, ScopeKind::FullConsistency, move |_| {
                granted2.store(true, Ordering::SeqCst);
            });
            while !granted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_micros(50));
            }
            mgr.scope_unlock(my_vertex, ScopeKind::FullConsistency);
            // Both scopes cover both vertices on both machines, so
            // the grant order serialized somewhere; completion of
            // both requests is the property under test.
            dc.full_barrier();
            let pending = mgr.pending_continuations();
            dc.full_barrier();
            pending
        });
        assert_eq!(results, vec![(0, 0), (0, 0)]);
    }
}
