//! Sub-task descriptors.
//!
//! A sub-task is a user-registered map/combine pair fanned out to
//! every replica of a vertex. Results are heterogeneous across task
//! ids, so they cross the wire as opaque `Any` values; the descriptor
//! registered under the task id is the only code that looks inside.

use std::any::Any;
use std::sync::Arc;

use crate::engine::Engine;
use crate::engine::{EdgeData, VertexData};
use crate::graph::GlobalVid;
use crate::scheduler::Message;

/// Parameter attached to a spawn, shared across the fan-out.
pub type TaskParam = Arc<dyn Any + Send + Sync>;

/// Opaque sub-task result. The descriptor's `combine` is the only
/// consumer; a type mismatch there is a fatal programming bug.
pub type TaskValue = Box<dyn Any + Send>;

/// Task id the engine claims for neighborhood broadcast signalling.
pub const BROADCAST_TASK_ID: u8 = 255;

/// Which local edges of the center a task walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    In,
    Out,
    All,
}

pub trait TaskDescriptor<V: VertexData, E: EdgeData, M: Message>: Send + Sync {
    /// Runs the task against this machine's replica of `gvid`,
    /// returning this replica's contribution.
    fn exec(&self, engine: &Engine<V, E, M>, gvid: GlobalVid, param: &TaskParam) -> TaskValue;

    /// Folds `other` into `acc`; both came out of `exec`. Must be
    /// associative and commutative — replies arrive in any order.
    fn combine(&self, acc: &mut TaskValue, other: TaskValue, param: &TaskParam);
}

pub(crate) struct MapReduceParam {
    pub dir: EdgeDirection,
}

/// Map over the center's edges, folding with the user combiner.
///
/// An edge is materialized on the owner of each endpoint, so a
/// replica maps only the edges whose neighbor endpoint it owns:
/// across the fan-out every edge is mapped exactly once, on the
/// machine where the neighbor's data is authoritative. Only the
/// center's data is ever read from a (boundedly stale) ghost.
pub(crate) struct MapReduceNeighborsTask<V, E, T> {
    map: Box<dyn Fn(&V, &E, &V) -> T + Send + Sync>,
    combine: Box<dyn Fn(&mut T, T) + Send + Sync>,
    zero: T,
}

impl<V, E, T> MapReduceNeighborsTask<V, E, T> {
    pub(crate) fn new(
        map: Box<dyn Fn(&V, &E, &V) -> T + Send + Sync>,
        combine: Box<dyn Fn(&mut T, T) + Send + Sync>,
        zero: T,
    ) -> Self {
        Self { map, combine, zero }
    }
}

impl<V, E, M, T> TaskDescriptor<V, E, M> for MapReduceNeighborsTask<V, E, T>
where
    V: VertexData,
    E: EdgeData,
    M: Message,
    T: Clone + Send + Sync + 'static,
{
    fn exec(&self, engine: &Engine<V, E, M>, gvid: GlobalVid, param: &TaskParam) -> TaskValue {
        let dir = param
            .downcast_ref::<MapReduceParam>()
            .expect("map-reduce task spawned with a foreign param")
            .dir;
        let graph = engine.graph();
        let lvid = graph
            .global_to_local(gvid)
            .expect("sub-task on an absent vertex");
        let center = engine.vertex_snapshot(lvid);
        let mut acc = self.zero.clone();
        if matches!(dir, EdgeDirection::In | EdgeDirection::All) {
            for &eid in graph.in_edge_ids(lvid) {
                let source = graph.source(eid);
                if graph.lvid_is_ghost(source) {
                    continue;
                }
                let (edge, neighbor) = engine.edge_snapshot(eid, source, lvid, &center);
                (self.combine)(&mut acc, (self.map)(&center, &edge, &neighbor));
            }
        }
        if matches!(dir, EdgeDirection::Out | EdgeDirection::All) {
            for &eid in graph.out_edge_ids(lvid) {
                let target = graph.target(eid);
                if graph.lvid_is_ghost(target) {
                    continue;
                }
                let (edge, neighbor) = engine.edge_snapshot(eid, target, lvid, &center);
                (self.combine)(&mut acc, (self.map)(&center, &edge, &neighbor));
            }
        }
        Box::new(acc)
    }

    fn combine(&self, acc: &mut TaskValue, other: TaskValue, _param: &TaskParam) {
        let acc = acc
            .downcast_mut::<T>()
            .expect("accumulator type confusion in combine");
        let other = *other
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("reply type confusion in combine"));
        (self.combine)(acc, other);
    }
}

pub(crate) struct BroadcastParam<M> {
    pub dir: EdgeDirection,
    pub msg: M,
}

/// Signals the center's neighbors on every replica. Each replica
/// signals only the neighbors it owns, so every neighbor is signalled
/// exactly once per incident edge cluster-wide.
pub(crate) struct BroadcastTask;

impl<V, E, M> TaskDescriptor<V, E, M> for BroadcastTask
where
    V: VertexData,
    E: EdgeData,
    M: Message,
{
    fn exec(&self, engine: &Engine<V, E, M>, gvid: GlobalVid, param: &TaskParam) -> TaskValue {
        let param = param
            .downcast_ref::<BroadcastParam<M>>()
            .expect("broadcast task spawned with a foreign param");
        let graph = engine.graph();
        let lvid = graph
            .global_to_local(gvid)
            .expect("sub-task on an absent vertex");
        if matches!(param.dir, EdgeDirection::In | EdgeDirection::All) {
            for &eid in graph.in_edge_ids(lvid) {
                let neighbor = graph.source(eid);
                if !graph.lvid_is_ghost(neighbor) {
                    engine.internal_signal(neighbor, param.msg.clone());
                }
            }
        }
        if matches!(param.dir, EdgeDirection::Out | EdgeDirection::All) {
            for &eid in graph.out_edge_ids(lvid) {
                let neighbor = graph.target(eid);
                if !graph.lvid_is_ghost(neighbor) {
                    engine.internal_signal(neighbor, param.msg.clone());
                }
            }
        }
        Box::new(())
    }

    fn combine(&self, _acc: &mut TaskValue, _other: TaskValue, _param: &TaskParam) {}
}
