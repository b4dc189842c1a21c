//! The view an update program gets of the engine.

use std::cell::{Ref, RefCell, RefMut};
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::engine::task::{
    BroadcastParam, EdgeDirection, MapReduceParam, TaskParam, TaskValue, BROADCAST_TASK_ID,
};
use crate::engine::{EdgeData, Engine, VertexData};
use crate::graph::GlobalVid;
use crate::scheduler::Message;

/// Program-side handle on the engine, scoped to one invocation on one
/// vertex. The center's data lock is held for the whole invocation
/// and parked inside the context; [`spawn`](Context::spawn) drops and
/// re-acquires it around the fan-out, so a data borrow must not be
/// held across a spawn (checked at runtime).
pub struct Context<'a, V: VertexData, E: EdgeData, M: Message> {
    engine: &'a Engine<V, E, M>,
    lvid: crate::graph::LocalVid,
    guard: RefCell<Option<MutexGuard<'a, V>>>,
}

impl<'a, V: VertexData, E: EdgeData, M: Message> Context<'a, V, E, M> {
    pub(crate) fn new(
        engine: &'a Engine<V, E, M>,
        lvid: crate::graph::LocalVid,
        guard: MutexGuard<'a, V>,
    ) -> Self {
        Self {
            engine,
            lvid,
            guard: RefCell::new(Some(guard)),
        }
    }

    pub(crate) fn into_guard(self) -> MutexGuard<'a, V> {
        self.guard
            .into_inner()
            .expect("vertex lock restored after program")
    }

    /// Global id of the vertex this program runs on.
    pub fn vertex_id(&self) -> GlobalVid {
        self.engine.graph().local_to_global(self.lvid)
    }

    pub fn data(&self) -> Ref<'_, V> {
        Ref::map(self.guard.borrow(), |slot| {
            &**slot.as_ref().expect("vertex data accessed during spawn")
        })
    }

    pub fn data_mut(&self) -> RefMut<'_, V> {
        RefMut::map(self.guard.borrow_mut(), |slot| {
            &mut **slot.as_mut().expect("vertex data accessed during spawn")
        })
    }

    /// Fans a registered sub-task out to every replica of this vertex
    /// and blocks the fiber until all contributions are combined.
    pub fn spawn(&self, task_id: u8, param: TaskParam) -> TaskValue {
        let mut slot = self.guard.borrow_mut();
        self.engine.spawn_task(self.lvid, task_id, param, &mut slot)
    }

    /// Typed map/combine over the neighborhood: the registered map
    /// runs against every replica's local edges in `dir` and the
    /// results reduce to one value.
    pub fn map_reduce<T: Clone + Send + 'static>(&self, task_id: u8, dir: EdgeDirection) -> T {
        let value = self.spawn(task_id, Arc::new(MapReduceParam { dir }));
        *value
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("map-reduce result type mismatch"))
    }

    /// Signals every neighbor in `dir`, on whichever machine owns it,
    /// merging `msg` into pending signals.
    pub fn broadcast_signal(&self, dir: EdgeDirection, msg: M) {
        self.spawn(BROADCAST_TASK_ID, Arc::new(BroadcastParam { dir, msg }));
    }

    /// Signals a vertex present on this machine.
    pub fn signal(&self, gvid: GlobalVid, msg: M) {
        let lvid = self
            .engine
            .graph()
            .global_to_local(gvid)
            .expect("signal target not present on this machine");
        self.engine.internal_signal(lvid, msg);
    }
}
