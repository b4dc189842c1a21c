//! The execution engine.
//!
//! Per machine, the engine owns a scheduler, a fiber pool, per-worker
//! inbound sub-task queues, the per-vertex data locks, cached vertex
//! data hashes, and a cluster-wide termination consensus. Worker
//! fibers pull (vertex, message) pairs from the scheduler, run the
//! user's update program under the vertex lock, and push changed
//! vertex data out to mirrors; sub-tasks spawned by programs fan out
//! to every replica and combine back into a future the spawning fiber
//! parks on.

pub mod context;
pub mod task;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::config::{EngineConfig, LockStrategy, SignalOrder};
use crate::engine::context::Context;
use crate::engine::task::{
    BroadcastTask, MapReduceNeighborsTask, TaskDescriptor, TaskParam, TaskValue, BROADCAST_TASK_ID,
};
use crate::error::Result;
use crate::fiber::{self, FiberGroup, Tid};
use crate::graph::{DistributedGraph, EdgeId, GlobalVid, LocalVid};
use crate::locks::GraphLockManager;
use crate::primitives::hash::{content_hash_of, ContentHash};
use crate::primitives::lazy_deque::LazyDeque;
use crate::rpc::transport::{DistObject, DistributedControl, ReplyHandle};
use crate::rpc::{Consensus, ProcId};
use crate::scheduler::{new_scheduler, Message, Scheduler};

pub trait VertexData: Clone + ContentHash + Send + Sync + 'static {}
impl<T: Clone + ContentHash + Send + Sync + 'static> VertexData for T {}

pub trait EdgeData: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> EdgeData for T {}

/// How a run ended. Quiescence is the only way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    TaskDepletion,
}

pub type UpdateFn<V, E, M> = Arc<dyn Fn(&Context<'_, V, E, M>, &M) + Send + Sync>;

const PING_INTERVAL: Duration = Duration::from_millis(50);

enum EngineMsg<V, M> {
    Signal {
        gvid: GlobalVid,
        msg: M,
    },
    ReceiveTask {
        task_id: u8,
        gvid: GlobalVid,
        vdata: Option<V>,
        param: TaskParam,
        origin: ProcId,
        handle: usize,
    },
    TaskReply {
        handle: usize,
        value: TaskValue,
    },
    SyncVdata {
        gvid: GlobalVid,
        data: V,
    },
    Ping {
        reply: ReplyHandle,
    },
}

struct TaskRecord {
    task_id: u8,
    gvid: GlobalVid,
    param: TaskParam,
    origin: ProcId,
    handle: usize,
}

struct CombinerState {
    count_down: usize,
    acc: Option<TaskValue>,
    task_id: u8,
    param: TaskParam,
    waiter: Tid,
    done: bool,
}

/// Count-down future for one sub-task fan-out. Lives in the engine's
/// stable-id arena; the arena id is the wire handle replies carry.
struct FutureCombiner {
    state: Mutex<CombinerState>,
}

pub struct Engine<V: VertexData, E: EdgeData, M: Message> {
    dc: Arc<DistributedControl>,
    obj: DistObject<EngineMsg<V, M>>,
    graph: Arc<DistributedGraph<V, E>>,
    config: EngineConfig,
    scheduler: Box<dyn Scheduler<M>>,
    lock_manager: Arc<GraphLockManager<V, E>>,
    consensus: Consensus,
    task_types: Mutex<Vec<Option<Arc<dyn TaskDescriptor<V, E, M>>>>>,
    local_tasks: Vec<SegQueue<TaskRecord>>,
    worker_mutexes: Vec<Mutex<()>>,
    vdata_hash: Vec<AtomicU64>,
    futures: Mutex<LazyDeque<Arc<FutureCombiner>>>,
    update_fn: Mutex<Option<UpdateFn<V, E, M>>>,
    finished: AtomicBool,
    active_vthreads: AtomicUsize,
    programs_completed: AtomicU64,
    tasks_completed: AtomicU64,
    pingid: AtomicUsize,
    elapsed: Mutex<Duration>,
}

impl<V: VertexData, E: EdgeData, M: Message> Engine<V, E, M> {
    pub fn new(
        dc: &Arc<DistributedControl>,
        graph: Arc<DistributedGraph<V, E>>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let scheduler =
            new_scheduler::<M>(&config.scheduler, graph.num_local_vertices(), config.ncpus)?;
        // The lock manager registers its receiver object first; the
        // engine's follows. Same constructor order on every machine
        // keeps object ids aligned.
        let lock_manager = GraphLockManager::new(dc, Arc::clone(&graph));
        let num_local = graph.num_local_vertices();
        let ncpus = config.ncpus;
        let engine = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let handler_weak = weak.clone();
            let obj = dc.register(move |src, msg: EngineMsg<V, M>| {
                if let Some(engine) = handler_weak.upgrade() {
                    engine.handle_message(src, msg);
                }
            });
            let mut task_types: Vec<Option<Arc<dyn TaskDescriptor<V, E, M>>>> =
                (0..256).map(|_| None).collect();
            task_types[BROADCAST_TASK_ID as usize] = Some(Arc::new(BroadcastTask));
            Self {
                dc: Arc::clone(dc),
                obj,
                graph,
                scheduler,
                lock_manager,
                consensus: Consensus::new(dc),
                task_types: Mutex::new(task_types),
                local_tasks: (0..ncpus).map(|_| SegQueue::new()).collect(),
                worker_mutexes: (0..ncpus).map(|_| Mutex::new(())).collect(),
                vdata_hash: (0..num_local).map(|_| AtomicU64::new(0)).collect(),
                futures: Mutex::new(LazyDeque::new()),
                update_fn: Mutex::new(None),
                finished: AtomicBool::new(false),
                active_vthreads: AtomicUsize::new(0),
                programs_completed: AtomicU64::new(0),
                tasks_completed: AtomicU64::new(0),
                pingid: AtomicUsize::new(0),
                elapsed: Mutex::new(Duration::ZERO),
                config,
            }
        });
        Ok(engine)
    }

    pub fn graph(&self) -> &Arc<DistributedGraph<V, E>> {
        &self.graph
    }

    /// Registers a map/combine sub-task under `id`. Collective; call
    /// on every machine before `start`.
    pub fn register_map_reduce<T, MapF, CombineF>(
        &self,
        id: u8,
        map: MapF,
        combine: CombineF,
        zero: T,
    ) where
        T: Clone + Send + Sync + 'static,
        MapF: Fn(&V, &E, &V) -> T + Send + Sync + 'static,
        CombineF: Fn(&mut T, T) + Send + Sync + 'static,
    {
        assert!(id != BROADCAST_TASK_ID, "task id {id} is reserved");
        self.dc.barrier();
        self.task_types.lock()[id as usize] = Some(Arc::new(MapReduceNeighborsTask::new(
            Box::new(map),
            Box::new(combine),
            zero,
        )));
    }

    fn task_descriptor(&self, id: u8) -> Arc<dyn TaskDescriptor<V, E, M>> {
        self.task_types.lock()[id as usize]
            .clone()
            .unwrap_or_else(|| panic!("sub-task id {id} is not registered"))
    }

    /// Collective: signals one vertex on whichever machine masters it.
    pub fn signal(&self, gvid: GlobalVid, msg: M) {
        self.dc.barrier();
        if let Some(lvid) = self.graph.global_to_local(gvid) {
            if self.graph.is_master(lvid) {
                self.scheduler.schedule(lvid, msg);
            }
        }
        self.dc.barrier();
    }

    /// Collective: signals every vertex, each on its master machine.
    pub fn signal_all(&self, msg: M, order: SignalOrder) {
        let vtxs: Vec<LocalVid> = (0..self.graph.num_local_own_vertices() as LocalVid).collect();
        self.signal_batch(vtxs, msg, order);
    }

    /// Collective: signals the given vertex set, each on its master.
    pub fn signal_vset(&self, vset: &[GlobalVid], msg: M, order: SignalOrder) {
        let vtxs: Vec<LocalVid> = vset
            .iter()
            .filter_map(|&gvid| self.graph.global_to_local(gvid))
            .filter(|&lvid| self.graph.is_master(lvid))
            .collect();
        self.signal_batch(vtxs, msg, order);
    }

    fn signal_batch(&self, mut vtxs: Vec<LocalVid>, msg: M, order: SignalOrder) {
        match order {
            SignalOrder::Shuffle => vtxs.shuffle(&mut rand::thread_rng()),
            SignalOrder::Ascending => vtxs.sort_unstable(),
        }
        for lvid in vtxs {
            self.scheduler.schedule(lvid, msg.clone());
        }
        self.dc.barrier();
    }

    pub(crate) fn internal_signal(&self, lvid: LocalVid, msg: M) {
        self.scheduler.schedule(lvid, msg);
    }

    /// Runs update programs until the cluster agrees it is out of
    /// work. Collective; returns on every machine together.
    pub fn start<F>(self: &Arc<Self>, update: F) -> ExecutionStatus
    where
        F: Fn(&Context<'_, V, E, M>, &M) + Send + Sync + 'static,
    {
        *self.update_fn.lock() = Some(Arc::new(update));
        self.finished.store(false, Ordering::Release);
        self.programs_completed.store(0, Ordering::Relaxed);
        self.tasks_completed.store(0, Ordering::Relaxed);
        self.consensus.reset();
        self.dc.full_barrier();
        for lvid in 0..self.graph.num_local_vertices() as LocalVid {
            let data = self.graph.vertex_data(lvid).lock();
            self.vdata_hash[lvid as usize].store(content_hash_of(&*data), Ordering::Relaxed);
        }
        self.scheduler.start();
        self.dc.full_barrier();
        info!(
            proc = self.dc.procid(),
            vthreads = self.config.num_vthreads,
            ncpus = self.config.ncpus,
            scheduler = %self.config.scheduler,
            "engine.start"
        );
        let timer = Instant::now();
        let fibers = FiberGroup::new(self.config.ncpus, self.config.fiber_stack_size);
        let mut num_to_spawn = self.config.num_vthreads;
        loop {
            // Account for the program fibers before any executor can
            // observe an empty pool and leave early.
            self.active_vthreads.store(num_to_spawn, Ordering::SeqCst);
            for _ in 0..self.config.ncpus {
                let engine = Arc::clone(self);
                fibers.launch(move || engine.task_exec_start());
            }
            for _ in 0..num_to_spawn {
                let engine = Arc::clone(self);
                fibers.launch(move || engine.vthread_start());
            }
            fibers.join();
            self.consensus.begin_done_critical_section();
            let scheduler_empty = self.scheduler.is_empty();
            let queues_empty = self.local_tasks.iter().all(|q| q.is_empty());
            if !(scheduler_empty && queues_empty) {
                self.consensus.cancel_critical_section();
            } else if self.consensus.end_done_critical_section() {
                break;
            }
            num_to_spawn = self.config.num_vthreads.min(self.scheduler.approx_size());
            debug!(
                proc = self.dc.procid(),
                respawn = num_to_spawn,
                "engine.respawn"
            );
        }
        self.finished.store(true, Ordering::Release);
        *self.elapsed.lock() = timer.elapsed();
        info!(
            proc = self.dc.procid(),
            updates = self.programs_completed.load(Ordering::Relaxed),
            subtasks = self.tasks_completed.load(Ordering::Relaxed),
            "engine.done"
        );
        ExecutionStatus::TaskDepletion
    }

    /// Update programs completed on this machine.
    pub fn num_updates(&self) -> u64 {
        self.programs_completed.load(Ordering::SeqCst)
    }

    /// Sub-task executions performed on this machine for remote
    /// spawners.
    pub fn num_subtasks(&self) -> u64 {
        self.tasks_completed.load(Ordering::SeqCst)
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.lock().as_secs_f64()
    }

    fn vthread_start(self: &Arc<Self>) {
        let update_fn = self
            .update_fn
            .lock()
            .clone()
            .expect("engine started without an update function");
        while !self.finished.load(Ordering::Acquire) {
            self.exec_subtasks(fiber::worker_id());
            let Some((lvid, msg)) = self.scheduler.get_next(fiber::worker_id()) else {
                break;
            };
            if !self.graph.is_master(lvid) {
                // A mirror was signalled locally; the master runs the
                // program, so forward the message to it.
                let owner = self.graph.record(lvid).owner;
                self.obj.remote_call(
                    owner,
                    EngineMsg::Signal {
                        gvid: self.graph.local_to_global(lvid),
                        msg,
                    },
                );
                continue;
            }
            let gvid = self.graph.local_to_global(lvid);
            if let LockStrategy::Scoped(kind) = self.config.lock_strategy {
                self.acquire_scope(gvid, kind);
            }
            let guard = self.spin_lock_vertex(lvid);
            let ctx = Context::new(self, lvid, guard);
            update_fn(&ctx, &msg);
            let guard = ctx.into_guard();
            self.programs_completed.fetch_add(1, Ordering::Relaxed);
            let newhash = content_hash_of(&*guard);
            if newhash != self.vdata_hash[lvid as usize].load(Ordering::Relaxed) {
                self.vdata_hash[lvid as usize].store(newhash, Ordering::Relaxed);
                let data = (*guard).clone();
                for &mirror in &self.graph.record(lvid).mirrors {
                    self.obj.remote_call(
                        mirror,
                        EngineMsg::SyncVdata {
                            gvid,
                            data: data.clone(),
                        },
                    );
                }
            }
            drop(guard);
            if let LockStrategy::Scoped(kind) = self.config.lock_strategy {
                self.lock_manager.scope_unlock(gvid, kind);
            }
        }
        self.active_vthreads.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sub-task executor fiber: drains its worker's inbound queue and
    /// keeps the transport lively with periodic ping probes while any
    /// program fiber is still running.
    fn task_exec_start(self: &Arc<Self>) {
        let started = Instant::now();
        let mut next_ping = PING_INTERVAL;
        loop {
            self.exec_subtasks(fiber::worker_id());
            if self.dc.numprocs() > 1 && started.elapsed() >= next_ping {
                self.ping_someone();
                next_ping = started.elapsed() + PING_INTERVAL;
            }
            fiber::yield_now();
            if self.finished.load(Ordering::Acquire)
                || self.active_vthreads.load(Ordering::SeqCst) == 0
            {
                return;
            }
        }
    }

    fn ping_someone(&self) {
        let nprocs = self.dc.numprocs();
        let mut peer = self.pingid.fetch_add(1, Ordering::Relaxed) % nprocs;
        if peer == self.dc.procid() {
            peer = self.pingid.fetch_add(1, Ordering::Relaxed) % nprocs;
        }
        if peer == self.dc.procid() {
            return;
        }
        let (handle, future) = self.dc.create_future::<()>();
        self.obj.remote_call(peer, EngineMsg::Ping { reply: handle });
        self.dc.flush_all();
        while !future.is_ready() {
            fiber::yield_now();
        }
        future.wait();
    }

    fn exec_subtasks(&self, worker: usize) {
        let Some(_guard) = self.worker_mutexes[worker].try_lock() else {
            return;
        };
        let mut ran_any = false;
        while let Some(task) = self.local_tasks[worker].pop() {
            let descriptor = self.task_descriptor(task.task_id);
            let value = descriptor.exec(self, task.gvid, &task.param);
            self.obj.remote_call(
                task.origin,
                EngineMsg::TaskReply {
                    handle: task.handle,
                    value,
                },
            );
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
            ran_any = true;
        }
        if ran_any {
            // Replies wake parked spawner fibers; don't sit on them
            // until the next flusher tick.
            self.dc.flush_all();
        }
    }

    /// The sub-task fan-out. Entered through [`Context::spawn`] with
    /// the center's data lock parked in `guard_slot`; the lock is
    /// dropped across the fan-out and re-acquired before returning,
    /// so mirror sub-tasks calling back into this vertex cannot
    /// deadlock against us.
    pub(crate) fn spawn_task<'a>(
        &'a self,
        lvid: LocalVid,
        task_id: u8,
        param: TaskParam,
        guard_slot: &mut Option<MutexGuard<'a, V>>,
    ) -> TaskValue {
        let record = self.graph.record(lvid);
        let mirrors = record.mirrors.clone();
        let gvid = record.global_id;
        let combiner = Arc::new(FutureCombiner {
            state: Mutex::new(CombinerState {
                count_down: mirrors.len() + 1,
                acc: None,
                task_id,
                param: Arc::clone(&param),
                waiter: fiber::current_tid(),
                done: false,
            }),
        });
        let handle = self.futures.lock().push_anywhere(Arc::clone(&combiner));
        {
            let guard = guard_slot
                .as_ref()
                .expect("spawn without the vertex lock held");
            // Ship vertex data only when the mirrors' copies are
            // stale, i.e. the hash moved since the last propagation.
            let newhash = content_hash_of(&**guard);
            let vdata = if newhash != self.vdata_hash[lvid as usize].load(Ordering::Relaxed) {
                self.vdata_hash[lvid as usize].store(newhash, Ordering::Relaxed);
                Some((**guard).clone())
            } else {
                None
            };
            for &mirror in &mirrors {
                self.obj.remote_call(
                    mirror,
                    EngineMsg::ReceiveTask {
                        task_id,
                        gvid,
                        vdata: vdata.clone(),
                        param: Arc::clone(&param),
                        origin: self.dc.procid(),
                        handle,
                    },
                );
            }
        }
        *guard_slot = None;
        if !mirrors.is_empty() {
            self.dc.flush_all();
        }
        let descriptor = self.task_descriptor(task_id);
        let local = descriptor.exec(self, gvid, &param);
        self.task_reply(&combiner, local);
        loop {
            let state = combiner.state.lock();
            if state.done {
                break;
            }
            fiber::deschedule_self(state);
        }
        self.futures.lock().erase(handle);
        let value = combiner
            .state
            .lock()
            .acc
            .take()
            .expect("combined sub-task value");
        *guard_slot = Some(self.spin_lock_vertex(lvid));
        value
    }

    fn task_reply_by_handle(&self, handle: usize, value: TaskValue) {
        let combiner = {
            let futures = self.futures.lock();
            Arc::clone(futures.get(handle).expect("reply for an unknown sub-task"))
        };
        self.task_reply(&combiner, value);
    }

    fn task_reply(&self, combiner: &FutureCombiner, value: TaskValue) {
        let mut state = combiner.state.lock();
        assert!(state.count_down > 0, "more replies than replicas");
        state.count_down -= 1;
        let descriptor = self.task_descriptor(state.task_id);
        let param = Arc::clone(&state.param);
        match state.acc.as_mut() {
            Some(acc) => {
                descriptor.combine(acc, value, &param);
            }
            None => state.acc = Some(value),
        }
        if state.count_down == 0 {
            state.done = true;
            let waiter = state.waiter;
            drop(state);
            fiber::schedule_tid(waiter);
        }
    }

    fn acquire_scope(&self, gvid: GlobalVid, kind: crate::locks::ScopeKind) {
        let tid = fiber::current_tid();
        let granted = Arc::new(Mutex::new(false));
        let granted_cb = Arc::clone(&granted);
        self.lock_manager.scope_request(gvid, kind, move |_| {
            *granted_cb.lock() = true;
            fiber::schedule_tid(tid);
        });
        loop {
            let flag = granted.lock();
            if *flag {
                return;
            }
            fiber::deschedule_self(flag);
        }
    }

    fn handle_message(self: &Arc<Self>, _src: ProcId, msg: EngineMsg<V, M>) {
        match msg {
            EngineMsg::Signal { gvid, msg } => {
                let lvid = self
                    .graph
                    .global_to_local(gvid)
                    .expect("signal for an absent vertex");
                self.scheduler.schedule(lvid, msg);
                self.consensus.cancel();
            }
            EngineMsg::ReceiveTask {
                task_id,
                gvid,
                vdata,
                param,
                origin,
                handle,
            } => {
                let lvid = self
                    .graph
                    .global_to_local(gvid)
                    .expect("sub-task for an absent vertex");
                if let Some(data) = vdata {
                    *self.graph.vertex_data(lvid).lock() = data;
                }
                self.local_tasks[lvid as usize % self.config.ncpus].push(TaskRecord {
                    task_id,
                    gvid,
                    param,
                    origin,
                    handle,
                });
                self.consensus.cancel();
            }
            EngineMsg::TaskReply { handle, value } => {
                self.task_reply_by_handle(handle, value);
            }
            EngineMsg::SyncVdata { gvid, data } => {
                let lvid = self
                    .graph
                    .global_to_local(gvid)
                    .expect("sync for an absent vertex");
                *self.graph.vertex_data(lvid).lock() = data;
            }
            EngineMsg::Ping { reply } => {
                self.dc.reply(reply, ());
            }
        }
    }

    fn spin_lock_vertex(&self, lvid: LocalVid) -> MutexGuard<'_, V> {
        loop {
            if let Some(guard) = self.graph.vertex_data(lvid).try_lock() {
                return guard;
            }
            fiber::yield_now();
        }
    }

    pub(crate) fn vertex_snapshot(&self, lvid: LocalVid) -> V {
        (*self.spin_lock_vertex(lvid)).clone()
    }

    /// Snapshots one edge and the neighbor behind it under their
    /// short locks, reusing the already-taken center snapshot.
    pub(crate) fn edge_snapshot(
        &self,
        eid: EdgeId,
        neighbor: LocalVid,
        center: LocalVid,
        center_data: &V,
    ) -> (E, V) {
        let edge = loop {
            if let Some(guard) = self.graph.edge_data(eid).try_lock() {
                break (*guard).clone();
            }
            fiber::yield_now();
        };
        let neighbor_data = if neighbor == center {
            center_data.clone()
        } else {
            self.vertex_snapshot(neighbor)
        };
        (edge, neighbor_data)
    }
}

// The `Any`-typed task payloads keep V and M out of the message
// auto-trait derivation; assert the bounds hold where they matter.
#[allow(dead_code)]
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _engine_msg_is_send<V: VertexData, M: Message>() {
    _assert_send::<EngineMsg<V, M>>();
}
