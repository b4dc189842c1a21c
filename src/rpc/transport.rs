//! In-process cluster transport.
//!
//! A [`Cluster`] hosts a fixed set of logical machines inside one OS
//! process. Each machine owns a [`DistributedControl`]: typed
//! receiver-bound objects, buffered per-destination sends that flush
//! in batches, a receiver thread that dispatches inbound batches in
//! order, reply futures, and collective barriers. Delivery between a
//! given (source, destination) pair is ordered; everything else races.

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::primitives::lazy_deque::LazyDeque;
use crate::rpc::consensus::ConsensusShared;

/// Machine id within the cluster, dense from zero.
pub type ProcId = usize;

/// Receiver-object id. Assigned in registration order, which must be
/// identical on every machine (the same constructors run in the same
/// order on each).
pub(crate) type ObjId = usize;

type Payload = Box<dyn Any + Send>;
type HandlerFn = dyn Fn(ProcId, Payload) + Send + Sync;

/// Batch size that triggers an inline flush of a destination buffer.
const FLUSH_BATCH: usize = 256;
/// Idle period of the background flusher thread.
const FLUSH_INTERVAL: Duration = Duration::from_micros(100);

struct Envelope {
    src: ProcId,
    obj: ObjId,
    payload: Payload,
}

/// Reply routing for a pending `ReplyFuture`, sent inside request
/// messages and echoed back through [`DistributedControl::reply`].
#[derive(Debug, Clone, Copy)]
pub struct ReplyHandle {
    proc: ProcId,
    future_id: usize,
}

struct ReplyMsg {
    future_id: usize,
    value: Payload,
}

struct FutureCell<R> {
    value: Mutex<Option<R>>,
    ready: Condvar,
}

/// Completion cell for a single expected reply.
pub struct ReplyFuture<R> {
    cell: Arc<FutureCell<R>>,
}

impl<R> ReplyFuture<R> {
    pub fn is_ready(&self) -> bool {
        self.cell.value.lock().is_some()
    }

    /// Blocks the calling thread until the reply arrives. Fibers
    /// should spin on [`is_ready`](Self::is_ready) with yields
    /// instead and call this only once ready.
    pub fn wait(self) -> R {
        let mut value = self.cell.value.lock();
        while value.is_none() {
            self.cell.ready.wait(&mut value);
        }
        value.take().expect("reply present")
    }
}

struct Inbox {
    queue: Mutex<VecDeque<Vec<Envelope>>>,
    available: Condvar,
}

impl Inbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, batch: Vec<Envelope>) {
        self.queue.lock().push_back(batch);
        self.available.notify_one();
    }

    fn pop(&self, shutdown: &AtomicBool) -> Option<Vec<Envelope>> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(batch) = queue.pop_front() {
                return Some(batch);
            }
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            self.available.wait_for(&mut queue, FLUSH_INTERVAL);
        }
    }
}

pub(crate) struct ClusterShared {
    nprocs: usize,
    inboxes: Vec<Inbox>,
    barrier: Barrier,
    pub(crate) sent: AtomicU64,
    pub(crate) delivered: AtomicU64,
    shutdown: AtomicBool,
    pub(crate) consensus: ConsensusShared,
}

/// One machine's endpoint: registration, sends, futures, barriers.
pub struct DistributedControl {
    proc: ProcId,
    shared: Arc<ClusterShared>,
    handlers: Mutex<Vec<Arc<HandlerFn>>>,
    handler_registered: Condvar,
    send_bufs: Vec<Mutex<Vec<Envelope>>>,
    futures: Mutex<LazyDeque<Box<dyn FnOnce(Payload) + Send>>>,
}

impl DistributedControl {
    fn new(proc: ProcId, shared: Arc<ClusterShared>) -> Arc<Self> {
        let send_bufs = (0..shared.nprocs).map(|_| Mutex::new(Vec::new())).collect();
        let dc = Arc::new(Self {
            proc,
            shared,
            handlers: Mutex::new(Vec::new()),
            handler_registered: Condvar::new(),
            send_bufs,
            futures: Mutex::new(LazyDeque::new()),
        });
        // Object 0 is reserved for reply routing on every machine.
        let reply_dc = Arc::downgrade(&dc);
        dc.push_handler(Arc::new(move |_src, payload| {
            let msg = payload
                .downcast::<ReplyMsg>()
                .unwrap_or_else(|_| panic!("object 0 carries only replies"));
            let dc = reply_dc.upgrade().expect("cluster alive while replies in flight");
            let complete = dc
                .futures
                .lock()
                .erase(msg.future_id)
                .expect("reply for unknown future");
            complete(msg.value);
        }));
        dc
    }

    pub fn procid(&self) -> ProcId {
        self.proc
    }

    pub fn numprocs(&self) -> usize {
        self.shared.nprocs
    }

    fn push_handler(&self, handler: Arc<HandlerFn>) -> ObjId {
        let mut handlers = self.handlers.lock();
        handlers.push(handler);
        self.handler_registered.notify_all();
        handlers.len() - 1
    }

    /// Binds a receiver object. The closure runs on the receiver
    /// thread for every message addressed to the returned object; it
    /// must not block for long.
    pub fn register<M, F>(self: &Arc<Self>, f: F) -> DistObject<M>
    where
        M: Send + 'static,
        F: Fn(ProcId, M) + Send + Sync + 'static,
    {
        let handler: Arc<HandlerFn> = Arc::new(move |src, payload| {
            let msg = payload
                .downcast::<M>()
                .unwrap_or_else(|_| panic!("message type confusion on dispatch"));
            f(src, *msg);
        });
        let obj = self.push_handler(handler);
        DistObject {
            dc: Arc::clone(self),
            obj,
            _marker: PhantomData,
        }
    }

    fn enqueue(&self, dst: ProcId, obj: ObjId, payload: Payload) {
        debug_assert!(dst < self.shared.nprocs);
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        let mut buf = self.send_bufs[dst].lock();
        buf.push(Envelope {
            src: self.proc,
            obj,
            payload,
        });
        if buf.len() >= FLUSH_BATCH {
            let batch = std::mem::take(&mut *buf);
            // Push while still holding the buffer lock so batches for
            // one destination enter its inbox in send order.
            self.shared.inboxes[dst].push(batch);
        }
    }

    fn flush_to(&self, dst: ProcId) {
        let mut buf = self.send_bufs[dst].lock();
        if buf.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut *buf);
        self.shared.inboxes[dst].push(batch);
    }

    pub fn flush_all(&self) {
        for dst in 0..self.shared.nprocs {
            self.flush_to(dst);
        }
    }

    /// Allocates a reply future. The handle travels inside a request
    /// message; the responder passes it to [`reply`](Self::reply).
    pub fn create_future<R: Send + 'static>(self: &Arc<Self>) -> (ReplyHandle, ReplyFuture<R>) {
        let cell = Arc::new(FutureCell {
            value: Mutex::new(None),
            ready: Condvar::new(),
        });
        let completion_cell = Arc::clone(&cell);
        let complete: Box<dyn FnOnce(Payload) + Send> = Box::new(move |payload| {
            let value = payload
                .downcast::<R>()
                .unwrap_or_else(|_| panic!("reply type confusion"));
            *completion_cell.value.lock() = Some(*value);
            completion_cell.ready.notify_all();
        });
        let future_id = self.futures.lock().push_anywhere(complete);
        (
            ReplyHandle {
                proc: self.proc,
                future_id,
            },
            ReplyFuture { cell },
        )
    }

    /// Sends `value` back to the future identified by `handle`.
    /// Replies flush immediately; a parked requester should not wait
    /// out a flusher tick.
    pub fn reply<R: Send + 'static>(&self, handle: ReplyHandle, value: R) {
        self.enqueue(
            handle.proc,
            0,
            Box::new(ReplyMsg {
                future_id: handle.future_id,
                value: Box::new(value),
            }),
        );
        self.flush_to(handle.proc);
    }

    /// Collective: waits until every machine arrives.
    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    /// Collective: flushes, then waits until every message sent
    /// anywhere in the cluster has been dispatched, including
    /// cascades sent by handlers along the way.
    pub fn full_barrier(&self) {
        self.flush_all();
        self.shared.barrier.wait();
        while self.shared.delivered.load(Ordering::SeqCst) < self.shared.sent.load(Ordering::SeqCst)
        {
            self.flush_all();
            std::thread::sleep(Duration::from_micros(20));
        }
        self.shared.barrier.wait();
    }

    pub(crate) fn shared(&self) -> &Arc<ClusterShared> {
        &self.shared
    }

    fn receive_loop(self: Arc<Self>) {
        while let Some(batch) = self.shared.inboxes[self.proc].pop(&self.shared.shutdown) {
            trace!(proc = self.proc, len = batch.len(), "rpc.recv.batch");
            for env in batch {
                let handler = {
                    let mut handlers = self.handlers.lock();
                    while handlers.len() <= env.obj {
                        // The peer registered this object before we
                        // did; registration order is the same on all
                        // machines, so ours is imminent.
                        self.handler_registered.wait(&mut handlers);
                    }
                    Arc::clone(&handlers[env.obj])
                };
                handler(env.src, env.payload);
                self.shared.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn flush_loop(self: Arc<Self>) {
        loop {
            std::thread::sleep(FLUSH_INTERVAL);
            self.flush_all();
            if self.shared.shutdown.load(Ordering::Acquire) {
                return;
            }
        }
    }
}

/// A typed handle to a receiver object across the cluster: the
/// `dc_dist_object` of this transport. Cheap to clone.
pub struct DistObject<M: Send + 'static> {
    dc: Arc<DistributedControl>,
    obj: ObjId,
    _marker: PhantomData<fn(M)>,
}

impl<M: Send + 'static> Clone for DistObject<M> {
    fn clone(&self) -> Self {
        Self {
            dc: Arc::clone(&self.dc),
            obj: self.obj,
            _marker: PhantomData,
        }
    }
}

impl<M: Send + 'static> DistObject<M> {
    /// Fire-and-forget call to the peer object on `dst`. Ordered with
    /// respect to other calls from this machine to `dst`.
    pub fn remote_call(&self, dst: ProcId, msg: M) {
        self.dc.enqueue(dst, self.obj, Box::new(msg));
    }

    /// Multicast to several destinations.
    pub fn multicast<I>(&self, dsts: I, msg: M)
    where
        M: Clone,
        I: IntoIterator<Item = ProcId>,
    {
        for dst in dsts {
            self.remote_call(dst, msg.clone());
        }
    }

    pub fn dc(&self) -> &Arc<DistributedControl> {
        &self.dc
    }
}

/// A fixed-membership in-process cluster. Membership is established
/// at construction and never changes, matching the engine's stable
/// membership assumption.
pub struct Cluster {
    procs: Vec<Arc<DistributedControl>>,
    threads: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn new(nprocs: usize) -> Self {
        assert!(nprocs > 0, "cluster needs at least one machine");
        let shared = Arc::new(ClusterShared {
            nprocs,
            inboxes: (0..nprocs).map(|_| Inbox::new()).collect(),
            barrier: Barrier::new(nprocs),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            consensus: ConsensusShared::new(nprocs),
        });
        let procs: Vec<_> = (0..nprocs)
            .map(|p| DistributedControl::new(p, Arc::clone(&shared)))
            .collect();
        let mut threads = Vec::new();
        for dc in &procs {
            let recv = Arc::clone(dc);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("rpc-recv-{}", dc.proc))
                    .spawn(move || recv.receive_loop())
                    .expect("failed to spawn receiver"),
            );
            let flush = Arc::clone(dc);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("rpc-flush-{}", dc.proc))
                    .spawn(move || flush.flush_loop())
                    .expect("failed to spawn flusher"),
            );
        }
        Self { procs, threads }
    }

    pub fn numprocs(&self) -> usize {
        self.procs.len()
    }

    pub fn proc(&self, p: ProcId) -> Arc<DistributedControl> {
        Arc::clone(&self.procs[p])
    }

    /// Runs one closure per machine, each on its own thread, then
    /// drains and stops the transport. Panics in any machine closure
    /// propagate.
    pub fn run<F, R>(nprocs: usize, f: F) -> Vec<R>
    where
        F: Fn(Arc<DistributedControl>) -> R + Send + Sync,
        R: Send,
    {
        let cluster = Self::new(nprocs);
        let results = std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for p in 0..nprocs {
                let dc = cluster.proc(p);
                let f = &f;
                joins.push(scope.spawn(move || f(dc)));
            }
            joins
                .into_iter()
                .map(|j| j.join().expect("machine thread panicked"))
                .collect()
        });
        cluster.shutdown();
        results
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for dc in &self.procs {
            dc.flush_all();
        }
        self.procs[0].shared.shutdown.store(true, Ordering::Release);
        for inbox in &self.procs[0].shared.inboxes {
            inbox.available.notify_one();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn remote_calls_are_delivered_in_order() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let cluster = Cluster::new(2);
        let receiver = cluster.proc(1);
        let _obj_on_1 = receiver.register(move |_src, v: u32| {
            seen2.lock().push(v);
        });
        let sender = cluster.proc(0);
        let sink: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink2 = Arc::clone(&sink);
        let obj_on_0 = sender.register(move |_src, v: u32| {
            sink2.lock().push(v);
        });
        // Same registration order on both machines: object 1 is the
        // u32 sink everywhere.
        for v in 0..600u32 {
            obj_on_0.remote_call(1, v);
        }
        sender.flush_all();
        loop {
            if seen.lock().len() == 600 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let seen = seen.lock();
        assert_eq!(*seen, (0..600).collect::<Vec<_>>());
        cluster.shutdown();
    }

    #[test]
    fn reply_future_roundtrip() {
        let results = Cluster::run(2, |dc| {
            let echo_dc = Arc::clone(&dc);
            let obj = dc.register(move |_src, (x, handle): (u64, ReplyHandle)| {
                echo_dc.reply(handle, x * 2);
            });
            dc.barrier();
            let peer = (dc.procid() + 1) % dc.numprocs();
            let (handle, future) = dc.create_future::<u64>();
            obj.remote_call(peer, (21, handle));
            dc.flush_all();
            let doubled = future.wait();
            dc.barrier();
            doubled
        });
        assert_eq!(results, vec![42, 42]);
    }

    #[test]
    fn full_barrier_drains_cascades() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_outer = Arc::clone(&hits);
        Cluster::run(3, move |dc| {
            let hits = Arc::clone(&hits_outer);
            let relay_slot: Arc<Mutex<Option<DistObject<u32>>>> = Arc::new(Mutex::new(None));
            let relay_for_handler = Arc::clone(&relay_slot);
            let nprocs = dc.numprocs();
            let hits_for_handler = Arc::clone(&hits);
            let obj = dc.register(move |_src, hops: u32| {
                hits_for_handler.fetch_add(1, Ordering::SeqCst);
                if hops > 0 {
                    let relay = relay_for_handler.lock().clone().expect("registered");
                    let next = rand::random::<usize>() % nprocs;
                    relay.remote_call(next, hops - 1);
                }
            });
            *relay_slot.lock() = Some(obj.clone());
            dc.barrier();
            if dc.procid() == 0 {
                obj.remote_call(1, 9);
            }
            dc.full_barrier();
            // Ten dispatches happened somewhere in the cluster before
            // any machine left the barrier.
            assert_eq!(hits.load(Ordering::SeqCst), 10);
        });
    }

    #[test]
    fn multicast_reaches_each_destination_once() {
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
        let counts_outer = Arc::clone(&counts);
        Cluster::run(4, move |dc| {
            let counts = Arc::clone(&counts_outer);
            let me = dc.procid();
            let obj = dc.register(move |_src, ()| {
                counts[me].fetch_add(1, Ordering::SeqCst);
            });
            dc.barrier();
            if dc.procid() == 2 {
                obj.multicast([0, 1, 3], ());
            }
            dc.full_barrier();
        });
        let observed: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(observed, vec![1, 1, 0, 1]);
    }
}
