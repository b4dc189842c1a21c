//! Cooperative fiber pool.
//!
//! Fibers here are light OS threads with a small configurable stack,
//! exposing the cooperative surface the engine is written against:
//! launch into a group, yield, park under an external mutex, wake by
//! tid, join the group. Wakes use park tokens, so a `schedule_tid`
//! that races ahead of the corresponding `deschedule_self` is never
//! lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Fiber id. Dense, process-wide, never zero for a live fiber; zero
/// means "not a fiber" (e.g. the launching thread).
pub type Tid = u64;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<Tid, Thread>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Tid, Thread>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

thread_local! {
    static CURRENT: std::cell::Cell<(Tid, usize)> = const { std::cell::Cell::new((0, 0)) };
}

/// The calling fiber's id, or 0 when called off a fiber.
pub fn current_tid() -> Tid {
    CURRENT.with(|c| c.get().0)
}

/// Worker lane of the calling fiber: tid modulo the group's worker
/// count. Used to hash per-worker queues and locks.
pub fn worker_id() -> usize {
    CURRENT.with(|c| c.get().1)
}

/// Cooperatively gives up the processor.
pub fn yield_now() {
    thread::yield_now();
}

/// Marks fiber `tid` runnable. A no-op for exited or unknown fibers.
pub fn schedule_tid(tid: Tid) {
    let handle = registry().lock().get(&tid).cloned();
    if let Some(handle) = handle {
        handle.unpark();
    }
}

/// Atomically releases `guard` and parks the calling fiber until some
/// other fiber calls [`schedule_tid`] for it. May wake spuriously;
/// callers re-check their condition under the relocked mutex.
pub fn deschedule_self<T>(guard: MutexGuard<'_, T>) {
    drop(guard);
    thread::park();
}

struct GroupState {
    active: usize,
}

struct GroupInner {
    nworkers: usize,
    stack_size: usize,
    state: Mutex<GroupState>,
    exited: Condvar,
    created: AtomicU64,
}

/// A join group of fibers sharing a worker-lane count and stack size.
pub struct FiberGroup {
    inner: Arc<GroupInner>,
}

impl FiberGroup {
    pub fn new(nworkers: usize, stack_size: usize) -> Self {
        assert!(nworkers > 0, "fiber group needs at least one worker");
        Self {
            inner: Arc::new(GroupInner {
                nworkers,
                stack_size,
                state: Mutex::new(GroupState { active: 0 }),
                exited: Condvar::new(),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a fiber running `f`. The fiber is counted in the group
    /// before this returns, so an immediate [`join`](Self::join) will
    /// wait for it.
    pub fn launch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        let worker = (tid as usize) % self.inner.nworkers;
        self.inner.state.lock().active += 1;
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("fiber-{tid}"))
            .stack_size(self.inner.stack_size)
            .spawn(move || {
                CURRENT.with(|c| c.set((tid, worker)));
                registry().lock().insert(tid, thread::current());
                f();
                registry().lock().remove(&tid);
                let mut state = inner.state.lock();
                state.active -= 1;
                if state.active == 0 {
                    inner.exited.notify_all();
                }
            })
            .expect("failed to spawn fiber");
    }

    /// Blocks until every fiber launched into this group has exited.
    pub fn join(&self) {
        let mut state = self.inner.state.lock();
        while state.active > 0 {
            self.inner.exited.wait(&mut state);
        }
    }

    pub fn num_workers(&self) -> usize {
        self.inner.nworkers
    }

    /// Total fibers ever launched into this group.
    pub fn total_created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FibPromise {
        lock: Mutex<()>,
        argument: u64,
        result: Mutex<Option<u64>>,
        parent_tid: Tid,
    }

    fn fibonacci(group: Arc<FiberGroup>, promise: Arc<FibPromise>) {
        let result = if promise.argument <= 2 {
            1
        } else {
            let left = Arc::new(FibPromise {
                lock: Mutex::new(()),
                argument: promise.argument - 1,
                result: Mutex::new(None),
                parent_tid: current_tid(),
            });
            let right = Arc::new(FibPromise {
                lock: Mutex::new(()),
                argument: promise.argument - 2,
                result: Mutex::new(None),
                parent_tid: current_tid(),
            });
            for child in [Arc::clone(&left), Arc::clone(&right)] {
                let g = Arc::clone(&group);
                group.launch(move || fibonacci(g, child));
            }
            loop {
                let l = left.result.lock().clone();
                let r = right.result.lock().clone();
                if let (Some(l), Some(r)) = (l, r) {
                    break l + r;
                }
                let guard = promise.lock.lock();
                // Re-check under the lock before parking so a wake
                // between the reads above and here is not lost.
                if left.result.lock().is_some() && right.result.lock().is_some() {
                    continue;
                }
                deschedule_self(guard);
            }
        };
        *promise.result.lock() = Some(result);
        if promise.parent_tid != 0 {
            schedule_tid(promise.parent_tid);
        }
    }

    #[test]
    fn fibonacci_over_fibers() {
        let group = Arc::new(FiberGroup::new(4, 128 * 1024));
        let root = Arc::new(FibPromise {
            lock: Mutex::new(()),
            argument: 16,
            result: Mutex::new(None),
            parent_tid: 0,
        });
        let g = Arc::clone(&group);
        let r = Arc::clone(&root);
        group.launch(move || fibonacci(g, r));
        group.join();
        assert_eq!(*root.result.lock(), Some(987));
        assert!(group.total_created() >= 1);
    }

    #[test]
    fn join_waits_for_all() {
        let group = FiberGroup::new(2, 64 * 1024);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            group.launch(move || {
                yield_now();
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.join();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(group.total_created(), 32);
    }

    #[test]
    fn schedule_before_deschedule_is_not_lost() {
        let group = FiberGroup::new(1, 64 * 1024);
        let ready = Arc::new(Mutex::new(false));
        let waiter_tid = Arc::new(Mutex::new(0));
        let ready2 = Arc::clone(&ready);
        let tid_slot = Arc::clone(&waiter_tid);
        group.launch(move || {
            *tid_slot.lock() = current_tid();
            loop {
                let guard = ready2.lock();
                if *guard {
                    break;
                }
                deschedule_self(guard);
            }
        });
        // Flip the flag and wake, possibly before the waiter parks.
        loop {
            let tid = *waiter_tid.lock();
            if tid != 0 {
                *ready.lock() = true;
                schedule_tid(tid);
                break;
            }
            yield_now();
        }
        group.join();
    }

    #[test]
    fn worker_id_is_stable_per_fiber() {
        let group = FiberGroup::new(3, 64 * 1024);
        let ids = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..9 {
            let ids = Arc::clone(&ids);
            group.launch(move || {
                let w = worker_id();
                yield_now();
                assert_eq!(w, worker_id());
                ids.lock().push(w);
            });
        }
        group.join();
        for &w in ids.lock().iter() {
            assert!(w < 3);
        }
    }
}
