use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::graph::LocalVid;
use crate::scheduler::{Message, Scheduler};

/// Sweep scheduler. Each worker owns the stride
/// `worker, worker + nworkers, ...` of the vertex range and sweeps it
/// cyclically from wherever its last pickup left off, giving a cheap
/// round-robin-ish order without any queue.
pub struct SweepScheduler<M> {
    nworkers: usize,
    num_vertices: usize,
    flags: Vec<AtomicBool>,
    slots: Vec<Mutex<Option<M>>>,
    cursors: Vec<AtomicUsize>,
    pending: AtomicUsize,
}

impl<M> std::fmt::Debug for SweepScheduler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler").finish_non_exhaustive()
    }
}

impl<M: Message> SweepScheduler<M> {
    pub fn new(num_vertices: usize, nworkers: usize) -> Self {
        let nworkers = nworkers.max(1);
        Self {
            nworkers,
            num_vertices,
            flags: (0..num_vertices).map(|_| AtomicBool::new(false)).collect(),
            slots: (0..num_vertices).map(|_| Mutex::new(None)).collect(),
            cursors: (0..nworkers).map(|_| AtomicUsize::new(0)).collect(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Number of stride positions worker `w` owns.
    fn stride_len(&self, worker: usize) -> usize {
        if worker >= self.num_vertices {
            return 0;
        }
        (self.num_vertices - worker - 1) / self.nworkers + 1
    }
}

impl<M: Message> Scheduler<M> for SweepScheduler<M> {
    fn start(&self) {}

    fn schedule(&self, lvid: LocalVid, msg: M) {
        {
            let mut slot = self.slots[lvid as usize].lock();
            match slot.as_mut() {
                Some(pending) => pending.merge(msg),
                None => *slot = Some(msg),
            }
        }
        if !self.flags[lvid as usize].swap(true, Ordering::AcqRel) {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn get_next(&self, worker: usize) -> Option<(LocalVid, M)> {
        let worker = worker % self.nworkers;
        let len = self.stride_len(worker);
        for _ in 0..len {
            let pos = self.cursors[worker].fetch_add(1, Ordering::Relaxed) % len;
            let lvid = worker + pos * self.nworkers;
            if self.flags[lvid].swap(false, Ordering::AcqRel) {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                if let Some(msg) = self.slots[lvid].lock().take() {
                    return Some((lvid as LocalVid, msg));
                }
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    fn approx_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
