use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::graph::LocalVid;
use crate::scheduler::{Message, Scheduler};

/// Multi-queue FIFO scheduler. Vertices hash to a worker's queue by
/// `lvid % nworkers`; a worker drains its own queue first and then
/// scans the others, so no pending vertex is stranded on an idle
/// lane.
pub struct FifoScheduler<M> {
    nworkers: usize,
    queues: Vec<Mutex<VecDeque<LocalVid>>>,
    slots: Vec<Mutex<Option<M>>>,
    queued: Vec<AtomicBool>,
    pending: AtomicUsize,
}

impl<M> std::fmt::Debug for FifoScheduler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoScheduler").finish_non_exhaustive()
    }
}

impl<M: Message> FifoScheduler<M> {
    pub fn new(num_vertices: usize, nworkers: usize) -> Self {
        let nworkers = nworkers.max(1);
        Self {
            nworkers,
            queues: (0..nworkers).map(|_| Mutex::new(VecDeque::new())).collect(),
            slots: (0..num_vertices).map(|_| Mutex::new(None)).collect(),
            queued: (0..num_vertices).map(|_| AtomicBool::new(false)).collect(),
            pending: AtomicUsize::new(0),
        }
    }

    fn pop_from(&self, queue_idx: usize) -> Option<(LocalVid, M)> {
        loop {
            let lvid = self.queues[queue_idx].lock().pop_front()?;
            // Clear the flag before taking the slot: a signal landing
            // in between re-queues the vertex, and the stale queue
            // entry it leaves behind is skipped here as empty.
            self.queued[lvid as usize].store(false, Ordering::Release);
            self.pending.fetch_sub(1, Ordering::Relaxed);
            if let Some(msg) = self.slots[lvid as usize].lock().take() {
                return Some((lvid, msg));
            }
        }
    }
}

impl<M: Message> Scheduler<M> for FifoScheduler<M> {
    fn start(&self) {}

    fn schedule(&self, lvid: LocalVid, msg: M) {
        {
            let mut slot = self.slots[lvid as usize].lock();
            match slot.as_mut() {
                Some(pending) => pending.merge(msg),
                None => *slot = Some(msg),
            }
        }
        if !self.queued[lvid as usize].swap(true, Ordering::AcqRel) {
            self.pending.fetch_add(1, Ordering::Relaxed);
            self.queues[lvid as usize % self.nworkers]
                .lock()
                .push_back(lvid);
        }
    }

    fn get_next(&self, worker: usize) -> Option<(LocalVid, M)> {
        for i in 0..self.nworkers {
            let queue_idx = (worker + i) % self.nworkers;
            if let Some(found) = self.pop_from(queue_idx) {
                return Some(found);
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
