//! Distributed quiescence consensus.
//!
//! Each machine, once its fiber pool drains, enters a "done" critical
//! section, re-checks its queues, and then tries to finish. The run
//! ends only when every machine sits in the done state simultaneously
//! with the transport fully drained. Any message arrival cancels the
//! receiving machine's attempt, which in turn prevents cluster-wide
//! completion until that work is absorbed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::rpc::transport::{ClusterShared, DistributedControl, ProcId};

const POLL_INTERVAL: Duration = Duration::from_micros(100);

struct DoneState {
    in_done: Vec<bool>,
    cancelled: Vec<bool>,
    complete: bool,
}

pub(crate) struct ConsensusShared {
    state: Mutex<DoneState>,
    changed: Condvar,
}

impl ConsensusShared {
    pub(crate) fn new(nprocs: usize) -> Self {
        Self {
            state: Mutex::new(DoneState {
                in_done: vec![false; nprocs],
                cancelled: vec![false; nprocs],
                complete: false,
            }),
            changed: Condvar::new(),
        }
    }
}

/// One machine's handle on the cluster-wide consensus. The cluster
/// carries a single consensus instance; the engine is its one user.
pub struct Consensus {
    shared: Arc<ClusterShared>,
    proc: ProcId,
}

impl Consensus {
    pub fn new(dc: &DistributedControl) -> Self {
        Self {
            shared: Arc::clone(dc.shared()),
            proc: dc.procid(),
        }
    }

    /// Collective preparation for a fresh run. Call before the
    /// starting barrier so no machine can observe stale completion.
    pub fn reset(&self) {
        let mut state = self.shared.consensus.state.lock();
        state.complete = false;
        state.in_done.iter_mut().for_each(|f| *f = false);
        state.cancelled.iter_mut().for_each(|f| *f = false);
    }

    /// Called by message handlers after depositing new work: aborts
    /// this machine's completion attempt, if one is pending.
    pub fn cancel(&self) {
        let mut state = self.shared.consensus.state.lock();
        if state.complete {
            return;
        }
        state.cancelled[self.proc] = true;
        state.in_done[self.proc] = false;
        self.shared.consensus.changed.notify_all();
    }

    /// Enters the done critical section. Pending cancellations are
    /// absorbed here: whatever caused them is either already visible
    /// to the caller's queue checks or will cancel again.
    pub fn begin_done_critical_section(&self) {
        let mut state = self.shared.consensus.state.lock();
        state.cancelled[self.proc] = false;
    }

    /// Leaves the critical section without attempting completion
    /// (local queues turned out to be non-empty).
    pub fn cancel_critical_section(&self) {
        let mut state = self.shared.consensus.state.lock();
        state.in_done[self.proc] = false;
        state.cancelled[self.proc] = false;
        self.shared.consensus.changed.notify_all();
    }

    /// Votes that this machine is done, then blocks until either the
    /// whole cluster agrees (returns `true`) or new work arrives
    /// locally (returns `false`).
    pub fn end_done_critical_section(&self) -> bool {
        let mut state = self.shared.consensus.state.lock();
        state.in_done[self.proc] = true;
        self.shared.consensus.changed.notify_all();
        loop {
            if state.complete {
                return true;
            }
            if state.cancelled[self.proc] {
                state.cancelled[self.proc] = false;
                state.in_done[self.proc] = false;
                return false;
            }
            if state.in_done.iter().all(|&d| d) && self.transport_quiescent() {
                state.complete = true;
                debug!(proc = self.proc, "consensus.done");
                self.shared.consensus.changed.notify_all();
                return true;
            }
            // The transport counters are not condvar-signalled, so
            // poll on a short timeout.
            self.shared
                .consensus
                .changed
                .wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// True when every message enqueued anywhere has been dispatched.
    /// An in-flight message either carries work (its handler will
    /// cancel someone) or a reply someone is still waiting for, and
    /// in both cases completion must wait.
    fn transport_quiescent(&self) -> bool {
        self.shared.delivered.load(Ordering::SeqCst) == self.shared.sent.load(Ordering::SeqCst)
    }
}
