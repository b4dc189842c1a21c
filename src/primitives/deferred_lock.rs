use std::collections::VecDeque;

use parking_lot::Mutex;

/// Lock mode requested for a single vertex within a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// No lock at all; issued inline as an immediate grant.
    None,
    Read,
    Write,
}

/// A waiting lock request. The tag identifies the continuation to
/// resume once the request is granted; tags are arena ids, never
/// pointers, so they survive the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub tag: usize,
    pub kind: LockKind,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    queue: VecDeque<Request>,
}

/// A read/write lock that never parks a thread. `try_read` and
/// `try_write` either grant inline or queue the request; a release
/// hands back the batch of requests that just became runnable, and the
/// caller resumes each continuation itself.
///
/// Ordering is strictly FIFO: any queued request blocks all later
/// arrivals regardless of kind. The scope protocol's deadlock-freedom
/// argument depends on this single-queue discipline.
#[derive(Default)]
pub struct DeferredRwLock {
    state: Mutex<LockState>,
}

impl DeferredRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the read lock was granted inline. Otherwise
    /// the request is queued and will come back through a release.
    pub fn try_read(&self, req: Request) -> bool {
        debug_assert_eq!(req.kind, LockKind::Read);
        let mut state = self.state.lock();
        if !state.writer && state.queue.is_empty() {
            state.readers += 1;
            true
        } else {
            state.queue.push_back(req);
            false
        }
    }

    /// Returns `true` if the write lock was granted inline.
    pub fn try_write(&self, req: Request) -> bool {
        debug_assert_eq!(req.kind, LockKind::Write);
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 && state.queue.is_empty() {
            state.writer = true;
            true
        } else {
            state.queue.push_back(req);
            false
        }
    }

    /// Releases one reader. The returned requests are now granted; the
    /// lock state already reflects them.
    pub fn release_read(&self) -> Vec<Request> {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0 && !state.writer);
        state.readers -= 1;
        Self::drain_granted(&mut state)
    }

    /// Releases the writer.
    pub fn release_write(&self) -> Vec<Request> {
        let mut state = self.state.lock();
        debug_assert!(state.writer);
        state.writer = false;
        Self::drain_granted(&mut state)
    }

    fn drain_granted(state: &mut LockState) -> Vec<Request> {
        let mut granted = Vec::new();
        if state.writer || state.readers > 0 {
            // A read release with surviving readers grants nothing:
            // the queue head is necessarily a writer, since a read
            // arriving at an empty queue is granted inline.
            return granted;
        }
        match state.queue.front().map(|r| r.kind) {
            Some(LockKind::Write) => {
                let req = state.queue.pop_front().expect("front exists");
                state.writer = true;
                granted.push(req);
            }
            Some(LockKind::Read) => {
                while let Some(front) = state.queue.front() {
                    if front.kind != LockKind::Read {
                        break;
                    }
                    let req = state.queue.pop_front().expect("front exists");
                    state.readers += 1;
                    granted.push(req);
                }
            }
            _ => {}
        }
        granted
    }

    #[cfg(test)]
    fn held(&self) -> (usize, bool, usize) {
        let state = self.state.lock();
        (state.readers, state.writer, state.queue.len())
    }
}
