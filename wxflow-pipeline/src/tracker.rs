//! Per-consumer pending request tracking.
//!
//! Sources may finish requests in any order. A consumer that needs its results
//! in submission order records every submission here, reports completions as
//! they arrive and drains the queue: [`PendingRequestTracker::drain`] only ever
//! yields a prefix of the submission sequence whose entries are all complete.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use wxflow_core::RequestKey;

/// One submitted request.
#[derive(Debug, Clone)]
pub struct PendingEntry<M> {
    pub request: RequestKey,
    pub available: bool,
    /// Consumer metadata attached at submission.
    pub origin: M,
    /// Submission sequence number, strictly increasing per tracker.
    pub generation: u64,
    pub submitted_at: Instant,
}

impl<M> PendingEntry<M> {
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// FIFO reconciliation of out-of-order completions.
#[derive(Debug)]
pub struct PendingRequestTracker<M> {
    pending: HashSet<RequestKey>,
    queue: VecDeque<PendingEntry<M>>,
    next_generation: u64,
}

impl<M> Default for PendingRequestTracker<M> {
    fn default() -> Self {
        Self {
            pending: HashSet::new(),
            queue: VecDeque::new(),
            next_generation: 0,
        }
    }
}

impl<M> PendingRequestTracker<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission; returns its generation.
    pub fn submit(&mut self, request: RequestKey, origin: M) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.pending.insert(request.clone());
        self.queue.push_back(PendingEntry {
            request,
            available: false,
            origin,
            generation,
            submitted_at: Instant::now(),
        });
        generation
    }

    /// Report a completion. Returns `false` (and changes nothing) if `request`
    /// is not outstanding in this tracker.
    pub fn on_completed(&mut self, request: &RequestKey) -> bool {
        if !self.pending.remove(request) {
            tracing::trace!(request = %request.digest(), "Ignoring completion not pending here");
            return false;
        }
        for entry in self.queue.iter_mut().filter(|e| &e.request == request) {
            entry.available = true;
        }
        true
    }

    /// Pop entries from the head while they are available.
    pub fn drain(&mut self) -> Vec<PendingEntry<M>> {
        let mut drained = Vec::new();
        while self.queue.front().is_some_and(|e| e.available) {
            if let Some(entry) = self.queue.pop_front() {
                tracing::debug!(
                    request = %entry.request.digest(),
                    generation = entry.generation,
                    elapsed_ms = entry.elapsed().as_millis() as u64,
                    "Request delivered"
                );
                drained.push(entry);
            }
        }
        drained
    }

    /// Queued entries, available or not.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a completion for `request` is still expected.
    pub fn is_pending(&self, request: &RequestKey) -> bool {
        self.pending.contains(request)
    }

    /// Number of distinct requests still waiting for a completion.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Generation the next submission will get.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    /// Forget everything. Generations keep counting.
    pub fn clear(&mut self) -> Vec<PendingEntry<M>> {
        self.pending.clear();
        self.queue.drain(..).collect()
    }
}
