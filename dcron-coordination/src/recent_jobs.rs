use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Attempt {
    at: DateTime<Utc>,
    // Insertion order breaks timestamp ties
    seq: u64,
    name: String,
}

#[derive(Default)]
struct Buffer {
    heap: BinaryHeap<Reverse<Attempt>>,
    next_seq: u64,
}

impl Buffer {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(attempt)| attempt.at < cutoff)
        {
            self.heap.pop();
        }
    }
}

/// Job attempts skipped while the node pool was upgrading, kept for replay.
///
/// Attempts older than the window are dropped on every add and drain.
/// Draining yields names in ascending attempt time, one per attempt.
pub struct RecentJobPacker {
    window: TimeDelta,
    buffer: Mutex<Buffer>,
}

impl RecentJobPacker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window.to_std().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn add_job(&self, name: &str, at: DateTime<Utc>) {
        self.add_job_at(name, at, Utc::now());
    }

    /// `add_job` against an explicit clock.
    pub fn add_job_at(&self, name: &str, at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut buffer = self.lock();
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.heap.push(Reverse(Attempt {
            at,
            seq,
            name: name.to_string(),
        }));
        buffer.evict_before(self.cutoff(now));
    }

    pub fn pop_all_jobs(&self) -> Vec<String> {
        self.pop_all_jobs_at(Utc::now())
    }

    /// `pop_all_jobs` against an explicit clock.
    pub fn pop_all_jobs_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut buffer = self.lock();
        buffer.evict_before(self.cutoff(now));

        let mut names = Vec::with_capacity(buffer.heap.len());
        while let Some(Reverse(attempt)) = buffer.heap.pop() {
            names.push(attempt.name);
        }
        names
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }
}
