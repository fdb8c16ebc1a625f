/*
 * Priority-Array Run Queue
 *
 * One FIFO queue per priority level plus a best-priority hint and a
 * runnable count, behind the queue's own spinlock. Both scheduling
 * policies store their threads in this shape; what differs between them
 * (placement rules, timeslice accounting) lives in the policy layer.
 *
 * Invariants: `runnable` equals the sum of all per-priority queue
 * lengths, and whenever `runnable > 0`, `best_priority` is the highest
 * numeric priority with a non-empty queue.
 */

use alloc::collections::VecDeque;

use heapless::String;
use spin::Mutex;

use crate::config::{NAME_MAX, SCHED_PRIO_COUNT, SCHED_PRIO_MAX, SCHED_PRIO_MIN};
use crate::sched::thread::ThreadId;

struct RunqInner {
    prio_queues: [VecDeque<ThreadId>; SCHED_PRIO_COUNT],
    best_priority: u8,
    runnable: usize,
}

impl RunqInner {
    /// Recompute the best-priority hint after a removal at `from`.
    fn fix_best(&mut self, from: u8) {
        if self.runnable == 0 {
            self.best_priority = SCHED_PRIO_MIN;
            return;
        }
        let mut prio = from;
        while prio > SCHED_PRIO_MIN && self.prio_queues[prio as usize].is_empty() {
            prio -= 1;
        }
        self.best_priority = prio;
    }

    fn note_enqueue(&mut self, prio: u8) {
        if self.runnable == 0 || prio > self.best_priority {
            self.best_priority = prio;
        }
        self.runnable += 1;
    }
}

pub struct RunQueue {
    name: String<NAME_MAX>,
    inner: Mutex<RunqInner>,
}

impl RunQueue {
    pub fn new(name: &str) -> RunQueue {
        let mut owned: String<NAME_MAX> = String::new();
        let _ = owned.push_str(name);
        RunQueue {
            name: owned,
            inner: Mutex::new(RunqInner {
                prio_queues: core::array::from_fn(|_| VecDeque::new()),
                best_priority: SCHED_PRIO_MIN,
                runnable: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn clamp(prio: u8) -> u8 {
        prio.clamp(SCHED_PRIO_MIN, SCHED_PRIO_MAX)
    }

    /// Enqueue at the tail of the priority's queue (ready-from-blocked,
    /// yield, priority raised).
    pub fn enqueue_tail(&self, tid: ThreadId, prio: u8) {
        let prio = Self::clamp(prio);
        let mut q = self.inner.lock();
        q.prio_queues[prio as usize].push_back(tid);
        q.note_enqueue(prio);
    }

    /// Enqueue at the head of the priority's queue (preempted, priority
    /// lowered).
    pub fn enqueue_head(&self, tid: ThreadId, prio: u8) {
        let prio = Self::clamp(prio);
        let mut q = self.inner.lock();
        q.prio_queues[prio as usize].push_front(tid);
        q.note_enqueue(prio);
    }

    /// Dequeue the best runnable thread: head of the highest-priority
    /// non-empty queue.
    pub fn dequeue(&self) -> Option<(ThreadId, u8)> {
        let mut q = self.inner.lock();
        if q.runnable == 0 {
            return None;
        }
        let start = q.best_priority;
        for prio in (SCHED_PRIO_MIN..=start).rev() {
            if let Some(tid) = q.prio_queues[prio as usize].pop_front() {
                q.runnable -= 1;
                q.fix_best(prio);
                return Some((tid, prio));
            }
        }
        None
    }

    /// Remove a specific thread queued at `prio`. Returns whether it was
    /// found.
    pub fn remove(&self, tid: ThreadId, prio: u8) -> bool {
        let prio = Self::clamp(prio);
        let mut q = self.inner.lock();
        let queue = &mut q.prio_queues[prio as usize];
        let before = queue.len();
        queue.retain(|&t| t != tid);
        if queue.len() == before {
            return false;
        }
        q.runnable -= 1;
        if prio == q.best_priority {
            q.fix_best(prio);
        }
        true
    }

    pub fn runnable(&self) -> usize {
        self.inner.lock().runnable
    }

    /// Best queued priority, None when empty.
    pub fn best_priority(&self) -> Option<u8> {
        let q = self.inner.lock();
        if q.runnable == 0 {
            None
        } else {
            Some(q.best_priority)
        }
    }

    /// Would the best thread here preempt a thread at `against`?
    /// `None` means "nothing is running", which any queued thread beats.
    pub fn preemption_check(&self, against: Option<u8>) -> bool {
        let q = self.inner.lock();
        if q.runnable == 0 {
            return false;
        }
        match against {
            Some(prio) => q.best_priority > prio,
            None => true,
        }
    }

    /// Compare queue heads: does this queue's best outrank `other`'s?
    pub fn head_compare(&self, other: &RunQueue) -> bool {
        let mine = self.best_priority();
        let theirs = other.best_priority();
        match (mine, theirs) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
