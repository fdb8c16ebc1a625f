/*
 * Kernel Mutex
 *
 * Ownership-tracking mutex with the POSIX-shaped attribute surface:
 * type (default, normal, errorcheck, recursive, adaptive), protocol
 * (none, priority inheritance, priority ceiling), waiter wake order
 * (FIFO or priority), and a recursion counter.
 *
 * Under priority inheritance, enqueueing a waiter that outranks the
 * owner boosts the owner's scheduling priority to the waiter's; the
 * owner's original priority is cached on the mutex and restored at
 * release. Release transfers ownership directly to the chosen waiter,
 * so the lock is never observably free between owner and successor.
 *
 * Every mutex is registered by id. Timed and canceled waits resolve the
 * id to remove the waiter; the wait-queue is the arbitration point, so
 * a waiter is claimed exactly once - either by release (ownership
 * transfer) or by its timeout/cancel (removal).
 *
 * Internal state sits behind a spinlock taken with interrupts disabled
 * and held only for the ownership bookkeeping; all scheduler calls
 * (boost, block, wake) happen with it released.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use heapless::String;
use spin::Mutex as SpinLock;

use crate::arch::x86_64::interrupts;
use crate::config::{MUTEX_MAX_RECURSION, NAME_MAX};
use crate::errno::{Errno, Result};
use crate::sched::{self, ThreadId, WaitStatus, WaitTarget};
use crate::time::timer;

/// Stable mutex handle, usable from timer and cancellation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MutexId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    Default,
    Normal,
    ErrorCheck,
    Recursive,
    /// Briefly spins before blocking; otherwise behaves like Default.
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    /// Priority inheritance.
    Inherit,
    /// Priority ceiling.
    Protect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOrder {
    Fifo,
    Priority,
}

#[derive(Debug, Clone)]
pub struct MutexAttr {
    pub name: &'static str,
    pub mutex_type: MutexType,
    pub protocol: MutexProtocol,
    /// Ceiling priority; meaningful with MutexProtocol::Protect.
    pub ceiling: u8,
    pub order: WakeOrder,
    pub robust: bool,
}

impl Default for MutexAttr {
    fn default() -> MutexAttr {
        MutexAttr {
            name: "mutex",
            mutex_type: MutexType::Default,
            protocol: MutexProtocol::None,
            ceiling: 0,
            order: WakeOrder::Fifo,
            robust: false,
        }
    }
}

struct MutexState {
    owner: Option<ThreadId>,
    /// Owner's pre-boost priority, restored at release.
    owner_orig_priority: Option<u8>,
    recursion: u32,
    /// (waiter, priority at enqueue). Priority order keeps this sorted
    /// descending, so the front is always the wake candidate.
    waiters: Vec<(ThreadId, u8)>,
    /// Cached highest-priority waiter.
    best_waiter: Option<ThreadId>,
}

struct MutexObject {
    id: MutexId,
    name: String<NAME_MAX>,
    attr: MutexAttr,
    state: SpinLock<MutexState>,
}

impl MutexObject {
    /// Run a closure against the state with interrupts disabled; the
    /// lock is interrupt-safe because timeout handlers take it too.
    fn with_state<R>(&self, f: impl FnOnce(&mut MutexState) -> R) -> R {
        interrupts::without_interrupts(|| {
            let mut state = self.state.lock();
            f(&mut state)
        })
    }
}

impl MutexState {
    fn insert_waiter(&mut self, tid: ThreadId, prio: u8, order: WakeOrder) {
        match order {
            WakeOrder::Fifo => self.waiters.push((tid, prio)),
            WakeOrder::Priority => {
                let pos = self
                    .waiters
                    .iter()
                    .position(|&(_, p)| p < prio)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(pos, (tid, prio));
            }
        }
        self.refresh_best_waiter();
    }

    fn remove_waiter(&mut self, tid: ThreadId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&(t, _)| t != tid);
        let removed = self.waiters.len() != before;
        if removed {
            self.refresh_best_waiter();
        }
        removed
    }

    fn refresh_best_waiter(&mut self) {
        self.best_waiter = self
            .waiters
            .iter()
            .max_by_key(|&&(_, p)| p)
            .map(|&(t, _)| t);
    }

    fn best_waiter_priority(&self) -> Option<u8> {
        self.waiters.iter().map(|&(_, p)| p).max()
    }
}

static MUTEXES: SpinLock<BTreeMap<u64, Arc<MutexObject>>> = SpinLock::new(BTreeMap::new());
static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

fn registry_get(id: MutexId) -> Option<Arc<MutexObject>> {
    interrupts::without_interrupts(|| MUTEXES.lock().get(&id.0).cloned())
}

/// A kernel mutex handle. Clones refer to the same mutex.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexObject>,
}

impl Mutex {
    /// Create and register a mutex.
    pub fn new(attr: MutexAttr) -> Mutex {
        let id = MutexId(NEXT_MUTEX_ID.fetch_add(1, Ordering::SeqCst));
        let mut name: String<NAME_MAX> = String::new();
        let _ = name.push_str(attr.name);
        let inner = Arc::new(MutexObject {
            id,
            name,
            attr,
            state: SpinLock::new(MutexState {
                owner: None,
                owner_orig_priority: None,
                recursion: 0,
                waiters: Vec::new(),
                best_waiter: None,
            }),
        });
        interrupts::without_interrupts(|| {
            MUTEXES.lock().insert(id.0, inner.clone());
        });
        Mutex { inner }
    }

    pub fn id(&self) -> MutexId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Unregister the mutex. Fails with Busy while owned or waited on.
    pub fn destroy(self) -> Result<()> {
        let live = self
            .inner
            .with_state(|s| s.owner.is_some() || !s.waiters.is_empty());
        if live {
            return Err(Errno::Busy);
        }
        interrupts::without_interrupts(|| {
            MUTEXES.lock().remove(&self.inner.id.0);
        });
        Ok(())
    }

    /// Acquire the mutex, blocking until ownership arrives.
    pub fn lock(&self) -> Result<()> {
        self.lock_common(None)
    }

    /// Acquire with an absolute wall-clock deadline in nanoseconds.
    pub fn timedlock(&self, abstime_ns: u64) -> Result<()> {
        self.lock_common(Some(abstime_ns))
    }

    /// Acquire without blocking.
    pub fn trylock(&self) -> Result<()> {
        let me = sched::current();
        let attr = &self.inner.attr;
        let outcome = self.inner.with_state(|s| {
            match s.owner {
                None => {
                    s.owner = Some(me);
                    s.recursion = 1;
                    Ok(true)
                }
                Some(owner) if owner == me => match attr.mutex_type {
                    MutexType::Recursive => {
                        if s.recursion >= MUTEX_MAX_RECURSION {
                            Err(Errno::WouldBlock)
                        } else {
                            s.recursion += 1;
                            Ok(false)
                        }
                    }
                    _ => Err(Errno::WouldBlock),
                },
                Some(_) => Err(Errno::WouldBlock),
            }
        });
        match outcome {
            Ok(first) => {
                if first {
                    self.after_acquire(me);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the mutex. Ownership moves directly to the chosen waiter.
    pub fn unlock(&self) -> Result<()> {
        let me = sched::current();
        let attr = self.inner.attr.clone();

        enum Release {
            NotOwner,
            StillHeld,
            Done {
                next: Option<ThreadId>,
                restore: Option<u8>,
                boost_next: Option<(ThreadId, u8)>,
            },
        }

        let release = self.inner.with_state(|s| {
            if s.owner != Some(me) {
                return Release::NotOwner;
            }
            s.recursion -= 1;
            if s.recursion > 0 {
                return Release::StillHeld;
            }

            let restore = s.owner_orig_priority.take();
            match s.waiters.first().copied() {
                Some((next, next_prio)) => {
                    s.waiters.remove(0);
                    s.owner = Some(next);
                    s.recursion = 1;
                    s.refresh_best_waiter();
                    // The successor inherits from whoever still waits.
                    let boost_next = match attr.protocol {
                        MutexProtocol::Inherit => match s.best_waiter_priority() {
                            Some(p) if p > next_prio => {
                                s.owner_orig_priority = Some(next_prio);
                                Some((next, p))
                            }
                            _ => None,
                        },
                        _ => None,
                    };
                    Release::Done {
                        next: Some(next),
                        restore,
                        boost_next,
                    }
                }
                None => {
                    s.owner = None;
                    Release::Done {
                        next: None,
                        restore,
                        boost_next: None,
                    }
                }
            }
        });

        match release {
            Release::NotOwner => {
                if attr.mutex_type != MutexType::ErrorCheck {
                    log::warn!("mutex '{}': unlock by non-owner {}", self.name(), me);
                }
                Err(Errno::NotOwner)
            }
            Release::StillHeld => Ok(()),
            Release::Done {
                next,
                restore,
                boost_next,
            } => {
                sched::note_mutex_released(me, self.inner.id);
                if let Some(orig) = restore {
                    let _ = sched::set_thread_priority(me, orig);
                }
                if let Some((tid, prio)) = boost_next {
                    let _ = sched::set_thread_priority(tid, prio);
                }
                if let Some(next) = next {
                    sched::note_mutex_acquired(next, self.inner.id);
                    sched::wake(
                        next,
                        WaitStatus::Woken,
                        Some(WaitTarget::Mutex(self.inner.id)),
                    );
                }
                Ok(())
            }
        }
    }

    /// Ceiling bookkeeping after a fresh acquisition.
    fn after_acquire(&self, me: ThreadId) {
        sched::note_mutex_acquired(me, self.inner.id);
        if self.inner.attr.protocol == MutexProtocol::Protect {
            if let Ok(my_prio) = sched::thread_priority(me) {
                let ceiling = self.inner.attr.ceiling;
                if ceiling > my_prio {
                    self.inner.with_state(|s| {
                        if s.owner_orig_priority.is_none() {
                            s.owner_orig_priority = Some(my_prio);
                        }
                    });
                    let _ = sched::set_thread_priority(me, ceiling);
                }
            }
        }
    }

    fn lock_common(&self, deadline_ns: Option<u64>) -> Result<()> {
        let me = sched::current();
        let attr = self.inner.attr.clone();

        if attr.mutex_type == MutexType::Adaptive {
            // Short optimistic spin; the owner may be mid-release on
            // another CPU.
            for _ in 0..100 {
                if self.inner.with_state(|s| s.owner.is_none()) {
                    break;
                }
                core::hint::spin_loop();
            }
        }

        loop {
            enum Step {
                Acquired { first: bool },
                Blocked { boost: Option<(ThreadId, u8)> },
                Retry,
                Fail(Errno),
            }

            let my_prio = sched::thread_priority(me).unwrap_or(0);

            // Owner snapshot first: its priority cannot be read while
            // the state lock is held (lock order), so the enqueue phase
            // revalidates the owner afterwards.
            let snapshot = self.inner.with_state(|s| s.owner);
            let owner_prio = match snapshot {
                Some(owner) if owner != me => sched::thread_priority(owner).unwrap_or(0),
                _ => 0,
            };

            // Armed before touching the wait queue: the instant the
            // state lock drops, a release may claim and wake us.
            sched::prepare_wait(WaitTarget::Mutex(self.inner.id));

            let step = self.inner.with_state(|s| match s.owner {
                None => {
                    s.owner = Some(me);
                    s.recursion = 1;
                    Step::Acquired { first: true }
                }
                Some(owner) if owner == me => match attr.mutex_type {
                    MutexType::Recursive => {
                        if s.recursion >= MUTEX_MAX_RECURSION {
                            Step::Fail(Errno::WouldBlock)
                        } else {
                            s.recursion += 1;
                            Step::Acquired { first: false }
                        }
                    }
                    MutexType::ErrorCheck => Step::Fail(Errno::Deadlock),
                    // Normal/Default self-deadlock: the thread parks on
                    // its own wait queue forever.
                    _ => {
                        s.insert_waiter(me, my_prio, attr.order);
                        Step::Blocked { boost: None }
                    }
                },
                Some(owner) => {
                    if snapshot != Some(owner) {
                        // Ownership moved while we sampled priorities;
                        // the boost decision is stale, start over.
                        return Step::Retry;
                    }
                    s.insert_waiter(me, my_prio, attr.order);
                    let boost = if attr.protocol == MutexProtocol::Inherit
                        && my_prio > owner_prio
                    {
                        if s.owner_orig_priority.is_none() {
                            s.owner_orig_priority = Some(owner_prio);
                        }
                        Some((owner, my_prio))
                    } else {
                        None
                    };
                    Step::Blocked { boost }
                }
            });

            match step {
                Step::Acquired { first } => {
                    sched::cancel_wait();
                    if first {
                        self.after_acquire(me);
                    }
                    return Ok(());
                }
                Step::Retry => {
                    sched::cancel_wait();
                    continue;
                }
                Step::Fail(e) => {
                    sched::cancel_wait();
                    return Err(e);
                }
                Step::Blocked { boost } => {
                    if let Some((owner, prio)) = boost {
                        // The boosted owner is re-queued at its new
                        // priority so scheduling reflects it at once.
                        let _ = sched::set_thread_priority(owner, prio);
                    }

                    let timer_id = deadline_ns.map(|abs| {
                        timer::timer_add(abs, 0, mutex_wait_timeout, me.0 as usize)
                    });

                    sched::block_and_yield();
                    let status = sched::take_wait_status();

                    if let Some(timer_id) = timer_id {
                        let _ = timer::timer_remove(timer_id);
                    }

                    match status {
                        // Release handed us ownership.
                        WaitStatus::Woken => return Ok(()),
                        WaitStatus::TimedOut => return Err(Errno::Timeout),
                        WaitStatus::Interrupted => return Err(Errno::Interrupted),
                        WaitStatus::None => {
                            // Spurious; make sure we are off the queue
                            // before trying again.
                            self.inner.with_state(|s| {
                                s.remove_waiter(me);
                            });
                            continue;
                        }
                    }
                }
            }
        }
    }
}

/// Timeout handler for timedlock: claim the waiter off the queue, then
/// wake it with Timeout. Runs in interrupt context.
fn mutex_wait_timeout(arg: usize, _missed: u64) {
    let tid = ThreadId(arg as u64);
    let Some(WaitTarget::Mutex(mid)) = sched::wait_target_of(tid) else {
        return;
    };
    interrupt_waiter(mid, tid, WaitStatus::TimedOut);
}

/// Remove a waiter from a mutex's queue and wake it with `status`.
/// Used by timeouts and cancellation. The removal is the claim: if the
/// release path already popped the waiter, this does nothing.
pub(crate) fn interrupt_waiter(mid: MutexId, tid: ThreadId, status: WaitStatus) {
    let Some(mutex) = registry_get(mid) else {
        return;
    };
    let removed = mutex.with_state(|s| s.remove_waiter(tid));
    if removed {
        sched::wake(tid, status, Some(WaitTarget::Mutex(mid)));
    }
}

/// Number of registered mutexes, for diagnostics.
pub fn registered_count() -> usize {
    interrupts::without_interrupts(|| MUTEXES.lock().len())
}
