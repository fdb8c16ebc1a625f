/*
 * Timer Chain and Interval Timers
 *
 * The timer chain is an ordered set of nodes keyed by absolute expiration
 * time in nanoseconds, with a cached earliest key so the common "anything
 * due?" question is O(1). Backing store is a balanced ordered map keyed by
 * (expires, id); the id tiebreak keeps insertion order FIFO among equal
 * expirations and makes every key unique.
 *
 * `process(now)` is called from the global tick. It extracts every node
 * whose expiration has passed and invokes its handler with the chain lock
 * released. Periodic nodes are re-inserted at `expires + interval`; if
 * processing lagged more than one interval, the expiration is advanced by
 * whole intervals until it is in the future and the number of skipped
 * intervals is reported to the handler.
 *
 * Interval timers bind a timer node to one of the three POSIX clock
 * identities. Only the real (wall) clock is wired; the virtual and
 * profiling clocks are reported as unsupported.
 */

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;

use crate::errno::{Errno, Result};
use crate::sched::thread::ThreadId;
use crate::time::counter;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u32 {
        /// Node re-arms itself every `interval` nanoseconds.
        const PERIODIC = 1 << 0;
    }
}

/// Handler invoked on expiry. `missed` counts whole intervals that were
/// skipped while catching up (0 when processing is on time).
pub type TimerHandler = fn(arg: usize, missed: u64);

/// Stable handle of a timer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId(pub u64);

struct TimerNode {
    id: TimerId,
    expires: u64,
    interval: u64,
    flags: TimerFlags,
    handler: TimerHandler,
    arg: usize,
}

/// Chain key: expiration first so map order is expiration order.
type TimerKey = (u64, TimerId);

struct TimerChain {
    tree: BTreeMap<TimerKey, TimerNode>,
    /// id -> current expiration, for O(log n) removal by handle.
    index: BTreeMap<TimerId, u64>,
    /// Cached minimum key of `tree`; None iff the chain is empty.
    earliest: Option<TimerKey>,
    next_id: u64,
}

impl TimerChain {
    const fn new() -> TimerChain {
        TimerChain {
            tree: BTreeMap::new(),
            index: BTreeMap::new(),
            earliest: None,
            next_id: 1,
        }
    }

    fn insert(&mut self, node: TimerNode) {
        let key = (node.expires, node.id);
        self.index.insert(node.id, node.expires);
        self.tree.insert(key, node);
        match self.earliest {
            Some(cur) if cur <= key => {}
            _ => self.earliest = Some(key),
        }
    }

    fn remove_by_id(&mut self, id: TimerId) -> Option<TimerNode> {
        let expires = self.index.remove(&id)?;
        let key = (expires, id);
        let node = self.tree.remove(&key);
        if self.earliest == Some(key) {
            self.earliest = self.tree.keys().next().copied();
        }
        node
    }

    /// Pop the earliest node if it is due at `now`.
    fn pop_due(&mut self, now: u64) -> Option<TimerNode> {
        let key = self.earliest?;
        if key.0 > now {
            return None;
        }
        let node = self.tree.remove(&key)?;
        self.index.remove(&node.id);
        self.earliest = self.tree.keys().next().copied();
        Some(node)
    }
}

static CHAIN: Mutex<TimerChain> = Mutex::new(TimerChain::new());

/// All chain accesses disable interrupts: `process` runs from the tick,
/// and a tick arriving while a thread holds the lock on the same CPU
/// must not spin against it.
fn with_chain<R>(f: impl FnOnce(&mut TimerChain) -> R) -> R {
    crate::arch::x86_64::interrupts::without_interrupts(|| {
        let mut chain = CHAIN.lock();
        f(&mut chain)
    })
}

/// Add a timer node.
///
/// `expires_ns` is absolute wall time; a non-zero `interval_ns` makes the
/// node periodic. Returns the node's handle.
pub fn timer_add(
    expires_ns: u64,
    interval_ns: u64,
    handler: TimerHandler,
    arg: usize,
) -> TimerId {
    with_chain(|chain| {
        let id = TimerId(chain.next_id);
        chain.next_id += 1;

        let flags = if interval_ns != 0 {
            TimerFlags::PERIODIC
        } else {
            TimerFlags::empty()
        };
        chain.insert(TimerNode {
            id,
            expires: expires_ns,
            interval: interval_ns,
            flags,
            handler,
            arg,
        });
        id
    })
}

/// Remove a timer node by handle. `NotFound` if it already fired (one-shot)
/// or was never armed.
pub fn timer_remove(id: TimerId) -> Result<()> {
    with_chain(|chain| match chain.remove_by_id(id) {
        Some(_) => Ok(()),
        None => Err(Errno::NotFound),
    })
}

/// The earliest pending expiration, if any. O(1).
pub fn earliest_expiry() -> Option<u64> {
    with_chain(|chain| chain.earliest.map(|(expires, _)| expires))
}

/// Number of armed nodes.
pub fn armed_count() -> usize {
    with_chain(|chain| chain.tree.len())
}

/// Expire every node due at `now`.
///
/// Handlers run with the chain lock released so they may arm or remove
/// timers themselves. Periodic nodes are re-armed before their handler
/// runs, so a handler removing its own timer sees consistent state.
pub fn process(now: u64) {
    loop {
        let Some((handler, arg, missed)) = with_chain(|chain| {
            let node = chain.pop_due(now)?;

            let handler = node.handler;
            let arg = node.arg;
            let mut missed = 0u64;
            if node.flags.contains(TimerFlags::PERIODIC) && node.interval != 0 {
                let mut next = node.expires + node.interval;
                while next <= now {
                    next += node.interval;
                    missed += 1;
                }
                chain.insert(TimerNode {
                    expires: next,
                    ..node
                });
            }
            Some((handler, arg, missed))
        }) else {
            return;
        };
        handler(arg, missed);
    }
}

/* Interval timers */

/// The three POSIX interval-timer clock identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ITimerClock {
    /// Wall time.
    Real,
    /// Thread running time.
    Virtual,
    /// Thread running time plus scheduler time.
    Prof,
}

/// Initial delay plus repeat interval, both nanoseconds. A zero interval
/// makes the timer one-shot.
#[derive(Debug, Clone, Copy)]
pub struct ITimerVal {
    pub initial_ns: u64,
    pub interval_ns: u64,
}

/// Signal number delivered to the owning thread on expiry of a REAL timer.
pub const SIGALRM: u32 = 14;

struct IntervalTimer {
    clock: ITimerClock,
    value: ITimerVal,
    enabled: bool,
    /// 0 = unlimited.
    remaining_intervals: usize,
    owner: ThreadId,
    handler: Option<TimerHandler>,
    arg: usize,
    node: TimerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ITimerId(pub u64);

static ITIMERS: Mutex<BTreeMap<ITimerId, IntervalTimer>> = Mutex::new(BTreeMap::new());
static NEXT_ITIMER: Mutex<u64> = Mutex::new(1);

/// Same interrupt discipline as the chain: expiry runs from the tick.
fn with_itimers<R>(f: impl FnOnce(&mut BTreeMap<ITimerId, IntervalTimer>) -> R) -> R {
    crate::arch::x86_64::interrupts::without_interrupts(|| {
        let mut itimers = ITIMERS.lock();
        f(&mut itimers)
    })
}

fn itimer_fire(arg: usize, missed: u64) {
    let id = ITimerId(arg as u64);
    let Some((owner, handler, handler_arg, disarm)) = with_itimers(|itimers| {
        let it = itimers.get_mut(&id)?;
        if !it.enabled {
            return None;
        }
        let fired = 1 + missed as usize;
        let mut disarm = false;
        if it.remaining_intervals != 0 {
            it.remaining_intervals = it.remaining_intervals.saturating_sub(fired);
            disarm = it.remaining_intervals == 0;
        }
        if it.value.interval_ns == 0 {
            disarm = true;
        }
        if disarm {
            it.enabled = false;
        }
        Some((it.owner, it.handler, it.arg, disarm))
    }) else {
        return;
    };

    let _ = crate::sched::thread_signal(owner, SIGALRM);
    if let Some(handler) = handler {
        handler(handler_arg, missed);
    }
    if disarm {
        if let Some(it) = with_itimers(|itimers| itimers.remove(&id)) {
            let _ = timer_remove(it.node);
        }
    }
}

/// Arm an interval timer for `owner` on the given clock.
///
/// Only the real clock is backed by hardware; the virtual and profiling
/// clocks are not wired and report `Unsupported`.
pub fn itimer_arm(
    clock: ITimerClock,
    value: ITimerVal,
    repeat_limit: usize,
    owner: ThreadId,
    handler: Option<TimerHandler>,
    arg: usize,
) -> Result<ITimerId> {
    if clock != ITimerClock::Real {
        return Err(Errno::Unsupported);
    }
    if value.initial_ns == 0 {
        return Err(Errno::InvalidArgument);
    }

    let id = crate::arch::x86_64::interrupts::without_interrupts(|| {
        let mut next = NEXT_ITIMER.lock();
        let id = ITimerId(*next);
        *next += 1;
        id
    });

    // Registered before the chain node arms so a first expiry on the
    // next tick already finds the record.
    with_itimers(|itimers| {
        itimers.insert(
            id,
            IntervalTimer {
                clock,
                value,
                enabled: true,
                remaining_intervals: repeat_limit,
                owner,
                handler,
                arg,
                node: TimerId(0),
            },
        );
    });

    let expires = counter::gettime_ns() + value.initial_ns;
    let node = timer_add(expires, value.interval_ns, itimer_fire, id.0 as usize);
    with_itimers(|itimers| {
        if let Some(it) = itimers.get_mut(&id) {
            it.node = node;
        }
    });
    Ok(id)
}

/// Disarm and remove an interval timer.
pub fn itimer_cancel(id: ITimerId) -> Result<()> {
    match with_itimers(|itimers| itimers.remove(&id)) {
        Some(it) => {
            // The chain node may have fired already for a one-shot.
            let _ = timer_remove(it.node);
            Ok(())
        }
        None => Err(Errno::NotFound),
    }
}
