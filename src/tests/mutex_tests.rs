/*
 * Mutex Tests
 *
 * Recursion, error checking, contention, mutual exclusion under load,
 * priority inheritance, and timed acquisition. The PI scenario follows
 * the classic shape: a low-priority holder is boosted by a blocked
 * high-priority waiter and demoted again at release.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Once;

use super::TestReport;
use crate::config::NSECS_PER_MSEC;
use crate::errno::Errno;
use crate::sched::mutex::{Mutex, MutexAttr, MutexProtocol, MutexType, WakeOrder};
use crate::sched::{self, CpuSet, PolicyId, ThreadAttr, join, sleep_ns, spawn};
use crate::time::counter::gettime_ns;

fn pinned(name: &'static str, policy: PolicyId, priority: u8) -> ThreadAttr {
    ThreadAttr {
        name,
        policy,
        priority,
        affinity: CpuSet::single(0),
        ..ThreadAttr::default()
    }
}

pub fn run(report: &mut TestReport) {
    recursive_counting(report);
    errorcheck_rules(report);
    trylock_contention(report);
    counter_under_mutex(report);
    priority_inheritance(report);
    timedlock_expiry(report);
    destroy_rules(report);
}

fn recursive_counting(report: &mut TestReport) {
    let m = Mutex::new(MutexAttr {
        name: "recursive",
        mutex_type: MutexType::Recursive,
        ..MutexAttr::default()
    });

    let ok = m.lock().is_ok() && m.lock().is_ok() && m.lock().is_ok();
    report.check("recursive mutex nests", ok);

    let ok = m.unlock().is_ok() && m.unlock().is_ok() && m.unlock().is_ok();
    report.check("recursion unwinds to free", ok);

    report.check("fully released mutex destroys", m.destroy().is_ok());
}

static EC_MUTEX: Once<Mutex> = Once::new();

extern "C" fn foreign_unlock_main(_arg: usize) -> usize {
    match EC_MUTEX.get().unwrap().unlock() {
        Err(Errno::NotOwner) => 1,
        _ => 0,
    }
}

fn errorcheck_rules(report: &mut TestReport) {
    let m = EC_MUTEX.call_once(|| {
        Mutex::new(MutexAttr {
            name: "errorcheck",
            mutex_type: MutexType::ErrorCheck,
            ..MutexAttr::default()
        })
    });

    report.check("errorcheck lock succeeds", m.lock().is_ok());
    report.check(
        "errorcheck relock reports deadlock",
        m.lock() == Err(Errno::Deadlock),
    );

    let t = spawn(
        &pinned("foreign-unlock", PolicyId::Rr, 40),
        foreign_unlock_main,
        0,
    )
    .unwrap();
    report.check("unlock by non-owner reports NotOwner", join(t) == Ok(1));

    report.check("owner unlock succeeds", m.unlock().is_ok());
}

static TRY_MUTEX: Once<Mutex> = Once::new();

extern "C" fn trylock_main(_arg: usize) -> usize {
    match TRY_MUTEX.get().unwrap().trylock() {
        Err(Errno::WouldBlock) => 1,
        _ => 0,
    }
}

fn trylock_contention(report: &mut TestReport) {
    let m = TRY_MUTEX.call_once(|| Mutex::new(MutexAttr::default()));

    let _ = m.lock();
    let t = spawn(&pinned("trylock", PolicyId::Rr, 40), trylock_main, 0).unwrap();
    report.check("contended trylock reports WouldBlock", join(t) == Ok(1));
    let _ = m.unlock();

    report.check("free trylock acquires", m.trylock().is_ok());
    let _ = m.unlock();
}

static COUNT_MUTEX: Once<Mutex> = Once::new();
static SHARED_COUNTER: AtomicU64 = AtomicU64::new(0);
const INCREMENTS: u64 = 10_000;

extern "C" fn incrementer_main(_arg: usize) -> usize {
    let m = COUNT_MUTEX.get().unwrap();
    for _ in 0..INCREMENTS {
        if m.lock().is_err() {
            return 0;
        }
        // Split load/store: only mutual exclusion makes this add up.
        let v = SHARED_COUNTER.load(Ordering::Relaxed);
        SHARED_COUNTER.store(v + 1, Ordering::Relaxed);
        let _ = m.unlock();
    }
    1
}

fn counter_under_mutex(report: &mut TestReport) {
    COUNT_MUTEX.call_once(|| {
        Mutex::new(MutexAttr {
            name: "counter",
            mutex_type: MutexType::Recursive,
            ..MutexAttr::default()
        })
    });
    SHARED_COUNTER.store(0, Ordering::SeqCst);

    let mut attr = pinned("incr", PolicyId::Rr, 20);
    attr.time_slice_ms = 5;
    let a = spawn(&attr, incrementer_main, 0).unwrap();
    let b = spawn(&attr, incrementer_main, 1).unwrap();

    let ok = join(a) == Ok(1) && join(b) == Ok(1);
    report.check(
        "two threads increment to exactly 2 x 10000",
        ok && SHARED_COUNTER.load(Ordering::SeqCst) == 2 * INCREMENTS,
    );
}

static PI_MUTEX: Once<Mutex> = Once::new();
static PI_BOOST_SEEN: AtomicBool = AtomicBool::new(false);
static PI_RESTORED: AtomicBool = AtomicBool::new(false);
static PI_H_GOT_LOCK: AtomicBool = AtomicBool::new(false);

const PI_LOW_PRIO: u8 = 10;
const PI_HIGH_PRIO: u8 = 50;

extern "C" fn pi_low_main(_arg: usize) -> usize {
    let m = PI_MUTEX.get().unwrap();
    let me = sched::current();
    if m.lock().is_err() {
        return 0;
    }

    // Spin inside the critical section until the blocked high-priority
    // waiter's inheritance shows up on our own priority.
    let mut safety = 0u64;
    while sched::thread_priority(me) != Ok(PI_HIGH_PRIO) {
        safety += 1;
        if safety > 2_000_000_000 {
            let _ = m.unlock();
            return 0;
        }
    }
    PI_BOOST_SEEN.store(true, Ordering::SeqCst);

    let _ = m.unlock();

    // Release must have put the original priority back.
    if sched::thread_priority(me) == Ok(PI_LOW_PRIO) {
        PI_RESTORED.store(true, Ordering::SeqCst);
    }
    1
}

extern "C" fn pi_high_main(_arg: usize) -> usize {
    let m = PI_MUTEX.get().unwrap();
    if m.lock().is_ok() {
        PI_H_GOT_LOCK.store(true, Ordering::SeqCst);
        let _ = m.unlock();
        1
    } else {
        0
    }
}

fn priority_inheritance(report: &mut TestReport) {
    PI_MUTEX.call_once(|| {
        Mutex::new(MutexAttr {
            name: "pi",
            protocol: MutexProtocol::Inherit,
            order: WakeOrder::Priority,
            ..MutexAttr::default()
        })
    });
    PI_BOOST_SEEN.store(false, Ordering::SeqCst);
    PI_RESTORED.store(false, Ordering::SeqCst);
    PI_H_GOT_LOCK.store(false, Ordering::SeqCst);

    // The low thread acquires while we sleep, then the high thread
    // blocks on it and lends its priority.
    let low = spawn(&pinned("pi-low", PolicyId::Fifo, PI_LOW_PRIO), pi_low_main, 0).unwrap();
    let _ = sleep_ns(20 * NSECS_PER_MSEC);

    let high = spawn(
        &pinned("pi-high", PolicyId::Fifo, PI_HIGH_PRIO),
        pi_high_main,
        0,
    )
    .unwrap();

    let low_ok = join(low) == Ok(1);
    let high_ok = join(high) == Ok(1);

    report.check("PI: holder observes the boosted priority", low_ok && PI_BOOST_SEEN.load(Ordering::SeqCst));
    report.check("PI: priority restored at release", PI_RESTORED.load(Ordering::SeqCst));
    report.check("PI: waiter acquires after release", high_ok && PI_H_GOT_LOCK.load(Ordering::SeqCst));
}

static TIMED_MUTEX: Once<Mutex> = Once::new();

extern "C" fn timed_waiter_main(_arg: usize) -> usize {
    let m = TIMED_MUTEX.get().unwrap();
    let deadline = gettime_ns() + 50 * NSECS_PER_MSEC;
    match m.timedlock(deadline) {
        Err(Errno::Timeout) => 1,
        Ok(_) => {
            let _ = m.unlock();
            0
        }
        Err(_) => 0,
    }
}

fn timedlock_expiry(report: &mut TestReport) {
    let m = TIMED_MUTEX.call_once(|| Mutex::new(MutexAttr::default()));

    let _ = m.lock();
    let t = spawn(
        &pinned("timed-waiter", PolicyId::Rr, 40),
        timed_waiter_main,
        0,
    )
    .unwrap();

    // Hold the mutex well past the waiter's deadline.
    let _ = sleep_ns(120 * NSECS_PER_MSEC);
    report.check("timedlock expires with Timeout", join(t) == Ok(1));
    let _ = m.unlock();
}

fn destroy_rules(report: &mut TestReport) {
    let m = Mutex::new(MutexAttr::default());
    let _ = m.lock();
    report.check(
        "destroy of an owned mutex is Busy",
        m.clone().destroy() == Err(Errno::Busy),
    );
    let _ = m.unlock();
    report.check("destroy of a free mutex succeeds", m.destroy().is_ok());
}
