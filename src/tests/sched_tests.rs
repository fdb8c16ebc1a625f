/*
 * Scheduler Tests
 *
 * Thread lifecycle, FIFO ordering and yield rotation, RR slice-driven
 * alternation, sleep, suspend/resume, and cancellation. Scenario
 * threads are pinned to CPU 0 so the checks stay deterministic on a
 * multiprocessor run.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::TestReport;
use crate::config::NSECS_PER_MSEC;
use crate::errno::Errno;
use crate::sched::{
    self, CANCELED_RETVAL, CpuSet, PolicyId, ThreadAttr, ThreadState, cancel, join, sleep_ns,
    spawn, testcancel, yield_now,
};
use crate::time::counter::get_monotonic_ns;

/// Order in which scenario threads reached their marker.
static SEQUENCE: Mutex<heapless::Vec<u64, 64>> = Mutex::new(heapless::Vec::new());

fn record(tag: u64) {
    let _ = SEQUENCE.lock().push(tag);
}

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
    runq_contract(report);
    spawn_join_retval(report);
    fifo_priority_order(report);
    fifo_yield_alternation(report);
    rr_alternation(report);
    sleep_duration(report);
    suspend_resume(report);
    cleanup_handlers(report);
    cancel_during_sleep(report);
    irq_registration(report);
}

fn runq_contract(report: &mut TestReport) {
    use crate::sched::runq::RunQueue;
    use crate::sched::thread::ThreadId;

    let a = RunQueue::new("TEST_RUNQ_A");
    let b = RunQueue::new("TEST_RUNQ_B");

    a.enqueue_tail(ThreadId(1001), 30);
    a.enqueue_tail(ThreadId(1002), 40);
    a.enqueue_head(ThreadId(1003), 30);
    b.enqueue_tail(ThreadId(1004), 35);

    report.check("runq tracks the best priority", a.best_priority() == Some(40));
    report.check(
        "runq preemption check compares against the best",
        a.preemption_check(Some(35)) && !a.preemption_check(Some(40)),
    );
    report.check("runq head compare ranks queue heads", a.head_compare(&b));

    report.check(
        "runq dequeues highest priority first",
        a.dequeue() == Some((ThreadId(1002), 40)),
    );
    // Head-enqueued 1003 sits in front of tail-enqueued 1001.
    report.check(
        "head placement wins within a priority",
        a.dequeue() == Some((ThreadId(1003), 30)),
    );
    report.check("runq remove finds a queued thread", a.remove(ThreadId(1001), 30));
    report.check("emptied runq reports no best priority", a.best_priority().is_none());

    let _ = b.dequeue();
}

extern "C" fn add_one_main(arg: usize) -> usize {
    arg + 1
}

fn spawn_join_retval(report: &mut TestReport) {
    let attr = pinned("add-one", PolicyId::Rr, 20);
    match spawn(&attr, add_one_main, 41) {
        Ok(tid) => {
            report.check("join returns the thread's retval", join(tid) == Ok(42));
            report.check(
                "joined thread is gone from the table",
                join(tid) == Err(Errno::NotFound) || sched::thread_state(tid).is_err(),
            );
        }
        Err(_) => report.check("spawn", false),
    }
}

extern "C" fn tagger_main(arg: usize) -> usize {
    record(arg as u64);
    0
}

fn fifo_priority_order(report: &mut TestReport) {
    SEQUENCE.lock().clear();

    // Both below the boot thread's priority: they run only once the
    // boot thread blocks in join, and the higher one must go first.
    let low = spawn(&pinned("fifo-low", PolicyId::Fifo, 10), tagger_main, 30).unwrap();
    let high = spawn(&pinned("fifo-high", PolicyId::Fifo, 12), tagger_main, 40).unwrap();

    let _ = join(high);
    let _ = join(low);

    let seq = SEQUENCE.lock();
    report.check(
        "higher FIFO priority runs first",
        seq.len() == 2 && seq[0] == 40 && seq[1] == 30,
    );
}

const YIELD_ROUNDS: usize = 8;

extern "C" fn yielder_main(arg: usize) -> usize {
    for _ in 0..YIELD_ROUNDS {
        record(arg as u64);
        yield_now();
    }
    0
}

fn fifo_yield_alternation(report: &mut TestReport) {
    SEQUENCE.lock().clear();

    let a = spawn(&pinned("yield-a", PolicyId::Fifo, 10), yielder_main, 1).unwrap();
    let b = spawn(&pinned("yield-b", PolicyId::Fifo, 10), yielder_main, 2).unwrap();
    let _ = join(a);
    let _ = join(b);

    // Tail re-enqueue on yield makes equal-priority FIFO threads
    // alternate strictly.
    let seq = SEQUENCE.lock();
    let mut alternating = seq.len() == 2 * YIELD_ROUNDS;
    for pair in seq.chunks(2) {
        if pair.len() == 2 && pair[0] == pair[1] {
            alternating = false;
        }
    }
    report.check("equal-priority FIFO yields alternate strictly", alternating);
}

static RR_COUNT_A: AtomicU64 = AtomicU64::new(0);
static RR_COUNT_B: AtomicU64 = AtomicU64::new(0);
static RR_GOAL: u64 = 200_000;

extern "C" fn rr_spinner_main(arg: usize) -> usize {
    let (mine, other): (&AtomicU64, &AtomicU64) = if arg == 0 {
        (&RR_COUNT_A, &RR_COUNT_B)
    } else {
        (&RR_COUNT_B, &RR_COUNT_A)
    };
    // Never blocks: only the RR tick can rotate us out, so the other
    // spinner progressing proves slice-driven preemption.
    let mut safety = 0u64;
    loop {
        mine.fetch_add(1, Ordering::Relaxed);
        safety += 1;
        if mine.load(Ordering::Relaxed) >= RR_GOAL && other.load(Ordering::Relaxed) >= RR_GOAL {
            return 1;
        }
        if safety > 2_000_000_000 {
            return 0;
        }
    }
}

fn rr_alternation(report: &mut TestReport) {
    RR_COUNT_A.store(0, Ordering::SeqCst);
    RR_COUNT_B.store(0, Ordering::SeqCst);

    let mut attr = pinned("rr-spin", PolicyId::Rr, 20);
    attr.time_slice_ms = 10;
    let a = spawn(&attr, rr_spinner_main, 0).unwrap();
    let b = spawn(&attr, rr_spinner_main, 1).unwrap();

    let ok_a = join(a) == Ok(1);
    let ok_b = join(b) == Ok(1);
    report.check(
        "equal-priority RR spinners share the CPU via slices",
        ok_a && ok_b,
    );
}

fn sleep_duration(report: &mut TestReport) {
    let before = get_monotonic_ns();
    let result = sleep_ns(20 * NSECS_PER_MSEC);
    let elapsed = get_monotonic_ns() - before;
    report.check(
        "sleep blocks for at least the requested time",
        result.is_ok() && elapsed >= 20 * NSECS_PER_MSEC,
    );
}

static RESUMED: AtomicBool = AtomicBool::new(false);

extern "C" fn suspended_main(_arg: usize) -> usize {
    RESUMED.store(true, Ordering::SeqCst);
    7
}

fn suspend_resume(report: &mut TestReport) {
    RESUMED.store(false, Ordering::SeqCst);

    let mut attr = pinned("suspended", PolicyId::Rr, 40);
    attr.start_suspended = true;
    let tid = spawn(&attr, suspended_main, 0).unwrap();

    let _ = sleep_ns(20 * NSECS_PER_MSEC);
    report.check(
        "suspended thread does not run",
        !RESUMED.load(Ordering::SeqCst)
            && sched::thread_state(tid) == Ok(ThreadState::Suspended),
    );

    report.check("resume releases it", sched::resume(tid).is_ok());
    // A reschedule request only switches when someone better exists.
    sched::reschedule();
    report.check("resumed thread completes", join(tid) == Ok(7));
}

/// Cleanup handlers recorded in push order; they must run reversed.
static CLEANUP_ORDER: Mutex<heapless::Vec<u64, 8>> = Mutex::new(heapless::Vec::new());

extern "C" fn cleanup_main(_arg: usize) -> usize {
    sched::cleanup_push(alloc::boxed::Box::new(|| {
        let _ = CLEANUP_ORDER.lock().push(1);
    }));
    sched::cleanup_push(alloc::boxed::Box::new(|| {
        let _ = CLEANUP_ORDER.lock().push(2);
    }));
    sched::cleanup_push(alloc::boxed::Box::new(|| {
        let _ = CLEANUP_ORDER.lock().push(3);
    }));
    // Popped-with-execute runs immediately; the rest run at exit.
    sched::cleanup_pop(true);
    9
}

fn cleanup_handlers(report: &mut TestReport) {
    CLEANUP_ORDER.lock().clear();

    let tid = spawn(&pinned("cleanup", PolicyId::Rr, 40), cleanup_main, 0).unwrap();
    report.check("thread with cleanup handlers completes", join(tid) == Ok(9));

    let order = CLEANUP_ORDER.lock();
    report.check(
        "cleanup chain runs LIFO",
        order.len() == 3 && order[0] == 3 && order[1] == 2 && order[2] == 1,
    );
}

fn irq_registration(report: &mut TestReport) {
    use crate::arch::x86_64::idt::{irq_register, irq_unregister};
    use crate::arch::x86_64::vectors;

    fn dummy_handler(_vector: u8) {}

    report.check(
        "irq_register rejects reserved vectors",
        irq_register(vectors::LAPIC_TIMER, "bad", dummy_handler) == Err(Errno::InvalidArgument),
    );
    report.check(
        "irq_register claims a free vector",
        irq_register(0x60, "test-irq", dummy_handler).is_ok(),
    );
    report.check(
        "second registration is Busy",
        irq_register(0x60, "test-irq-2", dummy_handler) == Err(Errno::Busy),
    );
    report.check("irq_unregister releases it", irq_unregister(0x60).is_ok());
    report.check(
        "unregister of a free vector is NotFound",
        irq_unregister(0x60) == Err(Errno::NotFound),
    );
}

static SLEEPER_STARTED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn long_sleeper_main(_arg: usize) -> usize {
    // Deferred cancellation, explicitly.
    let _ = sched::set_cancel_state(sched::CancelState::Enabled);
    let _ = sched::set_cancel_type(sched::CancelType::Deferred);

    SLEEPER_STARTED.store(1, Ordering::SeqCst);
    match sleep_ns(10_000 * NSECS_PER_MSEC) {
        // Interrupted by cancel: take the cancellation.
        Err(Errno::Interrupted) => {
            testcancel();
            // Unreachable when the cancel was pending.
            2
        }
        _ => 1,
    }
}

fn cancel_during_sleep(report: &mut TestReport) {
    SLEEPER_STARTED.store(0, Ordering::SeqCst);

    let tid = spawn(&pinned("sleeper", PolicyId::Rr, 40), long_sleeper_main, 0).unwrap();

    // Let it reach its 10-second sleep, then cancel.
    while SLEEPER_STARTED.load(Ordering::SeqCst) == 0 {
        yield_now();
    }
    let _ = sleep_ns(20 * NSECS_PER_MSEC);

    let before = get_monotonic_ns();
    report.check("cancel accepts a sleeping thread", cancel(tid).is_ok());
    let joined = join(tid);
    let elapsed = get_monotonic_ns() - before;

    report.check(
        "canceled sleeper exits with the canceled retval",
        joined == Ok(CANCELED_RETVAL),
    );
    report.check(
        "cancellation interrupts the sleep promptly",
        elapsed < 1_000 * NSECS_PER_MSEC,
    );
}
