/*
 * Timer Chain and Time Tests
 *
 * The earliest-pointer invariant, handle-based removal, periodic
 * catch-up accounting, interval timers, and wall-clock monotonicity.
 */

use core::sync::atomic::{AtomicU64, Ordering};

use super::TestReport;
use crate::config::{NSECS_PER_MSEC, NSECS_PER_SEC};
use crate::errno::Errno;
use crate::sched;
use crate::time::counter::{get_monotonic_ns, gettime_ns};
use crate::time::timer::{
    ITimerClock, ITimerVal, armed_count, earliest_expiry, itimer_arm, itimer_cancel, timer_add,
    timer_remove,
};

static FIRE_COUNT: AtomicU64 = AtomicU64::new(0);
static MISSED_TOTAL: AtomicU64 = AtomicU64::new(0);
static ITIMER_FIRES: AtomicU64 = AtomicU64::new(0);

fn counting_handler(_arg: usize, missed: u64) {
    FIRE_COUNT.fetch_add(1, Ordering::SeqCst);
    MISSED_TOTAL.fetch_add(missed, Ordering::SeqCst);
}

fn noop_handler(_arg: usize, _missed: u64) {}

fn itimer_handler(_arg: usize, _missed: u64) {
    ITIMER_FIRES.fetch_add(1, Ordering::SeqCst);
}

pub fn run(report: &mut TestReport) {
    earliest_invariant(report);
    removal_roundtrip(report);
    eventer_surface(report);
    periodic_fires(report);
    catch_up_reporting(report);
    interval_timers(report);
    wall_clock_advances(report);
}

fn earliest_invariant(report: &mut TestReport) {
    // Far-future expiries so the live tick cannot fire them mid-test.
    let base = gettime_ns() + 3600 * NSECS_PER_SEC;

    let t_late = timer_add(base + 3000, 0, noop_handler, 0);
    let t_early = timer_add(base + 1000, 0, noop_handler, 0);
    let t_mid = timer_add(base + 2000, 0, noop_handler, 0);

    report.check(
        "earliest tracks the minimum expiry",
        earliest_expiry() == Some(base + 1000),
    );

    let _ = timer_remove(t_early);
    report.check(
        "earliest updates when the head is removed",
        earliest_expiry() == Some(base + 2000),
    );

    let _ = timer_remove(t_mid);
    let _ = timer_remove(t_late);
}

fn removal_roundtrip(report: &mut TestReport) {
    let base = gettime_ns() + 3600 * NSECS_PER_SEC;
    let before = earliest_expiry();
    let count_before = armed_count();

    let t = timer_add(base, 0, noop_handler, 0);
    report.check("armed count grows on insert", armed_count() == count_before + 1);
    report.check("timer_remove finds an armed node", timer_remove(t).is_ok());
    report.check(
        "insert-then-remove restores the chain",
        earliest_expiry() == before && armed_count() == count_before,
    );
    report.check(
        "removing twice reports NotFound",
        timer_remove(t) == Err(Errno::NotFound),
    );
}

fn eventer_surface(report: &mut TestReport) {
    use crate::arch::x86_64::pit::PIT_EVENTER;
    use crate::time::eventer;

    // The PIT is claimed as the global tick; claiming it again fails.
    report.check(
        "claiming a used eventer is Busy",
        eventer::setup(&PIT_EVENTER, |_, _| {}, 0) == Err(Errno::Busy),
    );
    report.check(
        "starting an unclaimed eventer is rejected",
        eventer::start(
            &crate::arch::x86_64::lapic::LAPIC_TIMER_EVENTER,
            eventer::EventerMode::Periodic,
            0,
        ) == Err(Errno::InvalidArgument),
    );
}

fn periodic_fires(report: &mut TestReport) {
    FIRE_COUNT.store(0, Ordering::SeqCst);
    MISSED_TOTAL.store(0, Ordering::SeqCst);

    // 20 ms interval observed over ~105 ms of real tick processing.
    let interval = 20 * NSECS_PER_MSEC;
    let t = timer_add(gettime_ns() + interval, interval, counting_handler, 0);

    let _ = sched::sleep_ns(105 * NSECS_PER_MSEC);
    let fired = FIRE_COUNT.load(Ordering::SeqCst);
    let _ = timer_remove(t);

    report.check(
        "periodic timer fires once per interval",
        (4..=6).contains(&fired),
    );
}

fn catch_up_reporting(report: &mut TestReport) {
    FIRE_COUNT.store(0, Ordering::SeqCst);
    MISSED_TOTAL.store(0, Ordering::SeqCst);

    // Armed well in the past: the next tick's processing pass has to
    // advance it by whole intervals and report the skipped ones.
    let interval = 10 * NSECS_PER_MSEC;
    let now = gettime_ns();
    let t = timer_add(now.saturating_sub(5 * interval), interval, counting_handler, 0);

    let _ = sched::sleep_ns(30 * NSECS_PER_MSEC);
    let missed = MISSED_TOTAL.load(Ordering::SeqCst);
    let fired = FIRE_COUNT.load(Ordering::SeqCst);
    let _ = timer_remove(t);

    report.check("lagging periodic timer still fires", fired >= 1);
    report.check("missed intervals are reported", missed >= 3);
}

fn interval_timers(report: &mut TestReport) {
    ITIMER_FIRES.store(0, Ordering::SeqCst);

    let value = ITimerVal {
        initial_ns: 20 * NSECS_PER_MSEC,
        interval_ns: 20 * NSECS_PER_MSEC,
    };
    let me = sched::current();
    let id = itimer_arm(ITimerClock::Real, value, 0, me, Some(itimer_handler), 0);
    report.check("real interval timer arms", id.is_ok());

    let _ = sched::sleep_ns(70 * NSECS_PER_MSEC);
    let fires = ITIMER_FIRES.load(Ordering::SeqCst);
    if let Ok(id) = id {
        let _ = itimer_cancel(id);
    }
    report.check("real interval timer fires repeatedly", fires >= 2);

    // Expiry posts the alarm signal to the owner.
    let pending = sched::thread_sigpending(me).unwrap_or(0);
    report.check(
        "itimer expiry raises SIGALRM",
        pending & (1 << crate::time::timer::SIGALRM) != 0,
    );

    report.check(
        "virtual clock is reported unsupported",
        itimer_arm(ITimerClock::Virtual, value, 0, me, None, 0) == Err(Errno::Unsupported),
    );
}

fn wall_clock_advances(report: &mut TestReport) {
    let wall_before = gettime_ns();
    let mono_start = get_monotonic_ns();
    while get_monotonic_ns() < mono_start + 10 * NSECS_PER_MSEC {
        core::hint::spin_loop();
    }
    let wall_after = gettime_ns();

    report.check(
        "wall clock advances across a 10 ms busy wait",
        wall_after >= wall_before + 10 * NSECS_PER_MSEC,
    );
}
