/*
 * Clock Eventers
 *
 * A clock eventer is a programmable interrupt source: it can be started in
 * one-shot or periodic mode with a nanosecond period and fires a bound
 * handler on expiry. Hardware drivers (PIT, local APIC timer) register one
 * descriptor each at boot; consumers pick a source with `select` by
 * capability flags and resolution.
 *
 * Exactly one eventer drives the global tick. Its handler keeps the time
 * counter fixed up, processes the timer chain, and runs the scheduler tick
 * hook. Additional per-CPU eventers (the AP lapic timers) drive only their
 * own CPU's scheduler tick.
 */

use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::config::{CONFIG_HZ, NSECS_PER_MSEC, hz_to_nsecs};
use crate::errno::{Errno, Result};
use crate::time::{counter, timer};

bitflags! {
    /// Capability / limitation flags of a clock eventer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventerFlags: u32 {
        const PERIODIC = 1 << 0;
        const ONESHOT  = 1 << 1;
        const PERCPU   = 1 << 2;
        const C3STOP   = 1 << 3;
    }
}

/// Current programming mode of an eventer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventerMode {
    Unused,
    Periodic,
    OneShot,
}

/// Handler bound to an eventer, with an opaque argument.
pub type EventerHandler = fn(eventer: &'static ClockEventer, arg: usize);

/// Mutable half of an eventer descriptor, guarded by its own lock.
pub struct EventerState {
    pub used: bool,
    pub mode: EventerMode,
    /// The period/expiry last programmed, in nanoseconds.
    pub expire_ns: u64,
    pub handler: Option<EventerHandler>,
    pub arg: usize,
}

/// A programmable interrupt source.
pub struct ClockEventer {
    pub name: &'static str,
    pub flags: EventerFlags,
    /// Higher value wins when several eventers satisfy a `select`.
    pub precedence: i32,
    pub min_period_ns: u64,
    pub max_period_ns: u64,
    pub state: Mutex<EventerState>,
    /// Program the hardware: mode + expiry relative to now.
    pub start: fn(&'static ClockEventer, EventerMode, u64) -> Result<()>,
    /// Stop the hardware from firing.
    pub stop: fn(&'static ClockEventer) -> Result<()>,
}

impl ClockEventer {
    /// Run a closure against the mutable state with interrupts
    /// disabled; the lock is also taken from interrupt context.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut EventerState) -> R) -> R {
        crate::arch::x86_64::interrupts::without_interrupts(|| {
            let mut state = self.state.lock();
            f(&mut state)
        })
    }

    pub const fn new(
        name: &'static str,
        flags: EventerFlags,
        precedence: i32,
        min_period_ns: u64,
        max_period_ns: u64,
        start: fn(&'static ClockEventer, EventerMode, u64) -> Result<()>,
        stop: fn(&'static ClockEventer) -> Result<()>,
    ) -> ClockEventer {
        ClockEventer {
            name,
            flags,
            precedence,
            min_period_ns,
            max_period_ns,
            state: Mutex::new(EventerState {
                used: false,
                mode: EventerMode::Unused,
                expire_ns: 0,
                handler: None,
                arg: 0,
            }),
            start,
            stop,
        }
    }

    /// Deliver this eventer's interrupt: invoke the bound handler.
    ///
    /// Runs in interrupt context. The state lock is dropped before the
    /// handler is called.
    pub fn dispatch(&'static self) {
        let (handler, arg) = self.with_state(|state| (state.handler, state.arg));
        if let Some(handler) = handler {
            handler(self, arg);
        }
    }
}

static EVENTER_LIST: Mutex<Vec<&'static ClockEventer>> = Mutex::new(Vec::new());

/// The eventer currently bound as the global tick source.
static GLOBAL_TICK_EVENTER: Mutex<Option<&'static ClockEventer>> = Mutex::new(None);

/// Publish an eventer in the global list.
pub fn add(eventer: &'static ClockEventer) {
    EVENTER_LIST.lock().push(eventer);
    log::info!(
        "clock eventer '{}' registered (flags {:?}, {}..{} ns)",
        eventer.name,
        eventer.flags,
        eventer.min_period_ns,
        eventer.max_period_ns
    );
}

/// Remove an eventer from the global list. In-use eventers stay put.
pub fn remove(eventer: &'static ClockEventer) -> Result<()> {
    if eventer.with_state(|s| s.used) {
        return Err(Errno::Busy);
    }
    EVENTER_LIST.lock().retain(|e| !core::ptr::eq(*e, eventer));
    Ok(())
}

/// Pick the best unused eventer whose flags match `expect` under `check`
/// and whose finest period is at least as fine as `resolution_ns`.
pub fn select(
    check: EventerFlags,
    expect: EventerFlags,
    resolution_ns: u64,
) -> Option<&'static ClockEventer> {
    let list = EVENTER_LIST.lock();
    let mut best: Option<&'static ClockEventer> = None;
    for eventer in list.iter() {
        if eventer.with_state(|s| s.used) {
            continue;
        }
        if eventer.flags & check != expect {
            continue;
        }
        if eventer.min_period_ns > resolution_ns {
            continue;
        }
        match best {
            Some(b) if b.precedence >= eventer.precedence => {}
            _ => best = Some(eventer),
        }
    }
    best
}

/// Claim an eventer and bind its handler.
pub fn setup(eventer: &'static ClockEventer, handler: EventerHandler, arg: usize) -> Result<()> {
    eventer.with_state(|state| {
        if state.used {
            return Err(Errno::Busy);
        }
        state.used = true;
        state.handler = Some(handler);
        state.arg = arg;
        Ok(())
    })
}

/// Start a claimed eventer in the given mode, firing `expire_ns` from now
/// (and every `expire_ns` thereafter in periodic mode).
pub fn start(eventer: &'static ClockEventer, mode: EventerMode, expire_ns: u64) -> Result<()> {
    if !eventer.with_state(|s| s.used) {
        return Err(Errno::InvalidArgument);
    }
    if expire_ns == 0 {
        return Err(Errno::InvalidArgument);
    }
    match mode {
        EventerMode::Periodic if !eventer.flags.contains(EventerFlags::PERIODIC) => {
            return Err(Errno::Unsupported);
        }
        EventerMode::OneShot if !eventer.flags.contains(EventerFlags::ONESHOT) => {
            return Err(Errno::Unsupported);
        }
        EventerMode::Unused => return Err(Errno::InvalidArgument),
        _ => {}
    }

    let expire_ns = expire_ns.clamp(eventer.min_period_ns, eventer.max_period_ns);

    eventer.with_state(|state| {
        state.mode = mode;
        state.expire_ns = expire_ns;
    });
    (eventer.start)(eventer, mode, expire_ns)
}

/// Stop a claimed eventer.
pub fn stop(eventer: &'static ClockEventer) -> Result<()> {
    if !eventer.with_state(|s| s.used) {
        return Err(Errno::InvalidArgument);
    }
    let result = (eventer.stop)(eventer);
    if result.is_ok() {
        eventer.with_state(|s| s.mode = EventerMode::Unused);
    }
    result
}

/// The global tick handler: time fixup, timer chain, scheduler tick.
///
/// Runs in interrupt context on the CPU the tick eventer interrupts.
fn global_tick_handler(eventer: &'static ClockEventer, _arg: usize) {
    counter::regular_fixup();

    timer::process(counter::gettime_ns());

    crate::sched::sched_clock_tick();

    // A one-shot source has to be re-armed for the next tick boundary.
    let (mode, expire) = eventer.with_state(|s| (s.mode, s.expire_ns));
    if mode == EventerMode::OneShot {
        let _ = (eventer.start)(eventer, mode, expire);
    }
}

/// Per-CPU tick handler for application processors: scheduler tick only.
/// Wall time and the timer chain belong to the global tick.
fn local_tick_handler(eventer: &'static ClockEventer, _arg: usize) {
    crate::sched::sched_clock_tick();

    let (mode, expire) = eventer.with_state(|s| (s.mode, s.expire_ns));
    if mode == EventerMode::OneShot {
        let _ = (eventer.start)(eventer, mode, expire);
    }
}

/// Select and start the global tick at CONFIG_HZ.
///
/// Requires a periodic-capable eventer with at least millisecond
/// resolution; the fixup period of the time counter bounds how slow the
/// tick is allowed to be.
pub fn tick_init() -> Result<()> {
    let eventer = select(
        EventerFlags::PERIODIC | EventerFlags::PERCPU,
        EventerFlags::PERIODIC,
        NSECS_PER_MSEC,
    )
    .ok_or(Errno::NotFound)?;

    let period = hz_to_nsecs(CONFIG_HZ);
    if let Some(fixup) = counter::fixup_period_ns() {
        debug_assert!(period <= fixup, "tick slower than counter fixup period");
    }

    log::info!("global tick eventer: '{}' at {} Hz", eventer.name, CONFIG_HZ);

    setup(eventer, global_tick_handler, 0)?;
    start(eventer, EventerMode::Periodic, period)?;

    *GLOBAL_TICK_EVENTER.lock() = Some(eventer);
    Ok(())
}

/// Claim and start a per-CPU eventer for an application processor's local
/// scheduler tick. Called once per AP from the scheduler bootstrap.
pub fn local_tick_init(eventer: &'static ClockEventer) -> Result<()> {
    // The shared lapic-timer descriptor is claimed once; later APs
    // only need their own hardware programmed.
    eventer.with_state(|state| {
        if !state.used {
            state.used = true;
            state.handler = Some(local_tick_handler);
            state.arg = 0;
        }
    });
    start(eventer, EventerMode::Periodic, hz_to_nsecs(CONFIG_HZ))
}
