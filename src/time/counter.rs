/*
 * Time Counter
 *
 * A time counter is a free-running hardware counter with a known frequency
 * and bit width. The kernel keeps wall time as a 64-bit nanosecond value:
 * every fixup reads the counter, converts the (wrap-corrected) delta since
 * the previous read to nanoseconds, and folds it into `system_time`. The
 * global tick guarantees a fixup at least once per `fixup_period_ns`, so
 * the raw counter can never wrap more than once between reads.
 */

use spin::{Mutex, Once};

use crate::config::NSECS_PER_SEC;
use crate::errno::{Errno, Result};

/// A hardware counter usable as the system time source.
pub struct TimeCounter {
    pub name: &'static str,
    /// Width of the raw counter value in bits (<= 64).
    pub counter_bits: u32,
    /// Counting frequency in Hz. Filled in by `enable` for calibrated
    /// sources, which is why the descriptor is taken by `&mut`.
    pub frequency_hz: u64,
    /// Nanoseconds per raw count.
    pub resolution_ns: u64,
    /// Longest safe interval between two reads (no wrap in between).
    pub fixup_period_ns: u64,
    /// Bring the counter on line (calibrate, start counting).
    pub enable: fn(&mut TimeCounter) -> Result<()>,
    /// Read the current raw value, masked to `counter_bits`.
    pub read: fn() -> u64,
}

impl TimeCounter {
    /// Mask covering the counter's width.
    fn mask(&self) -> u64 {
        if self.counter_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.counter_bits) - 1
        }
    }

    /// Nanoseconds elapsed between two raw reads, correctly handling one
    /// wrap of the counter.
    pub fn time_elapsed(&self, c1: u64, c2: u64) -> u64 {
        let delta = c2.wrapping_sub(c1) & self.mask();
        ((delta as u128 * NSECS_PER_SEC as u128) / self.frequency_hz as u128) as u64
    }
}

struct ClockState {
    /// Raw counter value at the most recent read.
    latest_read: u64,
    /// Accumulated wall time in nanoseconds since the Unix epoch.
    system_time_ns: u64,
}

static GLOBAL_COUNTER: Once<TimeCounter> = Once::new();
static CLOCK: Mutex<ClockState> = Mutex::new(ClockState {
    latest_read: 0,
    system_time_ns: 0,
});
static BOOT_TIME: Once<u64> = Once::new();

/// Select the global time counter and seed wall time.
///
/// `wall_seed_ns` is the RTC reading at boot, in nanoseconds since the
/// epoch. Called exactly once, before the tick eventer starts.
pub fn init(mut counter: TimeCounter, wall_seed_ns: u64) -> Result<()> {
    (counter.enable)(&mut counter)?;
    if counter.frequency_hz == 0 {
        return Err(Errno::InvalidArgument);
    }

    log::info!(
        "time counter '{}': {} bits, {} Hz, resolution {} ns",
        counter.name,
        counter.counter_bits,
        counter.frequency_hz,
        counter.resolution_ns
    );

    let first_read = (counter.read)();
    GLOBAL_COUNTER.call_once(|| counter);

    let mut clock = CLOCK.lock();
    clock.latest_read = first_read;
    clock.system_time_ns = wall_seed_ns;
    drop(clock);

    BOOT_TIME.call_once(|| wall_seed_ns);
    Ok(())
}

/// Advance `system_time` by the elapsed counter delta. Called from the
/// global tick at least once per fixup period, and from every clock read.
fn advance_locked(counter: &TimeCounter, clock: &mut ClockState) -> u64 {
    let now = (counter.read)();
    let elapsed = counter.time_elapsed(clock.latest_read, now);
    clock.latest_read = now;
    clock.system_time_ns += elapsed;
    clock.system_time_ns
}

/// Periodic fixup entry, invoked by the global tick handler.
///
/// The clock lock is taken with interrupts disabled everywhere because
/// this path runs in interrupt context.
pub fn regular_fixup() {
    if let Some(counter) = GLOBAL_COUNTER.get() {
        crate::arch::x86_64::interrupts::without_interrupts(|| {
            let mut clock = CLOCK.lock();
            advance_locked(counter, &mut clock);
        });
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn gettime_ns() -> u64 {
    match GLOBAL_COUNTER.get() {
        Some(counter) => crate::arch::x86_64::interrupts::without_interrupts(|| {
            let mut clock = CLOCK.lock();
            advance_locked(counter, &mut clock)
        }),
        None => 0,
    }
}

/// Monotonic nanoseconds since boot.
pub fn get_monotonic_ns() -> u64 {
    let boot = BOOT_TIME.get().copied().unwrap_or(0);
    gettime_ns().saturating_sub(boot)
}

/// The fixup period of the selected counter, for the tick configuration.
pub fn fixup_period_ns() -> Option<u64> {
    GLOBAL_COUNTER.get().map(|c| c.fixup_period_ns)
}
