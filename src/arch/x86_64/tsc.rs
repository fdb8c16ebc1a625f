/*
 * TSC Time Counter
 *
 * The time-stamp counter is the system time source: 64 bits wide, constant
 * rate on every target this kernel runs on, and readable in a handful of
 * cycles. Its frequency is unknown at reset, so `enable` calibrates it
 * against a polled PIT delay once at boot.
 */

use crate::config::NSECS_PER_SEC;
use crate::errno::{Errno, Result};
use crate::time::counter::TimeCounter;

/// Calibration window in microseconds. Long enough that PIT jitter is
/// noise, short enough not to slow boot perceptibly.
const CALIBRATE_US: u64 = 10_000;

fn tsc_read() -> u64 {
    unsafe { x86::time::rdtsc() }
}

fn tsc_enable(counter: &mut TimeCounter) -> Result<()> {
    let start = tsc_read();
    super::pit::poll_delay_us(CALIBRATE_US);
    let end = tsc_read();

    let delta = end.wrapping_sub(start);
    let frequency_hz = delta * (1_000_000 / CALIBRATE_US);
    if frequency_hz == 0 {
        return Err(Errno::Unsupported);
    }

    counter.frequency_hz = frequency_hz;
    counter.resolution_ns = (NSECS_PER_SEC / frequency_hz).max(1);
    log::info!("TSC calibrated: {} MHz", frequency_hz / 1_000_000);
    Ok(())
}

/// Build the TSC counter descriptor for `time::counter::init`.
///
/// A 64-bit counter cannot wrap within a machine's lifetime; the fixup
/// period is still kept at two seconds so wall time advances visibly
/// even if nothing reads the clock.
pub fn time_counter() -> TimeCounter {
    TimeCounter {
        name: "TSC",
        counter_bits: 64,
        frequency_hz: 0,
        resolution_ns: 0,
        fixup_period_ns: 2 * NSECS_PER_SEC,
        enable: tsc_enable,
        read: tsc_read,
    }
}
