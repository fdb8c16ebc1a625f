/*
 * 8254 Programmable Interval Timer
 *
 * Two roles: channel 0 is the global tick eventer (IRQ0, vector 32), and
 * channel 2 (the speaker counter, gated by port 0x61) provides a polled
 * delay used to calibrate the TSC and the lapic timer at boot, before any
 * interrupt-driven clock exists.
 */

use spin::Mutex;
use x86_64::instructions::port::Port;

use super::pic;
use crate::config::NSECS_PER_SEC;
use crate::errno::{Errno, Result};
use crate::time::eventer::{ClockEventer, EventerFlags, EventerMode};

/// PIT input clock in Hz.
const PIT_FREQUENCY_HZ: u64 = 1_193_182;

const PIT_CH0_DATA: u16 = 0x40;
const PIT_CH2_DATA: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
/// NMI status / speaker control port; bit 0 gates channel 2, bit 5 is the
/// channel 2 output.
const PIT_GATE_PORT: u16 = 0x61;

/// Command: channel 0, lobyte/hibyte, mode 3 (square wave) - periodic.
const CMD_CH0_PERIODIC: u8 = 0x36;
/// Command: channel 0, lobyte/hibyte, mode 0 (terminal count) - one-shot.
const CMD_CH0_ONESHOT: u8 = 0x30;
/// Command: channel 2, lobyte/hibyte, mode 0.
const CMD_CH2_ONESHOT: u8 = 0xB0;

static PIT_PORTS: Mutex<()> = Mutex::new(());

fn program_channel0(command: u8, divisor: u16) {
    let _guard = PIT_PORTS.lock();
    let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
    let mut data: Port<u8> = Port::new(PIT_CH0_DATA);
    unsafe {
        cmd.write(command);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}

fn pit_start(_eventer: &'static ClockEventer, mode: EventerMode, expire_ns: u64) -> Result<()> {
    let ticks = expire_ns as u128 * PIT_FREQUENCY_HZ as u128 / NSECS_PER_SEC as u128;
    if ticks == 0 || ticks > 0xFFFF {
        return Err(Errno::InvalidArgument);
    }
    let command = match mode {
        EventerMode::Periodic => CMD_CH0_PERIODIC,
        EventerMode::OneShot => CMD_CH0_ONESHOT,
        EventerMode::Unused => return Err(Errno::InvalidArgument),
    };
    program_channel0(command, ticks as u16);
    pic::unmask_line(0);
    Ok(())
}

fn pit_stop(_eventer: &'static ClockEventer) -> Result<()> {
    // The 8254 has no stop bit; silencing the line at the PIC is how the
    // tick is actually stopped.
    pic::mask_line(0);
    Ok(())
}

/// The PIT channel-0 eventer. One PIT tick is ~838 ns and the 16-bit
/// counter tops out just under 55 ms.
pub static PIT_EVENTER: ClockEventer = ClockEventer::new(
    "PIT",
    EventerFlags::PERIODIC.union(EventerFlags::ONESHOT),
    1,
    100_000,
    54_000_000,
    pit_start,
    pit_stop,
);

/// Register the PIT with the eventer subsystem.
pub fn init() {
    crate::time::eventer::add(&PIT_EVENTER);
}

/// Busy-wait for `us` microseconds using PIT channel 2.
///
/// Polled, interrupt-free, and independent of every other clock in the
/// system; usable before anything else is calibrated. Limited to one
/// channel-2 countdown (~54 ms).
pub fn poll_delay_us(us: u64) {
    let ticks = us * PIT_FREQUENCY_HZ / 1_000_000;
    debug_assert!(ticks > 0 && ticks <= 0xFFFF);

    let _guard = PIT_PORTS.lock();
    let mut gate: Port<u8> = Port::new(PIT_GATE_PORT);
    let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
    let mut data: Port<u8> = Port::new(PIT_CH2_DATA);

    unsafe {
        // Gate channel 2 on, speaker off.
        let prev = gate.read();
        gate.write((prev & !0x02) | 0x01);

        cmd.write(CMD_CH2_ONESHOT);
        data.write((ticks & 0xFF) as u8);
        data.write((ticks >> 8) as u8);

        // Mode 0 drives OUT low until the count expires.
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }

        gate.write(prev);
    }
}
