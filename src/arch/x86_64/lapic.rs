/*
 * Local APIC
 *
 * Every CPU owns one local APIC. The kernel uses it for four things:
 * identifying the CPU (`id`), acknowledging interrupts (`eoi`), the
 * per-CPU lapic timer (a clock eventer), and inter-processor interrupts
 * (the INIT/SIPI startup sequence and the reschedule IPI).
 *
 * Registers are 32-bit cells on 16-byte strides, memory-mapped at the
 * base published in IA32_APIC_BASE (or overridden by the MP config
 * table). All accesses are volatile.
 */

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use volatile::VolatilePtr;
use x86::msr::{IA32_APIC_BASE, rdmsr, wrmsr};

use super::vectors;
use crate::errno::{Errno, Result};
use crate::time::eventer::{ClockEventer, EventerFlags, EventerMode};

/* Register offsets. */
const REG_ID: u64 = 0x020;
const REG_VERSION: u64 = 0x030;
const REG_TASK_PRIORITY: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SPURIOUS: u64 = 0x0F0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// Spurious register: APIC software enable.
const SPURIOUS_ENABLE: u32 = 1 << 8;
/// LVT: masked.
const LVT_MASKED: u32 = 1 << 16;
/// LVT timer: periodic mode.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// ICR: delivery status (send pending).
const ICR_SEND_PENDING: u32 = 1 << 12;
/// ICR delivery modes.
const ICR_MODE_INIT: u32 = 0x500;
const ICR_MODE_STARTUP: u32 = 0x600;
/// IA32_APIC_BASE: global enable.
const MSR_APIC_ENABLE: u64 = 1 << 11;

/// Divide configuration value for divide-by-16.
const TIMER_DIVIDE_BY_16: u32 = 0b0011;

/// MMIO base of the local APIC. Identical on every CPU (each one sees its
/// own APIC through the same physical window). Zero until `set_base`.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Lapic-timer ticks per millisecond, measured once on the BSP.
static TIMER_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

fn reg(offset: u64) -> VolatilePtr<'static, u32> {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "lapic accessed before set_base");
    unsafe { VolatilePtr::new(NonNull::new_unchecked((base + offset) as *mut u32)) }
}

/// Record the APIC MMIO base (from the MP config table, or the MSR).
pub fn set_base(phys_base: u64) {
    LAPIC_BASE.store(phys_base, Ordering::Relaxed);
}

/// True once a base has been recorded and `enable` ran on the BSP.
pub fn is_available() -> bool {
    LAPIC_BASE.load(Ordering::Relaxed) != 0
}

/// Enable the local APIC of the calling CPU.
///
/// Sets the MSR enable bit, programs the spurious vector, and opens the
/// task-priority gate. Run once per CPU.
pub fn enable() {
    unsafe {
        let msr = rdmsr(IA32_APIC_BASE);
        if LAPIC_BASE.load(Ordering::Relaxed) == 0 {
            set_base(msr & 0xFFFF_FFFF_FFFF_F000);
        }
        if msr & MSR_APIC_ENABLE == 0 {
            wrmsr(IA32_APIC_BASE, msr | MSR_APIC_ENABLE);
        }
    }

    reg(REG_SPURIOUS).write(SPURIOUS_ENABLE | vectors::LAPIC_SPURIOUS as u32);
    reg(REG_TASK_PRIORITY).write(0);
}

/// Local APIC id of the calling CPU.
pub fn id() -> u8 {
    (reg(REG_ID).read() >> 24) as u8
}

/// APIC version register, logged at bringup.
pub fn version() -> u32 {
    reg(REG_VERSION).read()
}

/// Acknowledge the in-service interrupt.
pub fn eoi() {
    reg(REG_EOI).write(0);
}

fn wait_for_delivery() {
    while reg(REG_ICR_LOW).read() & ICR_SEND_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Send a raw IPI command to the CPU with the given APIC id.
fn send_icr(apic_id: u8, icr_low: u32) {
    reg(REG_ICR_HIGH).write((apic_id as u32) << 24);
    reg(REG_ICR_LOW).write(icr_low);
    wait_for_delivery();
}

/// Send an INIT IPI (level assert) to a target CPU.
pub fn send_init(apic_id: u8) {
    send_icr(apic_id, ICR_MODE_INIT | (1 << 14));
}

/// Send a STARTUP IPI pointing at a page-aligned trampoline below 1 MiB.
pub fn send_startup(apic_id: u8, trampoline_phys: u64) {
    let vector = ((trampoline_phys >> 12) & 0xFF) as u32;
    send_icr(apic_id, ICR_MODE_STARTUP | vector);
}

/// Send a fixed-vector IPI (used for reschedule requests). A no-op
/// before the APIC is live, so uniprocessor paths can call it blindly.
pub fn send_ipi(apic_id: u8, vector: u8) {
    if !is_available() {
        return;
    }
    send_icr(apic_id, vector as u32);
}

/* Lapic timer eventer */

/// Calibrate the lapic timer against the PIT. BSP only; the bus clock is
/// common to all packages this kernel cares about.
pub fn calibrate_timer() {
    reg(REG_TIMER_DIVIDE).write(TIMER_DIVIDE_BY_16);
    reg(REG_LVT_TIMER).write(LVT_MASKED);
    reg(REG_TIMER_INITIAL).write(u32::MAX);

    super::pit::poll_delay_us(10_000);

    let remaining = reg(REG_TIMER_CURRENT).read();
    reg(REG_TIMER_INITIAL).write(0);

    let ticks_per_10ms = (u32::MAX - remaining) as u64;
    let per_ms = ticks_per_10ms / 10;
    TIMER_TICKS_PER_MS.store(per_ms, Ordering::Relaxed);
    log::info!("lapic timer: {} ticks/ms (divide 16)", per_ms);
}

fn lapic_timer_start(
    _eventer: &'static ClockEventer,
    mode: EventerMode,
    expire_ns: u64,
) -> Result<()> {
    let per_ms = TIMER_TICKS_PER_MS.load(Ordering::Relaxed);
    if per_ms == 0 {
        return Err(Errno::Unsupported);
    }
    let count = (expire_ns as u128 * per_ms as u128 / 1_000_000u128) as u64;
    if count == 0 || count > u32::MAX as u64 {
        return Err(Errno::InvalidArgument);
    }

    let lvt = match mode {
        EventerMode::Periodic => vectors::LAPIC_TIMER as u32 | LVT_TIMER_PERIODIC,
        EventerMode::OneShot => vectors::LAPIC_TIMER as u32,
        EventerMode::Unused => return Err(Errno::InvalidArgument),
    };
    reg(REG_TIMER_DIVIDE).write(TIMER_DIVIDE_BY_16);
    reg(REG_LVT_TIMER).write(lvt);
    reg(REG_TIMER_INITIAL).write(count as u32);
    Ok(())
}

fn lapic_timer_stop(_eventer: &'static ClockEventer) -> Result<()> {
    reg(REG_LVT_TIMER).write(LVT_MASKED);
    reg(REG_TIMER_INITIAL).write(0);
    Ok(())
}

/// The per-CPU lapic timer eventer. Claimed once; each AP programs its
/// own copy of the hardware through the shared descriptor.
pub static LAPIC_TIMER_EVENTER: ClockEventer = ClockEventer::new(
    "LAPIC-TIMER",
    EventerFlags::PERIODIC
        .union(EventerFlags::ONESHOT)
        .union(EventerFlags::PERCPU)
        .union(EventerFlags::C3STOP),
    10,
    10_000,
    1_000_000_000,
    lapic_timer_start,
    lapic_timer_stop,
);

/// Register the lapic timer with the eventer subsystem and calibrate it.
pub fn init_timer_eventer() {
    calibrate_timer();
    crate::time::eventer::add(&LAPIC_TIMER_EVENTER);
}
