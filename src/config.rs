/*
 * Kernel Compile-Time Configuration
 *
 * Every build-time knob of the kernel lives here. Nothing in this file is
 * read at runtime from anywhere but these constants, so changing a value
 * and rebuilding reconfigures the whole system consistently.
 */

/// Maximum number of CPUs the kernel will manage.
///
/// The CPU-set bitmap is a single u64, so this must stay <= 64.
pub const CONFIG_NR_CPUS: usize = 8;

/// Scheduler tick frequency in Hz (ticks per second).
pub const CONFIG_HZ: u64 = 100;

/// Length of one scheduler tick in nanoseconds.
pub const TICK_NSECS: u64 = NSECS_PER_SEC / CONFIG_HZ;

/// Kernel heap size in bytes, carved from the page allocator at boot.
pub const CONFIG_KHEAP_SIZE: usize = 8 * 1024 * 1024; // 8 MiB

/// Default kernel thread stack size (64 KiB per thread).
pub const CONFIG_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Default round-robin time slice in milliseconds.
pub const CONFIG_RR_SLICE_MS: u64 = 50;

/// Priority range shared by the FIFO and RR policies.
///
/// Higher numeric value means higher priority throughout the kernel.
pub const SCHED_PRIO_MIN: u8 = 0;
pub const SCHED_PRIO_MAX: u8 = 63;
pub const SCHED_PRIO_COUNT: usize = (SCHED_PRIO_MAX - SCHED_PRIO_MIN + 1) as usize;

/// Maximum recursion depth of a recursive mutex.
pub const MUTEX_MAX_RECURSION: u32 = 32;

/// Fixed-capacity name length for kernel objects (threads, runqs, eventers).
pub const NAME_MAX: usize = 32;

/// Nanosecond conversion helpers.
pub const NSECS_PER_SEC: u64 = 1_000_000_000;
pub const NSECS_PER_MSEC: u64 = 1_000_000;
pub const NSECS_PER_USEC: u64 = 1_000;

/// Convert a tick frequency in Hz to a period in nanoseconds.
pub const fn hz_to_nsecs(hz: u64) -> u64 {
    NSECS_PER_SEC / hz
}

/// Convert milliseconds to nanoseconds.
pub const fn msecs_to_nsecs(ms: u64) -> u64 {
    ms * NSECS_PER_MSEC
}

/// Convert milliseconds to whole scheduler ticks (at least one).
pub const fn msecs_to_ticks(ms: u64) -> u32 {
    let ticks = ms * CONFIG_HZ / 1000;
    if ticks == 0 { 1 } else { ticks as u32 }
}

/// How long the BSP waits for an application processor to report in
/// before declaring it dead (nanoseconds).
pub const CONFIG_AP_BOOT_TIMEOUT_NS: u64 = 100 * NSECS_PER_MSEC;

/// Physical address the AP startup trampoline is copied to. Must be
/// page-aligned and below 1 MiB so a SIPI can point at it.
pub const CONFIG_AP_TRAMPOLINE_PHYS: u64 = 0x1000;
