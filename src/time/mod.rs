/*
 * Time Subsystem
 *
 * Three layers, bottom up:
 *
 * - counter: a free-running hardware counter (TSC) accumulated into
 *   64-bit nanosecond wall time, seeded from the RTC at boot.
 * - eventer: programmable interrupt sources (PIT, local APIC timer) behind
 *   one registration/selection interface; one of them drives the global
 *   tick.
 * - timer: a chain of absolute-expiry timer nodes processed from the tick,
 *   plus POSIX-shaped interval timers.
 */

pub mod counter;
pub mod eventer;
pub mod timer;
