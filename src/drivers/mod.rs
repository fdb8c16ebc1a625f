/*
 * Device Drivers
 *
 * The kernel core only consumes one device directly: the serial port,
 * as the diagnostic byte sink. Everything else the core touches
 * (PIC, local APIC, PIT, RTC, TSC) is architecture plumbing under arch/.
 */

pub mod serial;
