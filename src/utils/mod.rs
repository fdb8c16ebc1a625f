/*
 * Kernel Utilities
 *
 * Logging infrastructure and the serial print macros that back it.
 */

pub mod logger;
#[macro_use]
pub mod macros;
