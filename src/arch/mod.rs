/*
 * Architecture Support
 *
 * Only x86-64 is implemented. The rest of the kernel reaches hardware
 * exclusively through this module.
 */

pub mod x86_64;
