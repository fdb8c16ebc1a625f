/*
 * Interrupt Control
 *
 * Thin wrappers over the IF flag plus the ipl save/restore pairing the
 * scheduler uses around critical sections: a context switch records the
 * outgoing thread's interrupt state and the incoming thread resumes with
 * its own.
 */

use x86_64::instructions::interrupts;

/// Saved interrupt-priority level. On x86-64 this is just the IF flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipl {
    enabled: bool,
}

/// Enable interrupts globally.
pub fn enable() {
    interrupts::enable();
}

/// Disable interrupts globally.
pub fn disable() {
    interrupts::disable();
}

/// Check whether interrupts are currently enabled.
pub fn are_enabled() -> bool {
    interrupts::are_enabled()
}

/// Disable interrupts and return the previous level for `restore`.
pub fn disable_and_save() -> Ipl {
    let enabled = are_enabled();
    if enabled {
        disable();
    }
    Ipl { enabled }
}

/// Restore a level previously returned by `disable_and_save`.
pub fn restore(ipl: Ipl) {
    if ipl.enabled {
        enable();
    }
}

/// Run a closure with interrupts disabled, restoring the prior state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

/// RAII guard that disables interrupts for its lifetime.
pub struct DisableInterrupts {
    ipl: Ipl,
}

impl DisableInterrupts {
    pub fn new() -> Self {
        Self {
            ipl: disable_and_save(),
        }
    }
}

impl Drop for DisableInterrupts {
    fn drop(&mut self) {
        restore(self.ipl);
    }
}
