/*
 * Context Switching
 *
 * Every switch rides an interrupt: hardware tick, reschedule IPI, or the
 * yield/reschedule software interrupts. The CPU pushes the interrupt
 * frame, the naked stubs below push the general-purpose registers, and
 * the resulting InterruptContext on the stack is handed to the
 * scheduler. The scheduler returns a pointer to the context to resume;
 * the stub switches RSP to it, pops everything back, and iretq lands in
 * the chosen thread with its own interrupt state.
 *
 * FPU state is not part of the switch. The TS flag is armed instead, and
 * the first FPU instruction of the incoming thread traps to the
 * device-not-available handler, which shuffles the fxsave areas.
 */

use core::arch::naked_asm;

use x86_64::registers::control::{Cr0, Cr0Flags};

use super::vectors;
use crate::sched::thread::FpuState;

/// The frame the CPU pushes on interrupt entry, popped by iretq.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Default for InterruptFrame {
    fn default() -> Self {
        Self {
            rip: 0,
            cs: 0x08,      // kernel code segment
            rflags: 0x202, // IF set, reserved bit 1 always set
            rsp: 0,
            ss: 0x10, // kernel data segment
        }
    }
}

/// Full CPU context captured at a switch: the general-purpose registers
/// pushed by the stubs (r15 lowest, so RSP points at the struct start)
/// followed by the CPU-pushed interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub iret_frame: InterruptFrame,
}

impl Default for InterruptContext {
    fn default() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            iret_frame: InterruptFrame::default(),
        }
    }
}

/// Generate a naked switch stub for one vector. The stub builds an
/// InterruptContext on the stack, calls the scheduler's switch entry
/// with (context, vector), and resumes whatever context comes back.
macro_rules! switch_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                // RSP now points at a complete InterruptContext.
                "mov rdi, rsp",
                "mov rsi, {vector}",
                "call {switch}",
                // RAX: context to resume.
                "mov rsp, rax",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rbp",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rbx",
                "pop rax",
                "iretq",
                vector = const $vector as u64,
                switch = sym crate::sched::switch_from_interrupt,
            )
        }
    };
}

switch_stub!(pit_tick_stub, vectors::PIT_TIMER);
switch_stub!(lapic_tick_stub, vectors::LAPIC_TIMER);
switch_stub!(yield_stub, vectors::YIELD);
switch_stub!(resched_soft_stub, vectors::RESCHED_SOFT);
switch_stub!(resched_ipi_stub, vectors::IPI_RESCHEDULE);

/* Lazy FPU plumbing */

/// Arm the device-not-available trap: the next FPU instruction faults.
pub fn fpu_set_ts() {
    unsafe {
        Cr0::update(|flags| flags.insert(Cr0Flags::TASK_SWITCHED));
    }
}

/// Disarm the trap; the current thread owns the FPU.
pub fn fpu_clear_ts() {
    unsafe {
        Cr0::update(|flags| flags.remove(Cr0Flags::TASK_SWITCHED));
    }
}

/// Save the live FPU/SSE state into a thread's save area.
pub fn fpu_save(area: &mut FpuState) {
    unsafe {
        core::arch::asm!(
            "fxsave64 [{}]",
            in(reg) area.0.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
}

/// Load a thread's saved FPU/SSE state.
pub fn fpu_restore(area: &FpuState) {
    unsafe {
        core::arch::asm!(
            "fxrstor64 [{}]",
            in(reg) area.0.as_ptr(),
            options(nostack, preserves_flags)
        );
    }
}

/// Put the FPU into a clean state for a thread's first use.
pub fn fpu_init_clean() {
    unsafe {
        core::arch::asm!("fninit", options(nostack, preserves_flags));
    }
}
