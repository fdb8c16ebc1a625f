/*
 * Quartz Kernel Entry Point
 *
 * Boot order matters and is spelled out in kstart: console and logger
 * first so everything after can talk, descriptor tables before the
 * first possible fault, memory before anything that allocates, SMP
 * discovery before the APIC is used, the time stack before the tick,
 * and the scheduler before interrupts go live.
 */

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

extern crate alloc;
extern crate rlibc;

use core::panic::PanicInfo;

mod arch;
mod config;
mod drivers;
mod errno;
mod memory;
mod sched;
mod tests;
mod time;
#[macro_use]
mod utils;

use arch::x86_64::boot::BootInfo;
use config::NSECS_PER_SEC;

#[repr(C, align(16))]
pub struct AlignedBspStack([u8; 64 * 1024]);

#[unsafe(no_mangle)]
pub static mut BSP_STACK: AlignedBspStack = AlignedBspStack([0; 64 * 1024]);

/// Raw entry from the loader, already in long mode. The handoff magic
/// arrives in RDI and the boot-information pointer in RSI; both survive
/// the switch onto the kernel's own stack.
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "lea rax, [rip + BSP_STACK]",
        "add rax, {stack_size}",
        "mov rsp, rax",
        "jmp kstart",
        stack_size = const 64 * 1024,
    );
}

/// Rust-side kernel entry, on the BSP stack.
#[unsafe(no_mangle)]
pub extern "C" fn kstart(magic: u64, info: *const BootInfo) -> ! {
    drivers::serial::init();
    utils::logger::init();
    log::info!("Quartz kernel starting...");

    arch::x86_64::gdt::init();
    arch::x86_64::idt::init();
    arch::x86_64::pic::init();

    let boot_info = match unsafe { BootInfo::from_handoff(magic as u32, info) } {
        Some(bi) => bi,
        None => {
            log::error!("bad boot handoff (magic {:#x}); halting", magic);
            halt();
        }
    };

    if let Err(e) = memory::init(boot_info) {
        log::error!("memory initialization failed: {}", e);
        halt();
    }

    // Processor discovery publishes the local APIC base; the BSP's APIC
    // comes up right after.
    arch::x86_64::smp::init();
    arch::x86_64::lapic::enable();

    // Time stack: eventers register, the counter calibrates and is
    // seeded from the RTC, then the global tick binds.
    arch::x86_64::pit::init();
    arch::x86_64::lapic::init_timer_eventer();
    let wall_seed = arch::x86_64::rtc::read_utc_seconds() * NSECS_PER_SEC;
    if let Err(e) = time::counter::init(arch::x86_64::tsc::time_counter(), wall_seed) {
        log::error!("time counter initialization failed: {}", e);
        halt();
    }

    sched::init();

    if let Err(e) = time::eventer::tick_init() {
        log::error!("no usable tick eventer: {}", e);
        halt();
    }

    arch::x86_64::interrupts::enable();
    sched::enable();

    arch::x86_64::smp::start_aps();

    tests::run_all();

    for stat in sched::thread_stats() {
        log::info!(
            "thread {} '{}' {:?} prio {} cpu{} ran {} ms",
            stat.id,
            stat.name,
            stat.state,
            stat.priority,
            stat.cpu_idx,
            stat.run_ns / 1_000_000
        );
    }

    log::info!("boot complete; {} cpu(s) online", sched::cpu::online_count());

    // The boot thread has nothing left to do; idle politely.
    loop {
        sched::yield_now();
        x86_64::instructions::hlt();
    }
}

fn halt() -> ! {
    arch::x86_64::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::x86_64::interrupts::disable();
    serial_println!("\nKERNEL PANIC: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
