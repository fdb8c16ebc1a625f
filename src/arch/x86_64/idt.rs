/*
 * Interrupt Descriptor Table
 *
 * All 256 vectors are owned here. CPU exceptions get logging handlers
 * (fatal ones halt), the context-switch vectors point at the naked stubs
 * from context.rs, and the remaining legacy lines route through a
 * dynamic table that irq_register/irq_unregister maintain by vector
 * number.
 *
 * Vector plan: 0-31 exceptions, 32-47 remapped PIC lines (32 is the PIT
 * tick), 0x81/0x82 yield and reschedule software interrupts, 0xF0-0xF3
 * local APIC timer / spurious / generic IPI / reschedule IPI.
 */

use heapless::String;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{context, lapic, pic, vectors};
use crate::config::NAME_MAX;
use crate::errno::{Errno, Result};

/// A registered interrupt handler; receives its vector number.
pub type IrqHandler = fn(vector: u8);

struct IrqEntry {
    name: String<NAME_MAX>,
    handler: IrqHandler,
}

static IRQ_TABLE: Mutex<[Option<IrqEntry>; 256]> = Mutex::new([const { None }; 256]);

/// Attach a handler to a free, registrable vector.
pub fn irq_register(vector: u8, name: &str, handler: IrqHandler) -> Result<()> {
    if is_reserved(vector) {
        return Err(Errno::InvalidArgument);
    }
    let mut owned: String<NAME_MAX> = String::new();
    let _ = owned.push_str(name);
    super::interrupts::without_interrupts(|| {
        let mut table = IRQ_TABLE.lock();
        if table[vector as usize].is_some() {
            return Err(Errno::Busy);
        }
        table[vector as usize] = Some(IrqEntry {
            name: owned,
            handler,
        });
        Ok(())
    })?;
    if pic::handles_vector(vector) {
        pic::unmask_line(vector - vectors::IRQ_BASE);
    }
    log::info!("irq {} registered as '{}'", vector, name);
    Ok(())
}

/// Detach the handler of a vector.
pub fn irq_unregister(vector: u8) -> Result<()> {
    let taken = super::interrupts::without_interrupts(|| {
        IRQ_TABLE.lock()[vector as usize].take()
    });
    match taken {
        Some(_) => {
            if pic::handles_vector(vector) {
                pic::mask_line(vector - vectors::IRQ_BASE);
            }
            Ok(())
        }
        None => Err(Errno::NotFound),
    }
}

/// Vectors the kernel wires statically and refuses to hand out. The
/// generic IPI vector stays registrable; its handler runs through the
/// dynamic table like a legacy line.
fn is_reserved(vector: u8) -> bool {
    vector < 32
        || vector == vectors::PIT_TIMER
        || vector == vectors::YIELD
        || vector == vectors::RESCHED_SOFT
        || vector == vectors::LAPIC_TIMER
        || vector == vectors::LAPIC_SPURIOUS
        || vector == vectors::IPI_RESCHEDULE
}

fn dispatch_irq(vector: u8) {
    let handler = {
        let table = IRQ_TABLE.lock();
        table[vector as usize].as_ref().map(|e| e.handler)
    };
    match handler {
        Some(handler) => handler(vector),
        None => log::warn!("spurious irq on vector {}", vector),
    }
}

/// Stub for one legacy PIC line: dispatch, then EOI.
macro_rules! legacy_irq_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch_irq($vector);
            pic::end_of_interrupt($vector);
        }
    };
}

legacy_irq_handler!(irq33_handler, 33);
legacy_irq_handler!(irq34_handler, 34);
legacy_irq_handler!(irq35_handler, 35);
legacy_irq_handler!(irq36_handler, 36);
legacy_irq_handler!(irq37_handler, 37);
legacy_irq_handler!(irq38_handler, 38);
legacy_irq_handler!(irq39_handler, 39);
legacy_irq_handler!(irq40_handler, 40);
legacy_irq_handler!(irq41_handler, 41);
legacy_irq_handler!(irq42_handler, 42);
legacy_irq_handler!(irq43_handler, 43);
legacy_irq_handler!(irq44_handler, 44);
legacy_irq_handler!(irq45_handler, 45);
legacy_irq_handler!(irq46_handler, 46);
legacy_irq_handler!(irq47_handler, 47);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        // Context-switch vectors take the naked stubs directly.
        unsafe {
            idt[vectors::PIT_TIMER].set_handler_addr(x86_64::VirtAddr::new(
                context::pit_tick_stub as usize as u64,
            ));
            idt[vectors::YIELD].set_handler_addr(x86_64::VirtAddr::new(
                context::yield_stub as usize as u64,
            ));
            idt[vectors::RESCHED_SOFT].set_handler_addr(x86_64::VirtAddr::new(
                context::resched_soft_stub as usize as u64,
            ));
            idt[vectors::LAPIC_TIMER].set_handler_addr(x86_64::VirtAddr::new(
                context::lapic_tick_stub as usize as u64,
            ));
            idt[vectors::IPI_RESCHEDULE].set_handler_addr(x86_64::VirtAddr::new(
                context::resched_ipi_stub as usize as u64,
            ));
        }

        idt[vectors::LAPIC_SPURIOUS].set_handler_fn(lapic_spurious_handler);
        idt[vectors::IPI_GENERIC].set_handler_fn(generic_ipi_handler);

        // The rest of the legacy lines feed the dynamic table.
        idt[33].set_handler_fn(irq33_handler);
        idt[34].set_handler_fn(irq34_handler);
        idt[35].set_handler_fn(irq35_handler);
        idt[36].set_handler_fn(irq36_handler);
        idt[37].set_handler_fn(irq37_handler);
        idt[38].set_handler_fn(irq38_handler);
        idt[39].set_handler_fn(irq39_handler);
        idt[40].set_handler_fn(irq40_handler);
        idt[41].set_handler_fn(irq41_handler);
        idt[42].set_handler_fn(irq42_handler);
        idt[43].set_handler_fn(irq43_handler);
        idt[44].set_handler_fn(irq44_handler);
        idt[45].set_handler_fn(irq45_handler);
        idt[46].set_handler_fn(irq46_handler);
        idt[47].set_handler_fn(irq47_handler);

        idt
    };
}

/// Load the IDT on the boot processor.
pub fn init() {
    IDT.load();
    log::info!("IDT loaded (256 vectors)");
}

/// Load the shared IDT on an application processor.
pub fn ap_init() {
    IDT.load();
}

/* Exception handlers */

fn fatal(name: &str, frame: &InterruptStackFrame) -> ! {
    log::error!("fatal exception: {} at {:?}", name, frame.instruction_pointer);
    loop {
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fatal("divide error", &frame);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fatal("invalid opcode", &frame);
}

/// The lazy-FPU trap: first FPU use after a context switch.
extern "x86-interrupt" fn device_not_available_handler(_frame: InterruptStackFrame) {
    crate::sched::fpu_trap();
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    fatal("double fault", &frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, code: u64) {
    log::error!("general protection fault, error code {:#x}", code);
    fatal("general protection fault", &frame);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    // A page fault on a kernel thread is unrecoverable in this design.
    match Cr2::read() {
        Ok(addr) => log::error!("page fault at {:?}, error {:?}", addr, code),
        Err(_) => log::error!("page fault with invalid CR2, error {:?}", code),
    }
    fatal("page fault", &frame);
}

extern "x86-interrupt" fn lapic_spurious_handler(_frame: InterruptStackFrame) {
    // No EOI for spurious interrupts.
}

extern "x86-interrupt" fn generic_ipi_handler(_frame: InterruptStackFrame) {
    dispatch_irq(vectors::IPI_GENERIC);
    lapic::eoi();
}
