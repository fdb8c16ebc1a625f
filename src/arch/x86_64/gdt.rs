/*
 * Global Descriptor Table
 *
 * Flat kernel-only segmentation: one code segment, one data segment, and a
 * TSS carrying the double-fault interrupt stack. There is no user mode in
 * this kernel, so no ring-3 descriptors. Application processors load the
 * same table through `ap_init`.
 */

use lazy_static::lazy_static;
use x86_64::{
    VirtAddr,
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

            let stack_start = VirtAddr::from_ptr(&raw const STACK);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

fn load_and_reload_segments(load_tss_too: bool) {
    use x86_64::instructions::{
        segmentation::{CS, DS, ES, FS, GS, SS, Segment},
        tables::load_tss,
    };

    GDT.0.load();

    unsafe {
        // Every segment register must point into the new table before the
        // first interrupt fires.
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);

        if load_tss_too {
            load_tss(GDT.1.tss_selector);
        }
    }
}

/// Load the GDT on the boot processor.
pub fn init() {
    log::info!("Loading GDT...");
    load_and_reload_segments(true);
    log::info!("GDT initialized");
}

/// Load the shared GDT on an application processor.
///
/// The TSS is a per-package singleton here; only the BSP owns it. APs run
/// with the kernel segments and no IST until they have per-CPU state.
pub fn ap_init() {
    load_and_reload_segments(false);
}

/// Kernel code segment selector, for building interrupt frames.
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// Kernel data segment selector, for building interrupt frames.
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.data_selector
}
