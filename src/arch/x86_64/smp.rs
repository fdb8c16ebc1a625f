/*
 * SMP Bringup
 *
 * Processor discovery follows the Intel MultiProcessor Specification:
 * scan the three canonical low-memory regions for the 16-byte-aligned
 * "_MP_" floating pointer structure, verify its checksum, and walk the
 * "PCMP" configuration table it points at. Processor entries yield each
 * CPU's local-APIC id and the BSP flag; the table header carries the
 * local APIC's physical base.
 *
 * Application processors start with the classic INIT/SIPI/SIPI dance.
 * The real-mode trampoline is copied to a fixed page below 1 MiB; the
 * two quadwords just below it carry the page-table root and the 64-bit
 * entry point. Each AP climbs to long mode in the trampoline, loads the
 * kernel's descriptor tables, allocates itself a stack, and enters the
 * scheduler bootstrap. The BSP waits for the booted flag with a
 * timeout; a silent AP is logged dead and left out of the CPU count.
 */

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use super::{gdt, idt, lapic};
use crate::config::{
    CONFIG_AP_BOOT_TIMEOUT_NS, CONFIG_AP_TRAMPOLINE_PHYS, CONFIG_NR_CPUS,
};
use crate::memory::{PAGE_SIZE, pa_to_va, page};
use crate::sched::cpu::CpuId;
use crate::time::counter;

/// MP floating pointer structure ("_MP_").
#[repr(C, packed)]
struct FloatingPointer {
    signature: [u8; 4],
    config_table: u32,
    length: u8,
    spec_rev: u8,
    checksum: u8,
    features1: u8,
    features2: u8,
    features3: [u8; 3],
}

/// MP configuration table header ("PCMP").
#[repr(C, packed)]
struct ConfigTable {
    signature: [u8; 4],
    base_length: u16,
    spec_rev: u8,
    checksum: u8,
    oem_id: [u8; 8],
    product_id: [u8; 12],
    oem_table_ptr: u32,
    oem_table_size: u16,
    entry_count: u16,
    lapic_base: u32,
    ext_length: u16,
    ext_checksum: u8,
    reserved: u8,
}

/// Processor entry (type 0) of the configuration table.
#[repr(C, packed)]
struct ProcessorEntry {
    entry_type: u8,
    lapic_id: u8,
    lapic_version: u8,
    cpu_flags: u8,
    signature: u32,
    features: u32,
    reserved: [u32; 2],
}

const ENTRY_TYPE_PROCESSOR: u8 = 0;
const ENTRY_TYPE_BUS: u8 = 1;
const ENTRY_TYPE_IOAPIC: u8 = 2;

const PROCESSOR_ENTRY_LEN: usize = 20;
const OTHER_ENTRY_LEN: usize = 8;

/// Processor entry flag: enabled.
const CPU_FLAG_ENABLED: u8 = 1 << 0;
/// Processor entry flag: bootstrap processor.
const CPU_FLAG_BSP: u8 = 1 << 1;

/// Sentinel in the apic-id map: no processor at this index.
const NO_APIC_ID: u16 = 0xFFFF;

/// Per-index local-APIC ids, lock-free because the scheduler's hottest
/// paths (current_cpu_index, IPI targeting) read them from interrupt
/// context.
static CPU_APIC_IDS: [AtomicU16; CONFIG_NR_CPUS] =
    [const { AtomicU16::new(NO_APIC_ID) }; CONFIG_NR_CPUS];
static CPU_IS_BSP: [AtomicBool; CONFIG_NR_CPUS] =
    [const { AtomicBool::new(false) }; CONFIG_NR_CPUS];

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);
static AP_BOOTED: AtomicBool = AtomicBool::new(false);
static AP_CPU_IDX: AtomicUsize = AtomicUsize::new(0);

/// Number of processors the MP table reported (1 without a table).
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst)
}

/// APIC id of a CPU index, for IPI targeting.
pub fn apic_id_of(cpu: CpuId) -> u8 {
    if cpu >= CONFIG_NR_CPUS {
        return 0;
    }
    match CPU_APIC_IDS[cpu].load(Ordering::SeqCst) {
        NO_APIC_ID => 0,
        id => id as u8,
    }
}

/// CPU index of a local-APIC id.
pub fn cpu_index_of_apic(apic_id: u8) -> Option<CpuId> {
    CPU_APIC_IDS
        .iter()
        .position(|id| id.load(Ordering::SeqCst) == apic_id as u16)
}

/// Scan one physical range for the floating pointer structure.
fn probe_range(start: u64, end: u64) -> Option<&'static FloatingPointer> {
    let mut addr = pa_to_va(start);
    let end = pa_to_va(end);
    while addr < end {
        let ptr = addr as *const u8;
        let sig = unsafe { core::slice::from_raw_parts(ptr, 4) };
        if sig == b"_MP_" {
            let bytes =
                unsafe { core::slice::from_raw_parts(ptr, core::mem::size_of::<FloatingPointer>()) };
            let checksum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            if checksum == 0 {
                log::info!("MP floating pointer structure at {:#x}", addr);
                return Some(unsafe { &*(ptr as *const FloatingPointer) });
            }
        }
        addr += 16;
    }
    None
}

/// Find the MP floating pointer in the canonical locations: low memory,
/// the top of base memory, and the BIOS ROM window.
fn probe() -> Option<&'static FloatingPointer> {
    probe_range(0x0, 0x8000)
        .or_else(|| probe_range(0x9F000, 0xA0000))
        .or_else(|| probe_range(0xF0000, 0x100000))
}

/// Discover processors. Without an MP table the system is treated as
/// uniprocessor.
pub fn init() {
    let Some(fp) = probe() else {
        log::info!("smp: no MP structure found, uniprocessor");
        return;
    };

    let config_table_pa = fp.config_table;
    if config_table_pa == 0 {
        log::warn!("smp: MP table without configuration table");
        return;
    }

    let config = unsafe { &*(pa_to_va(config_table_pa as u64) as *const ConfigTable) };
    if &config.signature != b"PCMP" {
        log::warn!("smp: bad signature in MP config table");
        return;
    }
    match config.spec_rev {
        1 => log::info!("smp: MP specification rev. 1.1"),
        4 => log::info!("smp: MP specification rev. 1.4"),
        rev => log::info!("smp: MP specification rev. unknown ({})", rev),
    }

    let lapic_base = config.lapic_base;
    lapic::set_base(lapic_base as u64);
    log::info!("smp: local APIC at {:#x}", lapic_base);

    let entry_count = config.entry_count;
    let mut cursor = pa_to_va(config_table_pa as u64) + core::mem::size_of::<ConfigTable>() as u64;
    let mut found = 0usize;

    for _ in 0..entry_count {
        let entry_type = unsafe { *(cursor as *const u8) };
        match entry_type {
            ENTRY_TYPE_PROCESSOR => {
                let entry = unsafe { &*(cursor as *const ProcessorEntry) };
                let flags = entry.cpu_flags;
                let apic_id = entry.lapic_id;
                if flags & CPU_FLAG_ENABLED != 0 && found < CONFIG_NR_CPUS {
                    CPU_APIC_IDS[found].store(apic_id as u16, Ordering::SeqCst);
                    CPU_IS_BSP[found].store(flags & CPU_FLAG_BSP != 0, Ordering::SeqCst);
                    log::info!(
                        "smp: cpu {} lapic_id {} {}",
                        found,
                        apic_id,
                        if flags & CPU_FLAG_BSP != 0 { "BSP" } else { "AP" }
                    );
                    found += 1;
                }
                cursor += PROCESSOR_ENTRY_LEN as u64;
            }
            ENTRY_TYPE_BUS | ENTRY_TYPE_IOAPIC => cursor += OTHER_ENTRY_LEN as u64,
            _ => cursor += OTHER_ENTRY_LEN as u64,
        }
    }

    if found == 0 {
        // The table existed but listed nothing usable; stay uniprocessor
        // with the boot CPU as entry 0.
        CPU_APIC_IDS[0].store(lapic::id() as u16, Ordering::SeqCst);
        CPU_IS_BSP[0].store(true, Ordering::SeqCst);
        found = 1;
    }

    // The rest of the kernel assumes the boot processor is CPU 0; some
    // firmware lists it elsewhere in the table.
    if let Some(bsp) = (0..found).find(|&i| CPU_IS_BSP[i].load(Ordering::SeqCst)) {
        if bsp != 0 {
            let a = CPU_APIC_IDS[0].load(Ordering::SeqCst);
            let b = CPU_APIC_IDS[bsp].load(Ordering::SeqCst);
            CPU_APIC_IDS[0].store(b, Ordering::SeqCst);
            CPU_APIC_IDS[bsp].store(a, Ordering::SeqCst);
            CPU_IS_BSP[0].store(true, Ordering::SeqCst);
            CPU_IS_BSP[bsp].store(false, Ordering::SeqCst);
        }
    }
    CPU_COUNT.store(found, Ordering::SeqCst);
    log::info!("smp: {} processor(s)", found);
}

/* AP trampoline */

core::arch::global_asm!(
    r#"
    .section .text.ap_trampoline, "ax"
    .global __ap_trampoline_start
    .global __ap_trampoline_end
    .code16
__ap_trampoline_start:
    cli
    cld

    // Temporary GDT lives inside the blob; everything is addressed
    // absolutely because the blob always runs at 0x1000.
    .set gdt_desc_off, 2f - __ap_trampoline_start
    lgdt [0x1000 + gdt_desc_off]

    // PAE on.
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax

    // Page-table root, written by the BSP at 0x1000 - 8.
    mov eax, [0x0FF8]
    mov cr3, eax

    // EFER.LME on.
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr

    // Protection and paging on together: straight to long mode.
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    // Far jump into the 64-bit code segment of the temporary GDT.
    // Hand-encoded jmp ptr16:32 (0x66 prefix for the 32-bit offset).
    .byte 0x66, 0xea
    .long 0x1000 + (3f - __ap_trampoline_start)
    .word 0x08

    .align 8
2:  // GDT descriptor followed by the GDT itself.
    .word (4f - 5f) - 1
    .long 0x1000 + (5f - __ap_trampoline_start)
    .align 8
5:
    .quad 0x0000000000000000
    .quad 0x00209A0000000000  // 64-bit code
    .quad 0x0000920000000000  // data
4:

    .code64
3:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    // Tiny temporary stack below the slot area; the Rust side swaps to
    // a real stack immediately.
    mov rsp, 0x0F00

    // Kernel entry point, written by the BSP at 0x1000 - 16.
    mov rax, [0x0FF0]
    call rax

    // The entry never returns.
1:  hlt
    jmp 1b
__ap_trampoline_end:
    "#
);

unsafe extern "C" {
    static __ap_trampoline_start: u8;
    static __ap_trampoline_end: u8;
}

/// 64-bit entry of every AP, called from the trampoline on its tiny
/// temporary stack: load the kernel tables, get a real stack, and hand
/// over to the scheduler bootstrap.
unsafe extern "C" fn ap_entry() -> ! {
    gdt::ap_init();
    idt::ap_init();

    let stack = page::page_alloc_contig(4);
    if stack.is_null() {
        log::error!("smp: AP could not allocate a stack");
        loop {
            x86_64::instructions::hlt();
        }
    }
    let stack_top = stack as u64 + 4 * PAGE_SIZE - 0x10;

    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "jmp {main}",
            stack = in(reg) stack_top,
            main = sym ap_main,
            options(noreturn)
        );
    }
}

/// Runs on the AP's real stack.
extern "C" fn ap_main() -> ! {
    let apic_id = {
        lapic::enable();
        lapic::id()
    };
    let cpu_idx = cpu_index_of_apic(apic_id).unwrap_or_else(|| {
        log::warn!("smp: AP with unknown lapic id {}", apic_id);
        0
    });
    AP_CPU_IDX.store(cpu_idx, Ordering::SeqCst);

    log::info!("smp: AP cpu{} (lapic {}) is up", cpu_idx, apic_id);
    crate::sched::ap_bootstrap(cpu_idx)
}

/// Called by the scheduler bootstrap once the AP is fully live.
pub fn signal_ap_booted() {
    AP_BOOTED.store(true, Ordering::SeqCst);
}

fn busy_wait_ns(ns: u64) {
    let deadline = counter::get_monotonic_ns() + ns;
    while counter::get_monotonic_ns() < deadline {
        core::hint::spin_loop();
    }
}

/// Copy the trampoline into low memory and fill the parameter slots.
fn install_trampoline() {
    let (start, end) = unsafe {
        (
            core::ptr::addr_of!(__ap_trampoline_start) as *const u8,
            core::ptr::addr_of!(__ap_trampoline_end) as *const u8,
        )
    };
    let size = end as usize - start as usize;

    let dest = pa_to_va(CONFIG_AP_TRAMPOLINE_PHYS) as *mut u8;
    unsafe {
        core::ptr::copy_nonoverlapping(start, dest, size);

        // Page-table root at 0x1000 - 8, entry point at 0x1000 - 16.
        let (cr3, _) = x86_64::registers::control::Cr3::read();
        let pml4_slot = pa_to_va(CONFIG_AP_TRAMPOLINE_PHYS - 8) as *mut u64;
        let entry_slot = pa_to_va(CONFIG_AP_TRAMPOLINE_PHYS - 16) as *mut u64;
        pml4_slot.write(cr3.start_address().as_u64());
        entry_slot.write(ap_entry as usize as u64);
    }

    log::info!(
        "smp: trampoline installed at {:#x} ({} bytes)",
        CONFIG_AP_TRAMPOLINE_PHYS,
        size
    );
}

/// Start every discovered application processor, one at a time.
pub fn start_aps() {
    let count = cpu_count();
    if count <= 1 {
        return;
    }
    if !lapic::is_available() {
        log::warn!("smp: no local APIC, cannot start APs");
        return;
    }

    install_trampoline();

    for idx in 0..count {
        let raw = CPU_APIC_IDS[idx].load(Ordering::SeqCst);
        if raw == NO_APIC_ID || CPU_IS_BSP[idx].load(Ordering::SeqCst) {
            continue;
        }
        let apic_id = raw as u8;

        AP_BOOTED.store(false, Ordering::SeqCst);
        log::info!("smp: starting AP cpu{} (lapic {})", idx, apic_id);

        lapic::send_init(apic_id);
        busy_wait_ns(10_000_000); // 10 ms after INIT

        lapic::send_startup(apic_id, CONFIG_AP_TRAMPOLINE_PHYS);
        busy_wait_ns(200_000); // 200 us between SIPIs
        lapic::send_startup(apic_id, CONFIG_AP_TRAMPOLINE_PHYS);

        // Bounded wait; a dead AP must not hang the boot.
        let deadline = counter::get_monotonic_ns() + CONFIG_AP_BOOT_TIMEOUT_NS;
        while !AP_BOOTED.load(Ordering::SeqCst) {
            if counter::get_monotonic_ns() > deadline {
                break;
            }
            core::hint::spin_loop();
        }

        if AP_BOOTED.load(Ordering::SeqCst) {
            log::info!("smp: AP cpu{} booted", idx);
        } else {
            log::error!("smp: AP cpu{} did not boot within timeout, excluded", idx);
            CPU_APIC_IDS[idx].store(NO_APIC_ID, Ordering::SeqCst);
        }
    }

    log::info!("smp: {} cpu(s) online", crate::sched::cpu::online_count());
}
