/*
 * Memory Management
 *
 * Two layers: the physical page allocator owns every usable frame of RAM,
 * and the kernel heap sits on one contiguous block borrowed from it.
 *
 * The loader maps all physical memory the kernel touches at a fixed
 * offset (identity, in the current configuration), so converting between
 * a physical frame and its kernel-visible address is plain arithmetic.
 */

pub mod heap;
pub mod page;

use crate::arch::x86_64::boot::BootInfo;
use crate::errno::{Errno, Result};

/// Frame and page size. Everything in the kernel assumes 4 KiB.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Offset of the kernel's physical-memory window. The loader identity-maps
/// low memory, so the offset is zero; a higher-half map only needs this
/// constant changed.
pub const PHYS_MAP_OFFSET: u64 = 0;

/// Kernel-visible address of a physical address.
#[inline]
pub const fn pa_to_va(pa: u64) -> u64 {
    pa + PHYS_MAP_OFFSET
}

/// Physical address behind a kernel-visible address.
#[inline]
pub const fn va_to_pa(va: u64) -> u64 {
    va - PHYS_MAP_OFFSET
}

/// Bring up the page allocator and then the heap, in that order.
pub fn init(boot_info: &BootInfo) -> Result<()> {
    let (start, end) = boot_info.usable_range().ok_or(Errno::OutOfMemory)?;
    log::info!("usable RAM: {:#x}-{:#x}", start, end);

    page::init(start, end);
    heap::init()
}
