/*
 * Firmware Handoff
 *
 * The loader leaves the kernel a Multiboot-style information record: a
 * magic value naming the protocol and a memory map describing each
 * physical range as free, reserved, ACPI-reclaimable, ACPI NVS, or bad.
 * This module validates the handoff and turns the map into the single
 * (start, end) range the page allocator is initialized with.
 *
 * The 32-bit loader shim that produces this record is external platform
 * glue; by the time _start runs we are already in long mode.
 */

use crate::memory::PAGE_SIZE;

/// Magic value the loader passes to identify the boot protocol.
pub const BOOT_MAGIC: u32 = 0x2BAD_B002;

/// Info record flag: the memory map fields are valid.
const INFO_FLAG_MMAP: u32 = 1 << 6;

/// Kind of a physical memory range, as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Free,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    Bad,
}

impl RegionKind {
    fn from_raw(raw: u32) -> RegionKind {
        match raw {
            1 => RegionKind::Free,
            3 => RegionKind::AcpiReclaim,
            4 => RegionKind::AcpiNvs,
            5 => RegionKind::Bad,
            _ => RegionKind::Reserved,
        }
    }
}

/// Boot information record. Only the fields the kernel consumes are
/// spelled out; the layout up to the memory map matches the protocol.
#[repr(C, packed)]
pub struct BootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

/// One memory-map entry. `size` is the length of the entry minus its own
/// size field, so entries are walked by `size + 4`.
#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    kind: u32,
}

/// A decoded memory range.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// Iterate the memory map of a validated boot record.
pub struct RegionIter {
    cursor: u64,
    end: u64,
}

impl Iterator for RegionIter {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        if self.cursor >= self.end {
            return None;
        }
        let entry = unsafe { &*(self.cursor as *const MmapEntry) };
        // Copy packed fields to locals to avoid unaligned references.
        let size = entry.size;
        let region = Region {
            base: entry.base_addr,
            length: entry.length,
            kind: RegionKind::from_raw(entry.kind),
        };
        self.cursor += size as u64 + 4;
        Some(region)
    }
}

impl BootInfo {
    /// Validate the handoff magic and map presence.
    ///
    /// # Safety
    /// `info` must point at the record the loader handed over.
    pub unsafe fn from_handoff(magic: u32, info: *const BootInfo) -> Option<&'static BootInfo> {
        if magic != BOOT_MAGIC || info.is_null() {
            return None;
        }
        let info = unsafe { &*info };
        if info.flags & INFO_FLAG_MMAP == 0 {
            return None;
        }
        Some(info)
    }

    pub fn regions(&self) -> RegionIter {
        RegionIter {
            cursor: self.mmap_addr as u64,
            end: self.mmap_addr as u64 + self.mmap_length as u64,
        }
    }

    /// Pick the physical range handed to the page allocator: the largest
    /// free region, clipped below the kernel image so the allocator never
    /// hands out frames the kernel itself occupies.
    pub fn usable_range(&self) -> Option<(u64, u64)> {
        unsafe extern "C" {
            static __bss_end: u8;
        }

        let kernel_end = {
            let end = unsafe { core::ptr::addr_of!(__bss_end) } as u64;
            (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
        };

        let mut best: Option<(u64, u64)> = None;
        for region in self.regions() {
            if region.kind != RegionKind::Free {
                continue;
            }
            let mut start = region.base;
            let end = region.base + region.length;
            if start < kernel_end {
                start = kernel_end;
            }
            if end <= start {
                continue;
            }
            log::info!(
                "mmap: free region {:#x}-{:#x} ({} KiB usable)",
                region.base,
                end,
                (end - start) / 1024
            );
            match best {
                Some((s, e)) if e - s >= end - start => {}
                _ => best = Some((start, end)),
            }
        }
        best
    }
}
