/*
 * Kernel Heap
 *
 * Variable-size allocation for the rest of the kernel, layered on one
 * contiguous block requested from the page allocator at boot. The heap
 * core is linked_list_allocator's LockedHeap, which also serves as the
 * Rust global allocator so Box/Vec/BTreeMap work everywhere.
 *
 * The C-shaped surface kmalloc/kfree wraps the same pool and prefixes
 * every block with a small header carrying a magic value and the size, so
 * kfree of a foreign or already-freed pointer is detected and logged
 * instead of corrupting the pool.
 */

use core::alloc::Layout;

use linked_list_allocator::LockedHeap;

use crate::config::CONFIG_KHEAP_SIZE;
use crate::errno::{Errno, Result};
use crate::memory::{PAGE_SIZE, page};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Header in front of every kmalloc block.
#[repr(C)]
struct KmallocHeader {
    magic: u32,
    size: u32,
}

const KMALLOC_MAGIC: u32 = 0x4B4D_414C; // "KMAL"
const KMALLOC_FREED: u32 = 0x4B46_5245; // "KFRE"
const HEADER_SIZE: usize = 16; // keeps user data 16-byte aligned

/// Carve the heap block from the page allocator and initialize the pool.
pub fn init() -> Result<()> {
    let pages = CONFIG_KHEAP_SIZE / PAGE_SIZE as usize;
    let block = page::page_alloc_contig(pages);
    if block.is_null() {
        log::error!("kheap: cannot allocate {} contiguous pages", pages);
        return Err(Errno::OutOfMemory);
    }

    unsafe {
        ALLOCATOR.lock().init(block, CONFIG_KHEAP_SIZE);
    }

    log::info!(
        "kheap: {} KiB at {:p}",
        CONFIG_KHEAP_SIZE / 1024,
        block
    );
    Ok(())
}

/// Allocate `size` bytes, 16-byte aligned. Returns null when the pool is
/// exhausted or `size` is zero.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 || size > u32::MAX as usize {
        return core::ptr::null_mut();
    }

    let total = size + HEADER_SIZE;
    let layout = match Layout::from_size_align(total, 16) {
        Ok(layout) => layout,
        Err(_) => return core::ptr::null_mut(),
    };

    let raw = unsafe { alloc::alloc::alloc(layout) };
    if raw.is_null() {
        log::warn!("kmalloc: out of memory ({} bytes)", size);
        return core::ptr::null_mut();
    }

    unsafe {
        let header = raw as *mut KmallocHeader;
        (*header).magic = KMALLOC_MAGIC;
        (*header).size = size as u32;
        raw.add(HEADER_SIZE)
    }
}

/// Return a kmalloc block to the pool.
///
/// Double frees and foreign pointers fail the magic check; they are
/// logged and ignored so they cannot corrupt unrelated allocations.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    unsafe {
        let raw = ptr.sub(HEADER_SIZE);
        let header = raw as *mut KmallocHeader;
        match (*header).magic {
            KMALLOC_MAGIC => {
                let size = (*header).size as usize;
                (*header).magic = KMALLOC_FREED;
                let layout = Layout::from_size_align_unchecked(size + HEADER_SIZE, 16);
                alloc::alloc::dealloc(raw, layout);
            }
            KMALLOC_FREED => {
                log::error!("kfree: double free of {:p}", ptr);
            }
            magic => {
                log::error!("kfree: bad pointer {:p} (magic {:#x})", ptr, magic);
            }
        }
    }
}

/// (used bytes, free bytes) of the heap pool.
pub fn kheap_stats() -> (usize, usize) {
    let heap = ALLOCATOR.lock();
    (heap.used(), heap.free())
}

/// Rust-allocator failure is fatal in kernel context.
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
