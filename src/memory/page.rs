/*
 * Physical Page Allocator
 *
 * All usable RAM is split into 4 KiB frames tracked by a frame table
 * carved from the low end of the managed range. Each frame record is in
 * one of four states:
 *
 * - Available:   on the free list
 * - Allocated:   a single-frame allocation
 * - Chained:     part of a contiguous run, not the last frame
 * - ChainedLast: final frame of a contiguous run
 *
 * The free list is intrusive: records link to each other by frame index,
 * so the allocator works before (and underneath) the heap. Single
 * allocations pop the free head; contiguous allocations scan the table
 * linearly for a run of Available frames. `page_free` recovers the
 * allocation's extent purely from the frame states, so one entry point
 * frees both kinds.
 */

use spin::Mutex;

use crate::memory::{PAGE_MASK, PAGE_SIZE, pa_to_va, va_to_pa};

/// State of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStatus {
    Available,
    Allocated,
    Chained,
    ChainedLast,
}

/// Null link in the intrusive free list.
const NIL: u32 = u32::MAX;

/// One frame record. 24 bytes; the table for a gigabyte of RAM costs
/// about 6 MiB.
struct PageFrame {
    phys_addr: u64,
    status: FrameStatus,
    next_free: u32,
    prev_free: u32,
}

struct FrameTable {
    frames: &'static mut [PageFrame],
    free_head: u32,
    free_tail: u32,
    free_count: usize,
    /// Physical address of frame 0.
    lowest_addr: u64,
    bytes_allocated: usize,
}

impl FrameTable {
    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let f = &self.frames[idx as usize];
            (f.prev_free, f.next_free)
        };
        if prev == NIL {
            self.free_head = next;
        } else {
            self.frames[prev as usize].next_free = next;
        }
        if next == NIL {
            self.free_tail = prev;
        } else {
            self.frames[next as usize].prev_free = prev;
        }
        let f = &mut self.frames[idx as usize];
        f.next_free = NIL;
        f.prev_free = NIL;
        self.free_count -= 1;
    }

    fn push_free(&mut self, idx: u32) {
        {
            let f = &mut self.frames[idx as usize];
            f.status = FrameStatus::Available;
            f.next_free = NIL;
            f.prev_free = self.free_tail;
        }
        if self.free_tail == NIL {
            self.free_head = idx;
        } else {
            self.frames[self.free_tail as usize].next_free = idx;
        }
        self.free_tail = idx;
        self.free_count += 1;
    }

    fn pop_free(&mut self) -> Option<u32> {
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        Some(idx)
    }

    /// Frame index of a kernel-visible address previously returned by the
    /// allocator, or None if it is out of range.
    fn index_of(&self, addr: u64) -> Option<usize> {
        let pa = va_to_pa(addr & PAGE_MASK);
        if pa < self.lowest_addr {
            return None;
        }
        let index = ((pa - self.lowest_addr) / PAGE_SIZE) as usize;
        if index >= self.frames.len() {
            return None;
        }
        Some(index)
    }
}

static FRAME_TABLE: Mutex<Option<FrameTable>> = Mutex::new(None);

/// Initialize the allocator over the physical range [first, last).
///
/// The frame table itself is carved from the low end of the range; every
/// frame above it goes on the free list.
pub fn init(first_address: u64, last_address: u64) {
    let first_address = (first_address + PAGE_SIZE - 1) & PAGE_MASK;
    let rough_frames = ((last_address - first_address) / PAGE_SIZE) as usize;

    // Carve the table, then recompute how many frames remain above it.
    let table_bytes = rough_frames * core::mem::size_of::<PageFrame>();
    let lowest_addr = (first_address + table_bytes as u64 + PAGE_SIZE - 1) & PAGE_MASK;
    let frames_available = ((last_address - lowest_addr) / PAGE_SIZE) as usize;

    log::info!(
        "page_alloc: {} frames available, table at {:#x}, frames from {:#x}",
        frames_available,
        first_address,
        lowest_addr
    );

    let frames: &'static mut [PageFrame] = unsafe {
        core::slice::from_raw_parts_mut(pa_to_va(first_address) as *mut PageFrame, frames_available)
    };

    let mut table = FrameTable {
        frames,
        free_head: NIL,
        free_tail: NIL,
        free_count: 0,
        lowest_addr,
        bytes_allocated: 0,
    };

    for i in 0..frames_available {
        table.frames[i] = PageFrame {
            phys_addr: lowest_addr + i as u64 * PAGE_SIZE,
            status: FrameStatus::Available,
            next_free: NIL,
            prev_free: NIL,
        };
    }
    for i in 0..frames_available {
        table.push_free(i as u32);
    }

    *FRAME_TABLE.lock() = Some(table);
    log::info!("page_alloc: initialized");
}

/// Allocate one frame. Returns its kernel-visible address, or null when
/// memory is exhausted.
pub fn page_alloc() -> *mut u8 {
    let mut guard = FRAME_TABLE.lock();
    let Some(table) = guard.as_mut() else {
        return core::ptr::null_mut();
    };

    match table.pop_free() {
        Some(idx) => {
            let frame = &mut table.frames[idx as usize];
            if frame.status != FrameStatus::Available {
                log::error!(
                    "page_alloc: frame {:#x} on free list with status {:?}",
                    frame.phys_addr,
                    frame.status
                );
            }
            frame.status = FrameStatus::Allocated;
            let addr = frame.phys_addr;
            table.bytes_allocated += PAGE_SIZE as usize;
            pa_to_va(addr) as *mut u8
        }
        None => {
            log::warn!("page_alloc: no free frame");
            core::ptr::null_mut()
        }
    }
}

/// Allocate `num_pages` physically contiguous frames. Returns the
/// kernel-visible address of the first frame, or null if no such run
/// exists.
pub fn page_alloc_contig(num_pages: usize) -> *mut u8 {
    if num_pages == 0 {
        return core::ptr::null_mut();
    }

    let mut guard = FRAME_TABLE.lock();
    let Some(table) = guard.as_mut() else {
        return core::ptr::null_mut();
    };

    let total = table.frames.len();
    let mut run_start = 0usize;
    let mut run_len = 0usize;

    for idx in 0..total {
        if table.frames[idx].status == FrameStatus::Available {
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == num_pages {
                for i in run_start..run_start + num_pages {
                    table.unlink(i as u32);
                    table.frames[i].status = if i == run_start + num_pages - 1 {
                        FrameStatus::ChainedLast
                    } else {
                        FrameStatus::Chained
                    };
                }
                table.bytes_allocated += num_pages * PAGE_SIZE as usize;
                let addr = table.frames[run_start].phys_addr;
                return pa_to_va(addr) as *mut u8;
            }
        } else {
            run_len = 0;
        }
    }

    log::warn!("page_alloc_contig: no run of {} free frames", num_pages);
    core::ptr::null_mut()
}

/// Free frames starting at `index` that form a contiguous run.
fn free_contig(table: &mut FrameTable, index: usize) {
    let mut curr = index;
    loop {
        let status = table.frames[curr].status;
        match status {
            FrameStatus::Chained => {
                table.push_free(curr as u32);
                table.bytes_allocated -= PAGE_SIZE as usize;
                curr += 1;
            }
            FrameStatus::ChainedLast => {
                table.push_free(curr as u32);
                table.bytes_allocated -= PAGE_SIZE as usize;
                break;
            }
            _ => {
                log::error!(
                    "page_free: run at index {} broken by status {:?} at {}",
                    index,
                    status,
                    curr
                );
                break;
            }
        }
    }
}

/// Free an allocation made by `page_alloc` or `page_alloc_contig`.
///
/// The frame record's state decides whether one frame or a whole run is
/// released. Freeing an address whose frame is Available is a programming
/// error: it is logged and ignored.
pub fn page_free(addr: *mut u8) {
    if addr.is_null() {
        log::warn!("page_free: null address");
        return;
    }

    let mut guard = FRAME_TABLE.lock();
    let Some(table) = guard.as_mut() else {
        return;
    };

    let Some(index) = table.index_of(addr as u64) else {
        log::warn!("page_free: out of range address {:p}", addr);
        return;
    };

    match table.frames[index].status {
        FrameStatus::Allocated => {
            table.push_free(index as u32);
            table.bytes_allocated -= PAGE_SIZE as usize;
        }
        FrameStatus::Chained | FrameStatus::ChainedLast => free_contig(table, index),
        FrameStatus::Available => {
            log::error!("page_free: double free of {:p}", addr);
        }
    }
}

/// (free frames, total frames, bytes allocated).
pub fn page_stats() -> (usize, usize, usize) {
    let guard = FRAME_TABLE.lock();
    match guard.as_ref() {
        Some(table) => (table.free_count, table.frames.len(), table.bytes_allocated),
        None => (0, 0, 0),
    }
}
