/*
 * Page Allocator and Heap Tests
 *
 * Exercises the observable contracts: frame-aligned results, free-list
 * round trips, contiguity of multi-frame runs, non-overlap with other
 * live allocations, and the kmalloc header checks.
 */

use super::TestReport;
use crate::memory::PAGE_SIZE;
use crate::memory::heap::{kfree, kmalloc};
use crate::memory::page::{page_alloc, page_alloc_contig, page_free, page_stats};

pub fn run(report: &mut TestReport) {
    single_frame_roundtrip(report);
    contig_runs(report);
    no_overlap(report);
    double_free_is_harmless(report);
    kmalloc_basics(report);
}

fn single_frame_roundtrip(report: &mut TestReport) {
    let (free_before, _, _) = page_stats();

    let p = page_alloc();
    report.check("page_alloc returns a frame", !p.is_null());
    report.check(
        "page_alloc result is frame-aligned",
        p as u64 & (PAGE_SIZE - 1) == 0,
    );

    // The frame is ours: writing it must not disturb anything.
    unsafe {
        core::ptr::write_bytes(p, 0xA5, PAGE_SIZE as usize);
    }

    page_free(p);
    let (free_after, _, _) = page_stats();
    report.check(
        "free-list length restored after alloc/free",
        free_before == free_after,
    );
}

fn contig_runs(report: &mut TestReport) {
    let (free_before, _, _) = page_stats();

    let run = page_alloc_contig(4);
    report.check("page_alloc_contig(4) succeeds", !run.is_null());
    if run.is_null() {
        return;
    }

    // Touch every frame of the run; contiguity means plain offsets.
    for i in 0..4 {
        unsafe {
            let frame = run.add(i * PAGE_SIZE as usize);
            core::ptr::write_bytes(frame, 0x5A, PAGE_SIZE as usize);
        }
    }

    // One free releases the whole run.
    page_free(run);
    let (free_after, _, _) = page_stats();
    report.check(
        "contig run fully returned by one page_free",
        free_before == free_after,
    );
}

fn no_overlap(report: &mut TestReport) {
    let run = page_alloc_contig(3);
    let single = page_alloc();
    if run.is_null() || single.is_null() {
        report.check("allocations for overlap test", false);
        return;
    }

    let run_start = run as u64;
    let run_end = run_start + 3 * PAGE_SIZE;
    let single_addr = single as u64;
    report.check(
        "contig run does not overlap another live allocation",
        single_addr < run_start || single_addr >= run_end,
    );

    page_free(single);
    page_free(run);
}

fn double_free_is_harmless(report: &mut TestReport) {
    let (free_before, _, _) = page_stats();
    let p = page_alloc();
    page_free(p);
    // Second free of the same frame is a logged error, not corruption.
    page_free(p);
    let (free_after, _, _) = page_stats();
    report.check(
        "double page_free leaves the free list intact",
        free_before == free_after,
    );
}

fn kmalloc_basics(report: &mut TestReport) {
    let p = kmalloc(100);
    report.check("kmalloc returns memory", !p.is_null());
    report.check("kmalloc result is 16-byte aligned", p as usize % 16 == 0);

    unsafe {
        core::ptr::write_bytes(p, 0x42, 100);
        report.check("kmalloc memory is writable", *p == 0x42);
    }

    kfree(p);
    // Double free fails the magic check and is ignored.
    kfree(p);

    // The pool still works afterwards.
    let q = kmalloc(64);
    report.check("heap survives a double kfree", !q.is_null());
    kfree(q);

    report.check("kmalloc(0) is rejected", kmalloc(0).is_null());
}
