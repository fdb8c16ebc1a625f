/*
 * In-Kernel Test Suites
 *
 * Run from the boot thread once the scheduler and the tick are live, so
 * the suites can spawn threads, block, and sleep like any other kernel
 * code. Each suite reports pass/fail counts into a shared report; the
 * runner prints a summary at the end.
 */

pub mod mutex_tests;
pub mod page_tests;
pub mod sched_tests;
pub mod timer_tests;

use crate::serial_println;

/// Accumulated results of one suite run.
pub struct TestReport {
    pub passed: usize,
    pub failed: usize,
}

impl TestReport {
    pub fn new() -> TestReport {
        TestReport {
            passed: 0,
            failed: 0,
        }
    }

    /// Record one check.
    pub fn check(&mut self, name: &str, ok: bool) {
        if ok {
            self.passed += 1;
            serial_println!("    [ok]   {}", name);
        } else {
            self.failed += 1;
            serial_println!("    [FAIL] {}", name);
        }
    }
}

fn run_suite(name: &str, report: &mut TestReport, suite: fn(&mut TestReport)) {
    serial_println!("  suite: {}", name);
    suite(report);
}

/// Execute every suite and print the summary.
pub fn run_all() {
    serial_println!("==== QUARTZ KERNEL TEST SUITE ====");
    let mut report = TestReport::new();

    run_suite("page allocator", &mut report, page_tests::run);
    run_suite("timer chain", &mut report, timer_tests::run);
    run_suite("scheduler", &mut report, sched_tests::run);
    run_suite("mutex", &mut report, mutex_tests::run);

    serial_println!(
        "==== RESULT: {} passed, {} failed ====",
        report.passed,
        report.failed
    );
    if report.failed > 0 {
        log::error!("test suite reported {} failure(s)", report.failed);
    }
}
