//! Diagnostic suite runner.
//!
//! Suites register themselves into the `.test_registry` link section via
//! `define_test_suite!`; the embedding boot environment collects the
//! section bounds (the linker's `__start_test_registry` /
//! `__stop_test_registry` symbols) and hands them to [`tests_run_all`]
//! after bringing up the serial console, the HHDM offset and the page
//! allocator.
//!
//! Linking this crate is what pulls the suites of `vtprobe-drivers` and
//! `vtprobe-mm` into the registry.

#![no_std]

use core::ffi::CStr;

use vtprobe_lib::klog_info;
pub use vtprobe_lib::testing::{
    HARNESS_MAX_SUITES, TestConfig, TestRunSummary, TestSuiteDesc, TestSuiteResult, Verbosity,
};

// Referencing the suite-bearing crates keeps their registry entries in the
// link even though nothing calls into them directly.
pub use vtprobe_drivers as drivers;
pub use vtprobe_mm as mm;

fn suite_name(result: &TestSuiteResult) -> &str {
    if result.name.is_null() {
        return "?";
    }
    // SAFETY: suite names come from `define_test_suite!`, which embeds a
    // NUL-terminated string literal in static memory.
    unsafe { CStr::from_ptr(result.name) }
        .to_str()
        .unwrap_or("?")
}

/// Run every registered suite and aggregate the results.
///
/// Returns 0 when every test passed (skips allowed), -1 otherwise.
pub fn tests_run_all(
    config: &TestConfig,
    summary: &mut TestRunSummary,
    registry_start: *const TestSuiteDesc,
    registry_end: *const TestSuiteDesc,
) -> i32 {
    *summary = TestRunSummary::default();

    if !config.enabled {
        klog_info!("TESTS: harness disabled");
        return 0;
    }

    klog_info!("TESTS: starting test suites");

    let mut cursor = registry_start;
    while cursor < registry_end && summary.suite_count < HARNESS_MAX_SUITES {
        // SAFETY: the caller passes the bounds of the `.test_registry`
        // section, an array of `TestSuiteDesc` records.
        let desc = unsafe { &*cursor };
        cursor = unsafe { cursor.add(1) };

        let Some(run) = desc.run else {
            continue;
        };

        let mut result = TestSuiteResult::default();
        run(&mut result);

        klog_info!(
            "TESTS: suite {}: {}/{} passed, {} failed, {} skipped ({} ms)",
            suite_name(&result),
            result.passed,
            result.total,
            result.failed,
            result.skipped,
            result.elapsed_ms
        );

        summary.suites[summary.suite_count] = result;
        summary.suite_count += 1;
        summary.add_suite_result(&result);
    }

    klog_info!(
        "TESTS: {} suites, {} tests: {} passed, {} failed, {} skipped",
        summary.suite_count,
        summary.total_tests,
        summary.passed,
        summary.failed,
        summary.skipped
    );

    if summary.all_passed() { 0 } else { -1 }
}
