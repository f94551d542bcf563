//! In-tree diagnostic test harness.
//!
//! Suites are plain functions returning [`TestResult`], grouped with
//! [`define_test_suite!`] which emits a [`TestSuiteDesc`] record into the
//! `.test_registry` link section. The embedding boot environment collects
//! the section bounds and hands them to the runner in `vtprobe-tests`.

pub mod config;
pub mod harness;
mod runner;

mod assertions;
pub use config::{TestConfig, Verbosity};
pub use harness::{
    HARNESS_MAX_SUITES, TestRunSummary, TestSuiteDesc, TestSuiteResult, cycles_to_ms,
    estimate_cycles_per_ms, measure_elapsed_ms,
};
pub use runner::run_single_test;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    /// The environment lacks something the test needs (an optional device,
    /// usually). Not a failure.
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }

    #[inline]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! skip {
    () => {
        $crate::testing::TestResult::Skipped
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST SKIP: {}", $msg);
        $crate::testing::TestResult::Skipped
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST SKIP: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Skipped
    }};
}

#[macro_export]
macro_rules! run_test {
    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};

    ($name:expr, $test_fn:expr) => {{ $crate::testing::run_single_test($name, || $test_fn()) }};
}

#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            const [<$suite_name:upper _NAME>]: &[u8] = concat!(stringify!($suite_name), "\0").as_bytes();

            fn [<run_ $suite_name _suite>](
                out: *mut $crate::testing::TestSuiteResult,
            ) -> i32 {
                let start = $crate::tsc::rdtsc();
                let mut passed = 0u32;
                let mut skipped = 0u32;
                let mut total = 0u32;

                $(
                    total += 1;
                    match $crate::run_test!($test_fn) {
                        $crate::testing::TestResult::Pass => passed += 1,
                        $crate::testing::TestResult::Skipped => skipped += 1,
                        $crate::testing::TestResult::Fail => {}
                    }
                )*

                let elapsed = $crate::testing::measure_elapsed_ms(start, $crate::tsc::rdtsc());
                let failed = total - passed - skipped;

                if let Some(out_ref) = unsafe { out.as_mut() } {
                    out_ref.name = [<$suite_name:upper _NAME>].as_ptr() as *const ::core::ffi::c_char;
                    out_ref.total = total;
                    out_ref.passed = passed;
                    out_ref.failed = failed;
                    out_ref.skipped = skipped;
                    out_ref.elapsed_ms = elapsed;
                }

                if failed == 0 { 0 } else { -1 }
            }

            #[used]
            #[unsafe(link_section = ".test_registry")]
            pub static [<$suite_name:upper _SUITE_DESC>]: $crate::testing::TestSuiteDesc = $crate::testing::TestSuiteDesc {
                name: [<$suite_name:upper _NAME>].as_ptr() as *const ::core::ffi::c_char,
                run: Some([<run_ $suite_name _suite>]),
            };
        }
    };
}
