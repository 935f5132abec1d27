// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for supervised test runs.
///
/// Orchestration layers use these to tell apart failures that are the test author's
/// responsibility from failures of the infrastructure.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum TestvisorExitCode {}

impl TestvisorExitCode {
    /// The test ran and nothing failed.
    pub const OK: i32 = 0;

    /// An infrastructure error occurred: an internal error in the supervisor, a resource problem,
    /// or a known infrastructure marker in the test's output.
    ///
    /// This must not be attributed to the test author.
    pub const INFRASTRUCTURE_ERROR: i32 = 3;

    /// One or more tests failed.
    pub const TESTS_FAILED: i32 = 10;

    /// The supervisor configuration was invalid, so no attempt was started.
    pub const CONFIG_ERROR: i32 = 96;
}
