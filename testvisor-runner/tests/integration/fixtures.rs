// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use std::sync::{Mutex, Once};
use testvisor_metadata::{ChunkId, Status, Suite, TestCase, TestCaseId, TestSize};
use testvisor_runner::{
    config::SupervisorConfig,
    trace::{LiveStatusLine, LiveStatusSink},
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().expect("color-eyre installed once");
        // Other test binaries may have set a global subscriber already.
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// A config running `script` with `/bin/sh` in `dir`. `extra` is appended to the TOML, so it
/// may end with tables.
pub(crate) fn sh_config(
    dir: &Utf8Path,
    script: &str,
    test_timeout: &str,
    extra: &str,
) -> SupervisorConfig {
    let contents = format!(
        "command = [\"/bin/sh\", \"-c\", '''{script}''']\n\
         cwd = \"{dir}\"\n\
         work-dir = \"{dir}/work\"\n\
         test-timeout = \"{test_timeout}\"\n\
         {extra}\n"
    );
    let (mut config, ignored) =
        SupervisorConfig::from_toml_str(&contents).expect("test config is valid");
    assert!(ignored.is_empty(), "no ignored keys: {ignored:?}");
    config.live_status.enabled = false;
    config
}

/// Shell code that appends a finished test to the trace file.
pub(crate) fn report_test(name: &str, status: Status) -> String {
    format!(
        "printf '%s\\n' '{{\"timestamp\": 1.0, \"name\": \"subtest-finished\", \"value\": \
         {{\"path\": \"t.sh\", \"name\": \"{name}\", \"status\": \"{status}\", \"elapsed\": 0.5}}}}' \
         >> \"$TESTVISOR_TRACE_FILE\""
    )
}

pub(crate) fn test_id(name: &str) -> TestCaseId {
    TestCaseId::new("t.sh", name)
}

/// Looks up a test anywhere in `suite`.
pub(crate) fn find_test<'a>(suite: &'a Suite, name: &str) -> Option<&'a TestCase> {
    let id = test_id(name);
    suite
        .iter_tests()
        .find(|(_, case)| case.id == id)
        .map(|(_, case)| case)
}

/// Builds a single-chunk suite from `(name, status)` pairs.
pub(crate) fn suite_with(chunk: ChunkId, tests: &[(&str, Status)]) -> Suite {
    let mut suite = Suite::new("project/tests", TestSize::Medium);
    let chunk = suite.chunk_mut(&chunk);
    for (name, status) in tests {
        chunk.upsert_test(TestCase::new(test_id(name), *status));
    }
    suite
}

/// Records live status lines.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    lines: Mutex<Vec<LiveStatusLine>>,
}

impl RecordingSink {
    pub(crate) fn lines(&self) -> Vec<LiveStatusLine> {
        self.lines.lock().unwrap().clone()
    }
}

impl LiveStatusSink for RecordingSink {
    fn emit(&self, line: &LiveStatusLine) {
        self.lines.lock().unwrap().push(line.clone());
    }
}
