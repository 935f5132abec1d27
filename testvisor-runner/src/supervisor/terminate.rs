// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::os;
use crate::{
    config::{SupervisorConfig, elements::ShutdownSignal},
    monitor::ProcessTree,
};
use std::{fmt, io, process::ExitStatus, time::Duration};
use tokio::process::Child;
use tracing::{debug, warn};

/// How long to wait for the process group to go away after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How long [`reap`] waits for the exit status after an escalation.
pub(super) const REAP_WAIT: Duration = Duration::from_secs(1);

/// The exit code recorded for a test that never exited after SIGKILL.
pub(super) const UNREAPED_EXIT_CODE: i32 = -9;

/// A signal sent while terminating a test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EscalationSignal {
    /// A smooth shutdown signal the test declared it handles.
    Smooth(ShutdownSignal),
    /// The hard kill signal, SIGTERM.
    Term,
    /// The force kill, SIGKILL.
    Kill,
}

impl fmt::Display for EscalationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationSignal::Smooth(signal) => write!(f, "{signal}"),
            EscalationSignal::Term => f.write_str("SIGTERM"),
            EscalationSignal::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// One step of a termination escalation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TerminationStep {
    /// The signal that was sent.
    pub signal: EscalationSignal,
    /// How long the supervisor waited after sending it.
    pub waited: Duration,
    /// Whether the test exited during the wait.
    pub exited: bool,
}

/// Terminates a test's process group with escalating signals.
#[derive(Clone, Debug)]
pub(super) struct Escalation<'cfg> {
    smooth_signals: &'cfg [ShutdownSignal],
    shutdown_grace_period: Duration,
    kill_grace_period: Duration,
    trim_cmdlines: bool,
}

impl<'cfg> Escalation<'cfg> {
    pub(super) fn new(config: &'cfg SupervisorConfig) -> Self {
        Self {
            smooth_signals: &config.smooth_shutdown_signals,
            shutdown_grace_period: config.shutdown_grace_period,
            kill_grace_period: config.kill_grace_period,
            trim_cmdlines: !config.test_tags().no_pstree_trim,
        }
    }

    /// Runs the escalation until the child exits. Never blocks longer than the sum of the grace
    /// periods plus a bounded wait after SIGKILL.
    pub(super) async fn terminate(&self, child: &mut Child, reason: &str) -> Vec<TerminationStep> {
        let Some(pid) = child.id() else {
            // The child was already reaped.
            return Vec::new();
        };

        let plan = self
            .smooth_signals
            .iter()
            .map(|signal| (EscalationSignal::Smooth(*signal), self.shutdown_grace_period))
            .chain(std::iter::once((
                EscalationSignal::Term,
                self.kill_grace_period,
            )))
            .chain(std::iter::once((EscalationSignal::Kill, KILL_WAIT)));

        let mut steps = Vec::new();
        for (signal, grace) in plan {
            let tree = snapshot(pid, self.trim_cmdlines).await;
            warn!(
                pid,
                %signal,
                "{reason}: sending {signal} to the test's process group, waiting up to {}\n{tree}",
                humantime::format_duration(grace),
            );
            os::send_signal(child, pid, signal);

            let start = tokio::time::Instant::now();
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            steps.push(TerminationStep {
                signal,
                waited: start.elapsed(),
                exited,
            });
            if exited {
                break;
            }
        }

        if steps.last().is_some_and(|step| !step.exited) {
            warn!(pid, "test did not exit within {:?} of SIGKILL", KILL_WAIT);
        }
        os::kill_leftovers(pid);
        debug!(pid, steps = steps.len(), "termination finished");
        steps
    }
}

/// Collects the exit status after an escalation, waiting at most [`REAP_WAIT`].
///
/// Returns `None` if the child is still around, for example because it's stuck in
/// uninterruptible sleep.
pub(super) async fn reap(child: &mut Child) -> Option<io::Result<ExitStatus>> {
    reap_within(child, REAP_WAIT).await
}

async fn reap_within(child: &mut Child, wait: Duration) -> Option<io::Result<ExitStatus>> {
    match tokio::time::timeout(wait, child.wait()).await {
        Ok(status) => Some(status),
        Err(_) => {
            warn!(pid = ?child.id(), "test still hasn't exited, giving up on its exit status");
            None
        }
    }
}

/// Kills any processes left in the test's process group after it exited on its own.
pub(super) fn kill_leftovers(pid: u32) {
    os::kill_leftovers(pid);
}

async fn snapshot(pid: u32, trim_cmdlines: bool) -> ProcessTree {
    tokio::task::spawn_blocking(move || ProcessTree::snapshot(pid, trim_cmdlines))
        .await
        .unwrap_or_default()
}
