// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::terminate::EscalationSignal;
use tokio::process::Child;
use tracing::debug;

// This is a no-op on Windows: the child is killed directly.
pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

pub(super) fn send_signal(child: &mut Child, _pid: u32, signal: EscalationSignal) {
    match signal {
        EscalationSignal::Smooth(signal) => {
            debug!(%signal, "smooth shutdown signals aren't supported on Windows, skipping");
        }
        EscalationSignal::Term | EscalationSignal::Kill => {
            _ = child.start_kill();
        }
    }
}

pub(super) fn kill_leftovers(_pid: u32) {}
