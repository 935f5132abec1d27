// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Deserializer};
use std::{fmt, str::FromStr};

/// A signal a test may handle to shut down smoothly before it's terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShutdownSignal {
    /// SIGHUP.
    Hangup,
    /// SIGINT.
    Interrupt,
    /// SIGQUIT.
    Quit,
    /// SIGUSR1.
    User1,
    /// SIGUSR2.
    User2,
    /// SIGALRM.
    Alarm,
    /// SIGTERM.
    Term,
}

impl ShutdownSignal {
    const ALL: [ShutdownSignal; 7] = [
        ShutdownSignal::Hangup,
        ShutdownSignal::Interrupt,
        ShutdownSignal::Quit,
        ShutdownSignal::User1,
        ShutdownSignal::User2,
        ShutdownSignal::Alarm,
        ShutdownSignal::Term,
    ];

    /// Returns the conventional name of this signal, e.g. `SIGUSR2`.
    pub const fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::User1 => "SIGUSR1",
            ShutdownSignal::User2 => "SIGUSR2",
            ShutdownSignal::Alarm => "SIGALRM",
            ShutdownSignal::Term => "SIGTERM",
        }
    }

    /// Returns the platform signal corresponding to this one.
    #[cfg(unix)]
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            ShutdownSignal::Hangup => Signal::SIGHUP,
            ShutdownSignal::Interrupt => Signal::SIGINT,
            ShutdownSignal::Quit => Signal::SIGQUIT,
            ShutdownSignal::User1 => Signal::SIGUSR1,
            ShutdownSignal::User2 => Signal::SIGUSR2,
            ShutdownSignal::Alarm => Signal::SIGALRM,
            ShutdownSignal::Term => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShutdownSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Self::ALL
            .into_iter()
            .find(|signal| signal.name() == full)
            .ok_or_else(|| {
                format!(
                    "unknown shutdown signal `{s}` (known signals: {})",
                    Self::ALL.map(|signal| signal.name()).join(", ")
                )
            })
    }
}

impl<'de> Deserialize<'de> for ShutdownSignal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
