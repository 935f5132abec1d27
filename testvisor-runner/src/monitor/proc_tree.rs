// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Command lines longer than this are trimmed in snapshots, unless trimming is disabled.
pub const CMDLINE_TRIM_LENGTH: usize = 256;

/// One process in a [`ProcessTree`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessInfo {
    /// The process id.
    pub pid: u32,
    /// The parent process id.
    pub ppid: u32,
    /// The resident set size, in bytes.
    pub rss_bytes: u64,
    /// The command line, with arguments separated by spaces.
    pub cmdline: String,
}

/// A snapshot of a process and all of its descendants.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessTree {
    /// Processes in depth-first order, along with their depth below the root.
    entries: Vec<(usize, ProcessInfo)>,
}

impl ProcessTree {
    /// Takes a snapshot of `root_pid` and its descendants.
    ///
    /// Processes that exit while the snapshot is being taken are skipped. On platforms without
    /// `/proc`, the snapshot is always empty.
    pub fn snapshot(root_pid: u32, trim_cmdlines: bool) -> Self {
        let processes = imp::list_processes();
        let mut tree = Self::from_processes(root_pid, processes);
        if trim_cmdlines {
            for (_, info) in &mut tree.entries {
                trim_cmdline(&mut info.cmdline);
            }
        }
        tree
    }

    /// Builds a tree rooted at `root_pid` out of a flat list of processes.
    pub fn from_processes(root_pid: u32, mut processes: Vec<ProcessInfo>) -> Self {
        processes.sort_by_key(|info| info.pid);
        let mut entries = Vec::new();
        let Some(root_index) = processes.iter().position(|info| info.pid == root_pid) else {
            return Self { entries };
        };

        let mut stack = vec![(0, processes[root_index].clone())];
        while let Some((depth, info)) = stack.pop() {
            // Push in reverse so children come out in pid order. The pid check guards against
            // cycles from pid reuse.
            let children: Vec<_> = processes
                .iter()
                .filter(|child| child.ppid == info.pid && child.pid != info.pid)
                .filter(|child| {
                    !entries
                        .iter()
                        .any(|(_, seen): &(usize, ProcessInfo)| seen.pid == child.pid)
                })
                .cloned()
                .collect();
            entries.push((depth, info));
            for child in children.into_iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        Self { entries }
    }

    /// Returns true if the snapshot has no processes, for example because the root exited.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of processes in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the processes in depth-first order.
    pub fn processes(&self) -> impl Iterator<Item = &ProcessInfo> + '_ {
        self.entries.iter().map(|(_, info)| info)
    }

    /// The total resident set size of every process in the tree, in bytes.
    pub fn total_rss(&self) -> u64 {
        self.processes().map(|info| info.rss_bytes).sum()
    }
}

impl fmt::Display for ProcessTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "(no processes)");
        }
        for (depth, info) in &self.entries {
            writeln!(
                f,
                "{:indent$}{} [{} KiB] {}",
                "",
                info.pid,
                info.rss_bytes / 1024,
                info.cmdline,
                indent = depth * 2,
            )?;
        }
        Ok(())
    }
}

fn trim_cmdline(cmdline: &mut String) {
    if cmdline.len() <= CMDLINE_TRIM_LENGTH {
        return;
    }
    let mut end = CMDLINE_TRIM_LENGTH;
    while !cmdline.is_char_boundary(end) {
        end -= 1;
    }
    cmdline.truncate(end);
    cmdline.push_str("...");
}

#[cfg(target_os = "linux")]
mod imp {
    use super::ProcessInfo;
    use std::fs;

    pub(super) fn list_processes() -> Vec<ProcessInfo> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
                read_process(pid)
            })
            .collect()
    }

    fn read_process(pid: u32) -> Option<ProcessInfo> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let (comm, ppid) = parse_stat(&stat)?;
        let rss_bytes = fs::read_to_string(format!("/proc/{pid}/status"))
            .ok()
            .and_then(|status| parse_vm_rss(&status))
            .unwrap_or(0);
        let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
            .ok()
            .map(|bytes| {
                bytes
                    .split(|&b| b == 0)
                    .filter(|arg| !arg.is_empty())
                    .map(String::from_utf8_lossy)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|cmdline| !cmdline.is_empty())
            .unwrap_or_else(|| format!("[{comm}]"));
        Some(ProcessInfo {
            pid,
            ppid,
            rss_bytes,
            cmdline,
        })
    }

    /// Returns the command name and parent pid from the contents of `/proc/<pid>/stat`.
    pub(super) fn parse_stat(stat: &str) -> Option<(&str, u32)> {
        // The command name is in parentheses and may itself contain spaces and parentheses.
        let open = stat.find('(')?;
        let close = stat.rfind(')')?;
        let comm = stat.get(open + 1..close)?;
        let mut fields = stat.get(close + 1..)?.split_ascii_whitespace();
        let _state = fields.next()?;
        let ppid = fields.next()?.parse().ok()?;
        Some((comm, ppid))
    }

    /// Returns VmRSS in bytes from the contents of `/proc/<pid>/status`.
    pub(super) fn parse_vm_rss(status: &str) -> Option<u64> {
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kib: u64 = line.split_ascii_whitespace().nth(1)?.parse().ok()?;
        Some(kib * 1024)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::ProcessInfo;

    pub(super) fn list_processes() -> Vec<ProcessInfo> {
        Vec::new()
    }
}
