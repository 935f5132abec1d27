// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::terminate::EscalationSignal;
use libc::{SIGKILL, SIGTERM};
use std::os::unix::process::CommandExt;
use tokio::process::Child;

/// Pre-execution configuration on Unix.
///
/// The child gets its own process group so that signals reach its descendants too.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Sends `signal` to the process group led by `pid`.
pub(super) fn send_signal(_child: &mut Child, pid: u32, signal: EscalationSignal) {
    let signal = match signal {
        EscalationSignal::Smooth(signal) => signal.as_nix() as i32,
        EscalationSignal::Term => SIGTERM,
        EscalationSignal::Kill => SIGKILL,
    };
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// Kills whatever is left of the process group led by `pid` once its leader has exited.
pub(super) fn kill_leftovers(pid: u32) {
    // ESRCH here means the group is already gone.
    unsafe {
        libc::kill(-(pid as i32), SIGKILL);
    }
}

#[cfg(target_os = "linux")]
pub(super) use linux::configure_private_tmpfs;

#[cfg(target_os = "linux")]
mod linux {
    use bytesize::ByteSize;
    use camino::Utf8Path;
    use nix::{
        mount::{MsFlags, mount},
        sched::{CloneFlags, unshare},
    };
    use std::{ffi::CString, io, os::unix::process::CommandExt};

    struct IdMaps {
        setgroups: CString,
        uid_map: CString,
        gid_map: CString,
        uid_line: Vec<u8>,
        gid_line: Vec<u8>,
    }

    /// Arranges for the child to run in a private mount namespace with a tmpfs of `size` mounted
    /// at `ram_drive`.
    ///
    /// Unless the supervisor runs as root, a user namespace is created as well. The current user
    /// is mapped to itself, or to root if `map_root_user` is set.
    pub(in crate::supervisor) fn configure_private_tmpfs(
        cmd: &mut std::process::Command,
        ram_drive: &Utf8Path,
        size: ByteSize,
        map_root_user: bool,
    ) -> io::Result<()> {
        // Everything the hook needs is allocated here: only async-signal-safe calls may run
        // between fork and exec.
        let target = ram_drive.as_str().to_owned();
        let options = format!("size={}", size.as_u64());

        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        let id_maps = if uid != 0 || map_root_user {
            let inner_uid = if map_root_user { 0 } else { uid };
            let inner_gid = if map_root_user { 0 } else { gid };
            Some(IdMaps {
                setgroups: CString::new("/proc/self/setgroups")?,
                uid_map: CString::new("/proc/self/uid_map")?,
                gid_map: CString::new("/proc/self/gid_map")?,
                uid_line: format!("{inner_uid} {uid} 1\n").into_bytes(),
                gid_line: format!("{inner_gid} {gid} 1\n").into_bytes(),
            })
        } else {
            None
        };

        let hook = move || {
            let mut flags = CloneFlags::CLONE_NEWNS;
            if id_maps.is_some() {
                flags |= CloneFlags::CLONE_NEWUSER;
            }
            unshare(flags)?;
            if let Some(maps) = &id_maps {
                write_proc_file(&maps.setgroups, b"deny")?;
                write_proc_file(&maps.uid_map, &maps.uid_line)?;
                write_proc_file(&maps.gid_map, &maps.gid_line)?;
            }
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            mount(
                Some("tmpfs"),
                target.as_str(),
                Some("tmpfs"),
                MsFlags::empty(),
                Some(options.as_str()),
            )?;
            Ok(())
        };

        unsafe {
            cmd.pre_exec(hook);
        }
        Ok(())
    }

    fn write_proc_file(path: &CString, contents: &[u8]) -> io::Result<()> {
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = unsafe { libc::write(fd, contents.as_ptr().cast(), contents.len()) };
        let result = if written < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        unsafe {
            libc::close(fd);
        }
        result
    }
}
