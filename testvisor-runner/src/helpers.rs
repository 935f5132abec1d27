// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use std::{borrow::Cow, fs::File, io, process::ExitStatus, sync::LazyLock};
use tracing::warn;

/// Returns the number of logical CPUs, used to size compression thread pools.
pub(crate) fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Truncates `buf` to at most `max_size` bytes by keeping its head and tail, with an explicit
/// marker in between saying how much was dropped.
pub(crate) fn truncate_snippet(buf: &[u8], max_size: usize) -> Cow<'_, [u8]> {
    if buf.len() <= max_size {
        return Cow::Borrowed(buf);
    }

    let truncated_bytes = buf.len() - max_size;
    let marker = format!("\n\n... [truncated {truncated_bytes} bytes] ...\n\n");
    let marker_bytes = marker.as_bytes();

    let content_space = max_size.saturating_sub(marker_bytes.len());
    let head_size = content_space / 2;
    let tail_size = content_space - head_size;

    let mut result = Vec::with_capacity(max_size);
    result.extend_from_slice(&buf[..head_size]);
    result.extend_from_slice(marker_bytes);
    result.extend_from_slice(&buf[buf.len() - tail_size..]);

    Cow::Owned(result)
}

/// Reads a file and returns a bounded, lossily-decoded snippet of it.
///
/// A missing file is treated as empty.
pub(crate) fn read_snippet(path: &Utf8Path, max_size: usize) -> io::Result<String> {
    let contents = read_or_empty(path)?;
    Ok(String::from_utf8_lossy(&truncate_snippet(&contents, max_size)).into_owned())
}

/// Reads a file, treating a missing file as empty.
pub(crate) fn read_or_empty(path: &Utf8Path) -> io::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(contents) => Ok(contents),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(error) => Err(error),
    }
}

/// Creates a file if it doesn't exist, without truncating it if it does.
pub(crate) fn touch(path: &Utf8Path) -> io::Result<()> {
    File::options().create(true).append(true).open(path)?;
    Ok(())
}

/// Describes how a process exited, e.g. "exit code 2" or "signal 9 (SIGKILL)".
pub(crate) fn display_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return match signal_name(signal) {
                Some(name) => format!("signal {signal} ({name})"),
                None => format!("signal {signal}"),
            };
        }
    }
    "unknown exit status".to_owned()
}

/// Returns the name of a signal, if it is well-known.
#[cfg(unix)]
pub(crate) fn signal_name(signal: i32) -> Option<&'static str> {
    nix::sys::signal::Signal::try_from(signal)
        .ok()
        .map(|signal| signal.as_str())
}

/// Rewrites `path` so that, if it starts with `from`, it starts with `to` instead.
pub(crate) fn rebase_path(path: &Utf8Path, from: &Utf8Path, to: &Utf8Path) -> Option<Utf8PathBuf> {
    path.strip_prefix(from).ok().map(|rest| {
        if rest.as_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(rest)
        }
    })
}

/// Rewrites a command-line argument that refers to a path under `from` (either as the whole
/// argument or as the value of a `--flag=value` argument) to point under `to`.
pub(crate) fn rebase_arg(arg: &str, from: &Utf8Path, to: &Utf8Path) -> Option<String> {
    if let Some(rebased) = rebase_path(Utf8Path::new(arg), from, to) {
        return Some(rebased.into_string());
    }
    let (flag, value) = arg.split_once('=')?;
    let rebased = rebase_path(Utf8Path::new(value), from, to)?;
    Some(format!("{flag}={rebased}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn truncate_no_truncation_needed() {
        let input = b"hello world";
        let result = truncate_snippet(input, 100);
        assert_eq!(&*result, input);
        assert!(matches!(result, Cow::Borrowed(_)), "should be borrowed");
    }

    #[test]
    fn truncate_keeps_head_and_tail() {
        let input: Vec<u8> = (0..1000).map(|i| b'a' + (i % 26) as u8).collect();
        let result = truncate_snippet(&input, 200);
        assert_eq!(result.len(), 200);
        let text = String::from_utf8(result.into_owned()).unwrap();
        assert!(text.contains("[truncated 800 bytes]"), "marker present: {text}");
        assert!(text.starts_with("abc"), "head kept: {text}");
        let tail = String::from_utf8(input[input.len() - 5..].to_vec()).unwrap();
        assert!(text.ends_with(&tail), "tail kept: {text}");
    }

    #[test]
    fn truncate_tiny_limit() {
        let input = vec![b'x'; 100];
        let result = truncate_snippet(&input, 5);
        let text = String::from_utf8(result.into_owned()).unwrap();
        assert!(text.contains("[truncated 95 bytes]"));
    }

    #[test_case("/data/in/file.txt", Some("/work/root/in/file.txt") ; "nested path")]
    #[test_case("/data/in", Some("/work/root/in") ; "exact match")]
    #[test_case("--input=/data/in/x", Some("--input=/work/root/in/x") ; "flag value")]
    #[test_case("/data/input", None ; "prefix is not a path component")]
    #[test_case("--verbose", None ; "unrelated flag")]
    fn rebase(arg: &str, expected: Option<&str>) {
        let actual = rebase_arg(arg, Utf8Path::new("/data/in"), Utf8Path::new("/work/root/in"));
        assert_eq!(actual.as_deref(), expected);
    }
}
