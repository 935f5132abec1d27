// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::ArchiveError, helpers::get_num_cpus};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use bytesize::ByteSize;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    time::SystemTime,
};
use tracing::debug;
use zstd::Encoder;

/// The zstd level used for output archives.
const ZSTD_LEVEL: i32 = 3;

/// Options for [`archive_output_dir`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ArchiveOptions {
    /// Regular files larger than this are truncated to this size.
    pub truncate_files: Option<ByteSize>,
    /// Leave out entries that aren't regular files or directories.
    pub drop_non_regular: bool,
}

/// What [`archive_output_dir`] wrote.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ArchiveSummary {
    /// The number of entries written, including directories.
    pub entry_count: usize,
    /// The number of regular files that were truncated.
    pub truncated: usize,
    /// The number of entries left out.
    pub dropped: usize,
}

/// Archives `dir` to `output_file` as a Zstandard-compressed tarball (`.tar.zst`).
///
/// The archive is written atomically: readers see either the previous contents of
/// `output_file` or the complete new archive.
pub fn archive_output_dir(
    dir: &Utf8Path,
    output_file: &Utf8Path,
    options: ArchiveOptions,
) -> Result<ArchiveSummary, ArchiveError> {
    let file = AtomicFile::new(output_file, OverwriteBehavior::AllowOverwrite);
    file.write(|file| {
        let archiver = Archiver::new(dir, options, file).map_err(|error| {
            ArchiveError::OutputArchiveIo {
                path: output_file.to_owned(),
                error,
            }
        })?;
        archiver.archive(output_file)
    })
    .map_err(|err| match err {
        atomicwrites::Error::Internal(error) => ArchiveError::OutputArchiveIo {
            path: output_file.to_owned(),
            error,
        },
        atomicwrites::Error::User(err) => err,
    })
}

struct Archiver<'a, W: Write> {
    dir: &'a Utf8Path,
    options: ArchiveOptions,
    builder: tar::Builder<Encoder<'static, BufWriter<W>>>,
    unix_timestamp: u64,
    summary: ArchiveSummary,
}

impl<'a, W: Write> Archiver<'a, W> {
    fn new(dir: &'a Utf8Path, options: ArchiveOptions, writer: W) -> io::Result<Self> {
        let buf_writer = BufWriter::new(writer);
        let mut encoder = zstd::Encoder::new(buf_writer, ZSTD_LEVEL)?;
        encoder.include_checksum(true)?;
        encoder.multithread(get_num_cpus() as u32)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let unix_timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Ok(Self {
            dir,
            options,
            builder,
            unix_timestamp,
            summary: ArchiveSummary::default(),
        })
    }

    fn archive(mut self, output_file: &Utf8Path) -> Result<ArchiveSummary, ArchiveError> {
        self.append_dir_all()?;

        let output_error = |error| ArchiveError::OutputArchiveIo {
            path: output_file.to_owned(),
            error,
        };
        // Finish writing the archive.
        let encoder = self.builder.into_inner().map_err(output_error)?;
        // Finish writing the zstd stream.
        let buf_writer = encoder.finish().map_err(output_error)?;
        buf_writer
            .into_inner()
            .map_err(|err| output_error(err.into_error()))?;

        debug!(
            dir = %self.dir,
            %output_file,
            entries = self.summary.entry_count,
            truncated = self.summary.truncated,
            dropped = self.summary.dropped,
            "archived output directory",
        );
        Ok(self.summary)
    }

    // Adapted from tar-rs's source, with truncation and filtering.
    fn append_dir_all(&mut self) -> Result<(), ArchiveError> {
        let mut stack = vec![self.dir.to_path_buf()];

        while let Some(src) = stack.pop() {
            let mut entries = Vec::new();
            let read_dir = src
                .read_dir_utf8()
                .map_err(|error| ArchiveError::InputFileRead {
                    path: src.clone(),
                    is_dir: Some(true),
                    error,
                })?;
            for entry in read_dir {
                let entry = entry.map_err(|error| ArchiveError::DirEntryRead {
                    path: src.clone(),
                    error,
                })?;
                let file_type = entry.file_type().map_err(|error| ArchiveError::InputFileRead {
                    path: entry.path().to_owned(),
                    is_dir: None,
                    error,
                })?;
                entries.push((entry.into_path(), file_type));
            }
            // Sort for a deterministic archive. Directories are pushed in reverse so they're
            // popped in order.
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut subdirs = Vec::new();
            for (path, file_type) in entries {
                let rel_path = path
                    .strip_prefix(self.dir)
                    .map_err(|_| ArchiveError::NonUtf8Path(path.to_string()))?
                    .to_owned();
                if file_type.is_dir() {
                    self.builder
                        .append_dir(&rel_path, &path)
                        .map_err(|error| ArchiveError::InputFileRead {
                            path: path.clone(),
                            is_dir: Some(true),
                            error,
                        })?;
                    self.summary.entry_count += 1;
                    subdirs.push(path);
                } else if file_type.is_file() {
                    self.append_file(&path, &rel_path)?;
                } else if !self.options.drop_non_regular && file_type.is_symlink() {
                    self.builder
                        .append_path_with_name(&path, &rel_path)
                        .map_err(|error| ArchiveError::InputFileRead {
                            path: path.clone(),
                            is_dir: Some(false),
                            error,
                        })?;
                    self.summary.entry_count += 1;
                } else {
                    // Sockets, pipes and devices can't be archived meaningfully.
                    debug!(%path, "leaving non-regular entry out of archive");
                    self.summary.dropped += 1;
                }
            }
            stack.extend(subdirs.into_iter().rev());
        }

        Ok(())
    }

    fn append_file(&mut self, path: &Utf8Path, rel_path: &Utf8PathBuf) -> Result<(), ArchiveError> {
        let read_error = |error| ArchiveError::InputFileRead {
            path: path.to_owned(),
            is_dir: Some(false),
            error,
        };
        let file = File::open(path).map_err(read_error)?;
        let len = file.metadata().map_err(read_error)?.len();

        match self.options.truncate_files {
            Some(limit) if len > limit.as_u64() => {
                let mut header = tar::Header::new_gnu();
                header.set_size(limit.as_u64());
                header.set_mtime(self.unix_timestamp);
                header.set_mode(0o644);
                header.set_cksum();
                self.builder
                    .append_data(&mut header, rel_path, file.take(limit.as_u64()))
                    .map_err(read_error)?;
                self.summary.truncated += 1;
            }
            _ => {
                self.builder
                    .append_path_with_name(path, rel_path)
                    .map_err(read_error)?;
            }
        }
        self.summary.entry_count += 1;
        Ok(())
    }
}
