// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::elements::{DataRoot, DataRootMode},
    errors::IsolationError,
    helpers::{rebase_arg, rebase_path},
};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cp_r::CopyOptions;
use tracing::debug;

/// The isolated filesystem view of one attempt.
///
/// Test data is linked or copied into a scratch root, and paths in the command line and working
/// directory that point into a data root are rewritten to point into the scratch root instead.
#[derive(Clone, Debug)]
pub(super) struct IsolatedView {
    root: Utf8PathBuf,
    mappings: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    ram_drive: Option<Utf8PathBuf>,
}

impl IsolatedView {
    /// Builds the view under `work_dir/root`, plus `work_dir/ram_drive` if `ram_drive` is set.
    pub(super) fn create(
        work_dir: &Utf8Path,
        data_roots: &[DataRoot],
        ram_drive: bool,
    ) -> Result<Self, IsolationError> {
        let root = work_dir.join("root");
        remove_stale(&root)?;
        create_dir_all(&root)?;

        let mut mappings = Vec::with_capacity(data_roots.len());
        for data_root in data_roots {
            if !is_plain_relative(&data_root.target) {
                return Err(IsolationError::InvalidTarget(data_root.target.clone()));
            }
            let target = root.join(&data_root.target);
            if let Some(parent) = target.parent() {
                create_dir_all(parent)?;
            }

            match data_root.mode {
                DataRootMode::Symlink => link(&data_root.source, &target)?,
                DataRootMode::Copy => {
                    create_dir_all(&target)?;
                    CopyOptions::new()
                        .copy_tree(&data_root.source, &target)
                        .map_err(|error| IsolationError::Copy {
                            source_path: data_root.source.clone(),
                            target: target.clone(),
                            error,
                        })?;
                }
            }
            debug!(
                source = %data_root.source,
                %target,
                mode = ?data_root.mode,
                "exposed data root",
            );
            mappings.push((data_root.source.clone(), target));
        }

        let ram_drive = if ram_drive {
            let path = work_dir.join("ram_drive");
            remove_stale(&path)?;
            create_dir_all(&path)?;
            Some(path)
        } else {
            None
        };

        Ok(Self {
            root,
            mappings,
            ram_drive,
        })
    }

    /// The scratch root.
    pub(super) fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The ram drive mount point, if one was requested.
    pub(super) fn ram_drive(&self) -> Option<&Utf8Path> {
        self.ram_drive.as_deref()
    }

    /// Rewrites arguments that refer to a data root. The first matching data root wins.
    pub(super) fn rebase_command(&self, command: &[String]) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                self.mappings
                    .iter()
                    .find_map(|(from, to)| rebase_arg(arg, from, to))
                    .unwrap_or_else(|| arg.clone())
            })
            .collect()
    }

    /// Rewrites the working directory if it's inside a data root.
    pub(super) fn rebase_cwd(&self, cwd: &Utf8Path) -> Utf8PathBuf {
        self.mappings
            .iter()
            .find_map(|(from, to)| rebase_path(cwd, from, to))
            .unwrap_or_else(|| cwd.to_owned())
    }
}

fn is_plain_relative(path: &Utf8Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}

/// Removes a directory from an earlier run in the same work directory. Symlinks inside it are
/// removed, not followed.
fn remove_stale(path: &Utf8Path) -> Result<(), IsolationError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(%path, "removed stale directory");
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(IsolationError::RemoveStale {
            path: path.to_owned(),
            error,
        }),
    }
}

fn create_dir_all(path: &Utf8Path) -> Result<(), IsolationError> {
    std::fs::create_dir_all(path).map_err(|error| IsolationError::CreateDir {
        path: path.to_owned(),
        error,
    })
}

fn link(source: &Utf8Path, target: &Utf8Path) -> Result<(), IsolationError> {
    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(source, target);
    #[cfg(windows)]
    let result = if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, target)
    } else {
        std::os::windows::fs::symlink_file(source, target)
    };

    result.map_err(|error| IsolationError::Symlink {
        source_path: source.to_owned(),
        target: target.to_owned(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn data_dir(temp: &Utf8TempDir) -> Utf8PathBuf {
        let data = temp.path().join("data");
        std::fs::create_dir_all(data.join("nested")).unwrap();
        std::fs::write(data.join("nested/input.txt"), "input").unwrap();
        data
    }

    #[test]
    fn symlink_and_copy() {
        let temp = Utf8TempDir::new().unwrap();
        let data = data_dir(&temp);
        let work_dir = temp.path().join("work");
        let roots = vec![
            DataRoot {
                source: data.clone(),
                target: "linked".into(),
                mode: DataRootMode::Symlink,
            },
            DataRoot {
                source: data.clone(),
                target: "deep/copied".into(),
                mode: DataRootMode::Copy,
            },
        ];

        let view = IsolatedView::create(&work_dir, &roots, true).unwrap();
        assert_eq!(view.root(), work_dir.join("root"));
        assert_eq!(
            std::fs::read_to_string(view.root().join("linked/nested/input.txt")).unwrap(),
            "input"
        );
        assert!(
            view.root().join("linked").symlink_metadata().unwrap().is_symlink(),
            "symlink mode links"
        );
        let copied = view.root().join("deep/copied");
        assert!(!copied.symlink_metadata().unwrap().is_symlink(), "copy mode copies");
        assert_eq!(
            std::fs::read_to_string(copied.join("nested/input.txt")).unwrap(),
            "input"
        );
        assert_eq!(view.ram_drive(), Some(work_dir.join("ram_drive").as_path()));
        assert!(work_dir.join("ram_drive").is_dir());

        // The first matching root wins.
        let command = vec![
            "/bin/test".to_owned(),
            format!("--input={data}/nested/input.txt"),
            data.to_string(),
        ];
        assert_eq!(
            view.rebase_command(&command),
            vec![
                "/bin/test".to_owned(),
                format!("--input={}/root/linked/nested/input.txt", work_dir),
                format!("{}/root/linked", work_dir),
            ]
        );
        assert_eq!(
            view.rebase_cwd(&data.join("nested")),
            work_dir.join("root/linked/nested")
        );
        assert_eq!(view.rebase_cwd(Utf8Path::new("/elsewhere")), "/elsewhere");
    }

    #[test]
    fn reused_work_dir_is_rebuilt() {
        let temp = Utf8TempDir::new().unwrap();
        let data = data_dir(&temp);
        let work_dir = temp.path().join("work");
        let roots = vec![
            DataRoot {
                source: data.clone(),
                target: "linked".into(),
                mode: DataRootMode::Symlink,
            },
            DataRoot {
                source: data.clone(),
                target: "copied".into(),
                mode: DataRootMode::Copy,
            },
        ];

        let view = IsolatedView::create(&work_dir, &roots, true).unwrap();
        std::fs::write(view.root().join("copied/stale.txt"), "stale").unwrap();
        std::fs::write(work_dir.join("ram_drive/stale.txt"), "stale").unwrap();

        let view = IsolatedView::create(&work_dir, &roots, true).unwrap();
        assert!(
            view.root().join("linked").symlink_metadata().unwrap().is_symlink(),
            "link recreated"
        );
        assert!(
            !view.root().join("copied/stale.txt").exists(),
            "copy doesn't merge into stale contents"
        );
        assert!(!work_dir.join("ram_drive/stale.txt").exists());
        assert_eq!(
            std::fs::read_to_string(data.join("nested/input.txt")).unwrap(),
            "input",
            "symlinked source is left alone"
        );
    }

    #[test_case("/absolute" ; "absolute")]
    #[test_case("../escape" ; "parent")]
    #[test_case("" ; "empty")]
    fn invalid_targets(target: &str) {
        let temp = Utf8TempDir::new().unwrap();
        let data = data_dir(&temp);
        let roots = vec![DataRoot {
            source: data,
            target: target.into(),
            mode: DataRootMode::Symlink,
        }];
        let error = IsolatedView::create(&temp.path().join("work"), &roots, false).unwrap_err();
        assert!(
            matches!(error, IsolationError::InvalidTarget(_)),
            "unexpected error: {error:?}"
        );
    }
}
