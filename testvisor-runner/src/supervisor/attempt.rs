// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ATTEMPT_ENV, CORE_REGISTRY_ENV, OUTPUT_DIR_ENV, RAM_DRIVE_ENV, TRACE_FILE_ENV,
    archive::{ArchiveOptions, archive_output_dir},
    isolation::IsolatedView,
    meta::{remove_meta_result, write_meta_result},
    os,
    output_watcher::OutputWatcher,
    recipe::{RecipePhase, RecipeRunner},
    reserve::ReserveGuard,
    terminate::{self, Escalation, TerminationStep},
};
use crate::{
    cancel::CancellationToken,
    config::SupervisorConfig,
    crash::{CoreRegistry, CrashDiagnostics, CrashReport, MAX_EXTRA_CORES},
    errors::{ChildStartError, DisplayErrorChain, RecipeError, SupervisorError, TraceWriteError},
    helpers::{display_exit_status, read_or_empty, read_snippet, touch},
    monitor::{MemoryMonitor, MemoryReport, TmpfsMonitor, TmpfsReport},
    time::{StopwatchStart, stopwatch},
    trace::{LiveStatusSink, ReplayMode, ReplaySummary, TraceReplayer, TraceWriter},
};
use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use std::{
    fmt,
    fs::File,
    io,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use swrite::{SWrite, swrite};
use testvisor_metadata::{
    ErrorOrigin, MetaResult, Status, Suite, TestCase,
    trace::{ChunkEventValue, ChunkRef, SubtestFinishedValue, SuiteEventValue, TraceEventKind},
};
use tracing::{debug, error, info, instrument, warn};

/// The states an attempt goes through, in order. `RecipeStop` and `Finalize` always run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum AttemptState {
    Initial,
    SetupEnvironment,
    RecipeStart,
    RunTest,
    RecipeStop,
    Finalize,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttemptState::Initial => "initial",
            AttemptState::SetupEnvironment => "setup-environment",
            AttemptState::RecipeStart => "recipe-start",
            AttemptState::RunTest => "run-test",
            AttemptState::RecipeStop => "recipe-stop",
            AttemptState::Finalize => "finalize",
        })
    }
}

/// How the test command of an attempt ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttemptExit {
    /// The command exited on its own.
    Exited {
        /// The exit code.
        code: i32,
    },
    /// The command was killed by a signal it didn't get from the supervisor.
    Signaled {
        /// The signal number.
        signal: i32,
        /// Whether the kernel reported a core dump.
        core_dumped: bool,
    },
    /// The command ran out of time and was terminated.
    TimedOut {
        /// The timeout that was exceeded.
        after: Duration,
        /// The exit code after termination. Negative values are signals.
        exit_code: i32,
    },
    /// The run was cancelled while the command was running.
    Cancelled {
        /// The exit code after termination. Negative values are signals.
        exit_code: i32,
    },
    /// The command was never started, for example because a recipe failed.
    NotStarted,
}

impl AttemptExit {
    /// The exit code recorded in the meta result.
    pub fn exit_code(&self) -> i32 {
        match *self {
            AttemptExit::Exited { code } => code,
            AttemptExit::Signaled { signal, .. } => -signal,
            AttemptExit::TimedOut { exit_code, .. } | AttemptExit::Cancelled { exit_code } => {
                exit_code
            }
            AttemptExit::NotStarted => 1,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return AttemptExit::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;

            if let Some(signal) = status.signal() {
                return AttemptExit::Signaled {
                    signal,
                    core_dumped: status.core_dumped(),
                };
            }
        }
        AttemptExit::Exited { code: 1 }
    }
}

impl fmt::Display for AttemptExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptExit::Exited { code } => write!(f, "exited with code {code}"),
            AttemptExit::Signaled {
                signal,
                core_dumped,
            } => {
                write!(f, "killed by signal {signal}")?;
                #[cfg(unix)]
                if let Some(name) = crate::helpers::signal_name(*signal) {
                    write!(f, " ({name})")?;
                }
                if *core_dumped {
                    write!(f, ", core dumped")?;
                }
                Ok(())
            }
            AttemptExit::TimedOut { after, .. } => {
                write!(f, "timed out after {}", humantime::format_duration(*after))
            }
            AttemptExit::Cancelled { .. } => write!(f, "cancelled"),
            AttemptExit::NotStarted => write!(f, "not started"),
        }
    }
}

/// Everything that happened during one attempt.
#[derive(Debug)]
pub struct AttemptOutcome {
    /// The 1-based attempt number.
    pub attempt: u32,
    /// Where the attempt's files are. For retried attempts, this is the preserved directory.
    pub work_dir: Utf8PathBuf,
    /// The timeout the attempt ran with.
    pub timeout: Duration,
    /// The results replayed from the attempt's trace, with the supervisor's annotations.
    pub suite: Suite,
    /// What the trace replay applied and skipped.
    pub replay: ReplaySummary,
    /// The meta result written at the end of the attempt.
    pub meta: MetaResult,
    /// How the test command ended.
    pub exit: AttemptExit,
    /// The termination steps, if the command had to be stopped.
    pub termination: Vec<TerminationStep>,
    /// Recipe failures, both at start-up and teardown.
    pub recipe_errors: Vec<RecipeError>,
    /// The memory monitor's report, if the command ran.
    pub memory: Option<MemoryReport>,
    /// The tmpfs monitor's report, if a ram drive was used.
    pub tmpfs: Option<TmpfsReport>,
    /// Crash diagnostics for the test command.
    pub crash: Option<CrashReport>,
    /// Crash diagnostics for registered helper processes, by pid.
    pub extra_crashes: Vec<(u32, CrashReport)>,
    /// Orchestration failures. Each is also reported as an `INTERNAL` suite error.
    pub internal_errors: Vec<SupervisorError>,
    pub(super) stderr: Vec<u8>,
}

/// The files of one attempt, all under the work directory.
#[derive(Clone, Debug)]
pub(super) struct AttemptPaths {
    pub(super) work_dir: Utf8PathBuf,
    pub(super) stdout: Utf8PathBuf,
    pub(super) stderr: Utf8PathBuf,
    pub(super) trace: Utf8PathBuf,
    pub(super) wreckage: Utf8PathBuf,
    pub(super) meta: Utf8PathBuf,
    pub(super) output_dir: Utf8PathBuf,
    pub(super) archive: Utf8PathBuf,
    pub(super) core_registry: Utf8PathBuf,
    pub(super) backtrace: Utf8PathBuf,
    pub(super) ram_limit_tree: Utf8PathBuf,
    pub(super) reserve: Utf8PathBuf,
}

impl AttemptPaths {
    pub(super) fn new(work_dir: &Utf8Path) -> Self {
        Self {
            work_dir: work_dir.to_owned(),
            stdout: work_dir.join("stdout.log"),
            stderr: work_dir.join("stderr.log"),
            trace: work_dir.join("trace.jsonl"),
            wreckage: work_dir.join("trace.wreckage.jsonl"),
            meta: work_dir.join("meta.json"),
            output_dir: work_dir.join("output"),
            archive: work_dir.join("output.tar.zst"),
            core_registry: work_dir.join("core-registry.jsonl"),
            backtrace: work_dir.join("backtrace.txt"),
            ram_limit_tree: work_dir.join("ram_limit_tree.txt"),
            reserve: work_dir.join("reserved_space"),
        }
    }
}

/// Mutable state gathered while an attempt runs.
#[derive(Debug)]
struct AttemptRun {
    attempt: u32,
    timeout: Duration,
    cwd: Utf8PathBuf,
    exit: AttemptExit,
    termination: Vec<TerminationStep>,
    recipe_errors: Vec<RecipeError>,
    memory: Option<MemoryReport>,
    tmpfs: Option<TmpfsReport>,
    crash: Option<CrashReport>,
    extra_crashes: Vec<(u32, CrashReport)>,
    internal_errors: Vec<SupervisorError>,
    stderr: Vec<u8>,
    archived: bool,
}

impl AttemptRun {
    fn internal(&mut self, error: SupervisorError) {
        error!(
            attempt = self.attempt,
            "internal error: {}",
            DisplayErrorChain(&error)
        );
        self.internal_errors.push(error);
    }

    fn is_ok(&self) -> bool {
        self.internal_errors.is_empty()
    }
}

/// Runs single attempts. Shared by every attempt of a [`Supervisor`](super::Supervisor).
pub(super) struct AttemptRunner<'a> {
    pub(super) config: &'a SupervisorConfig,
    pub(super) sink: Option<&'a Arc<dyn LiveStatusSink>>,
    pub(super) cancel: &'a CancellationToken,
    pub(super) crash: &'a CrashDiagnostics,
}

enum Waited {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Why the supervisor stopped the test command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum StopReason {
    TimedOut,
    Cancelled,
}

impl AttemptRunner<'_> {
    /// Runs attempt number `attempt` with the given timeout.
    ///
    /// Never fails: orchestration errors are recorded in the outcome and reported as `INTERNAL`
    /// suite errors. Started recipes are always stopped, and the trace file and meta result are
    /// always written if the work directory could be created.
    #[instrument(level = "debug", skip(self))]
    pub(super) async fn run(&self, attempt: u32, timeout: Duration) -> AttemptOutcome {
        let paths = AttemptPaths::new(&self.config.work_dir);
        let stopwatch = stopwatch();
        let mut run = AttemptRun {
            attempt,
            timeout,
            cwd: self.config.cwd.clone(),
            exit: AttemptExit::NotStarted,
            termination: Vec::new(),
            recipe_errors: Vec::new(),
            memory: None,
            tmpfs: None,
            crash: None,
            extra_crashes: Vec::new(),
            internal_errors: Vec::new(),
            stderr: Vec::new(),
            archived: false,
        };

        let recipes = RecipeRunner::new(self.config, &paths.work_dir);
        self.enter(attempt, AttemptState::Initial);
        let trace = match self.initialize(&paths, &recipes) {
            Ok(trace) => Some(trace),
            Err(error) => {
                run.internal(error);
                None
            }
        };

        let mut view = None;
        if run.is_ok() {
            self.enter(attempt, AttemptState::SetupEnvironment);
            match IsolatedView::create(
                &paths.work_dir,
                &self.config.data_roots,
                self.config.tmpfs_size.is_some(),
            ) {
                Ok(created) => view = Some(created),
                Err(error) => run.internal(error.into()),
            }
        }

        let mut started = 0;
        if run.is_ok() && !self.config.recipes.is_empty() {
            self.enter(attempt, AttemptState::RecipeStart);
            let (count, error) = recipes.start_all(self.cancel).await;
            started = count;
            run.recipe_errors.extend(error);
        }

        if let Some(view) = &view
            && run.is_ok()
            && run.recipe_errors.is_empty()
            && !self.cancel.is_cancelled()
        {
            self.enter(attempt, AttemptState::RunTest);
            match recipes.read_env() {
                Ok(recipe_env) => {
                    if let Err(error) = self.run_test(&paths, view, recipe_env, &mut run).await {
                        run.internal(error);
                    }
                }
                Err(error) => run.recipe_errors.push(error),
            }
        }

        if started > 0 {
            self.enter(attempt, AttemptState::RecipeStop);
            run.recipe_errors.extend(recipes.stop_all(started).await);
        }

        self.enter(attempt, AttemptState::Finalize);
        self.finalize(&paths, trace, run, stopwatch).await
    }

    fn enter(&self, attempt: u32, state: AttemptState) {
        debug!(attempt, %state, "entering attempt state");
    }

    fn initialize(
        &self,
        paths: &AttemptPaths,
        recipes: &RecipeRunner<'_>,
    ) -> Result<TraceWriter, SupervisorError> {
        let work_dir_error = |error| SupervisorError::WorkDir {
            path: paths.work_dir.clone(),
            error,
        };
        std::fs::create_dir_all(&paths.output_dir).map_err(work_dir_error)?;
        remove_meta_result(&paths.meta).map_err(work_dir_error)?;
        recipes.clear_env().map_err(work_dir_error)?;
        // A trace left behind by a crashed run is kept for forensics, but not appended to.
        match std::fs::rename(&paths.trace, &paths.wreckage) {
            Ok(()) => warn!(path = %paths.wreckage, "kept trace file from an earlier run"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(work_dir_error(error)),
        }
        touch(&paths.stdout).map_err(work_dir_error)?;
        touch(&paths.stderr).map_err(work_dir_error)?;
        touch(&paths.archive).map_err(work_dir_error)?;

        // Placeholders go first, so that a crash at any point still accounts for every test.
        let trace = TraceWriter::open(&paths.trace)?;
        let chunk = ChunkRef::to_chunk(&self.config.chunk);
        for id in &self.config.expected_tests {
            let mut value = SubtestFinishedValue::new(TestCase::placeholder(id.clone()));
            value.chunk = chunk.clone();
            trace.write(TraceEventKind::SubtestFinished(Box::new(value)))?;
        }
        Ok(trace)
    }

    async fn run_test(
        &self,
        paths: &AttemptPaths,
        view: &IsolatedView,
        recipe_env: std::collections::BTreeMap<String, String>,
        run: &mut AttemptRun,
    ) -> Result<(), SupervisorError> {
        let config = self.config;
        let command = view.rebase_command(&config.command);
        let cwd = view.rebase_cwd(&config.cwd);
        run.cwd = cwd.clone();

        // Held until the test exits.
        let _reserve = match config.reserve_space {
            Some(size) => Some(ReserveGuard::create(&paths.reserve, size)?),
            None => None,
        };

        let stdout = create_output(&paths.stdout)?;
        let stderr = create_output(&paths.stderr)?;
        let command_line = shell_words::join(&command);
        let spawn_error = |error| ChildStartError::Spawn {
            command: command_line.clone(),
            error: Arc::new(error),
        };

        let mut cmd = std::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&cwd)
            .envs(&config.env)
            .envs(&recipe_env)
            .env(TRACE_FILE_ENV, &paths.trace)
            .env(OUTPUT_DIR_ENV, &paths.output_dir)
            .env(CORE_REGISTRY_ENV, &paths.core_registry)
            .env(ATTEMPT_ENV, run.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(ram_drive) = view.ram_drive() {
            cmd.env(RAM_DRIVE_ENV, ram_drive);
        }
        os::set_process_group(&mut cmd);
        let private_tmpfs = self.configure_tmpfs(&mut cmd, view).map_err(spawn_error)?;

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child
            .id()
            .expect("child has never been polled so must return a PID");
        info!(
            attempt = run.attempt,
            pid,
            command = %command_line,
            %cwd,
            "started test command",
        );

        let trim_cmdlines = !config.test_tags().no_pstree_trim;
        let memory =
            MemoryMonitor::spawn(pid, config.ram_limit, trim_cmdlines, self.cancel.clone());
        let tmpfs = view.ram_drive().map(|ram_drive| {
            // A private tmpfs is only visible through the child's mount namespace.
            let path = if private_tmpfs {
                Utf8PathBuf::from(format!("/proc/{pid}/root{ram_drive}"))
            } else {
                ram_drive.to_owned()
            };
            TmpfsMonitor::spawn(path, self.cancel.clone())
        });
        let watcher = OutputWatcher::spawn(
            &paths.trace,
            self.sink.cloned(),
            vec![paths.stdout.clone(), paths.stderr.clone()],
            config.output_warn_size,
            self.cancel,
        );

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(run.timeout) => Waited::TimedOut,
            _ = self.cancel.cancelled() => Waited::Cancelled,
        };
        let (status, stopped) = match waited {
            Waited::Exited(status) => {
                terminate::kill_leftovers(pid);
                (Some(status), None)
            }
            Waited::TimedOut => {
                run.termination = Escalation::new(config)
                    .terminate(&mut child, "test timed out")
                    .await;
                (terminate::reap(&mut child).await, Some(StopReason::TimedOut))
            }
            Waited::Cancelled => {
                run.termination = Escalation::new(config)
                    .terminate(&mut child, "run cancelled")
                    .await;
                (terminate::reap(&mut child).await, Some(StopReason::Cancelled))
            }
        };

        run.memory = Some(memory.stop().await);
        if let Some(tmpfs) = tmpfs {
            run.tmpfs = Some(tmpfs.stop().await);
        }
        let report = watcher.stop().await;
        debug!(
            attempt = run.attempt,
            live_lines = report.live_lines,
            oversized = report.oversized.len(),
            "output watcher stopped",
        );

        let status = status.transpose().map_err(SupervisorError::Wait)?;
        if status.is_none() {
            // The exit is synthesized and the attempt carries on to recipe teardown.
            run.internal(SupervisorError::Unreaped {
                pid,
                waited: terminate::REAP_WAIT,
            });
        }
        run.exit = classify_exit(status, stopped, run.timeout);
        info!(
            attempt = run.attempt,
            status = %status.map_or_else(|| "not reaped".to_owned(), display_exit_status),
            "test command {}",
            run.exit,
        );

        if let AttemptExit::Signaled { .. } = run.exit {
            let binary = Utf8Path::new(&command[0]);
            run.crash = Some(
                self.crash
                    .collect(pid, Some(binary), &cwd, &paths.backtrace)
                    .await,
            );
        }
        match CoreRegistry::new(&paths.core_registry).resolve(MAX_EXTRA_CORES) {
            Ok(registrations) => {
                for registration in registrations {
                    let out = paths
                        .work_dir
                        .join(format!("backtrace.{}.txt", registration.pid));
                    let report = self
                        .crash
                        .collect(
                            registration.pid,
                            registration.binary_path.as_deref(),
                            registration.cwd.as_deref().unwrap_or(cwd.as_path()),
                            &out,
                        )
                        .await;
                    run.extra_crashes.push((registration.pid, report));
                }
            }
            Err(error) => {
                warn!("error reading core registry: {}", DisplayErrorChain(&error));
            }
        }

        run.stderr = read_or_empty(&paths.stderr).map_err(|error| SupervisorError::StderrRead {
            path: paths.stderr.clone(),
            error,
        })?;
        Ok(())
    }

    /// Sets up the private tmpfs, if one was requested. Returns true if the ram drive lives in a
    /// private mount namespace.
    fn configure_tmpfs(
        &self,
        cmd: &mut std::process::Command,
        view: &IsolatedView,
    ) -> io::Result<bool> {
        let (Some(size), Some(ram_drive)) = (self.config.tmpfs_size, view.ram_drive()) else {
            return Ok(false);
        };
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let map_root_user = self.config.test_tags().map_root_user;
                os::configure_private_tmpfs(cmd, ram_drive, size, map_root_user)?;
                Ok(true)
            } else {
                let _ = (cmd, size);
                warn!(
                    %ram_drive,
                    "a private tmpfs is only supported on Linux, using a plain directory",
                );
                Ok(false)
            }
        }
    }

    async fn finalize(
        &self,
        paths: &AttemptPaths,
        trace: Option<TraceWriter>,
        mut run: AttemptRun,
        stopwatch: StopwatchStart,
    ) -> AttemptOutcome {
        let config = self.config;

        if config.archive_output && paths.output_dir.is_dir() {
            let options = ArchiveOptions {
                truncate_files: config.archive_truncate_files,
                drop_non_regular: config.archive_drop_non_regular,
            };
            let (dir, out) = (paths.output_dir.clone(), paths.archive.clone());
            let archived =
                tokio::task::spawn_blocking(move || archive_output_dir(&dir, &out, options)).await;
            match archived {
                Ok(Ok(_)) => run.archived = true,
                Ok(Err(error)) => run.internal(error.into()),
                Err(error) => error!(%error, "archive task failed"),
            }
        }

        let (mut suite, replay) = match &trace {
            Some(trace) => match TraceReplayer::new(ReplayMode::Relaxed)
                .default_chunk(config.chunk.clone())
                .replay_path(trace.path(), self.base_suite())
            {
                Ok(replayed) => replayed,
                Err(error) => {
                    run.internal(error.into());
                    (self.base_suite(), ReplaySummary::default())
                }
            },
            None => (self.base_suite(), ReplaySummary::default()),
        };
        self.annotate(&mut suite, &run, paths);

        if let Some(trace) = &trace
            && let Err(error) = self.write_projections(trace, &suite)
        {
            let error = SupervisorError::from(error);
            report_internal(&mut suite, &error);
            run.internal(error);
        }

        let snapshot = stopwatch.snapshot();
        let meta = MetaResult {
            exit_code: run.exit.exit_code(),
            elapsed: snapshot.duration.as_secs_f64(),
            start_time: MetaResult::format_time(&snapshot.start_time),
            end_time: MetaResult::format_time(&snapshot.end_time()),
            cwd: run.cwd.clone(),
            test_timeout: run.timeout.as_secs_f64(),
            test_size: config.size,
            test_tags: config.tags.iter().cloned().collect(),
            test_type: config.test_type.clone(),
        };
        if let Err(error) = write_meta_result(&paths.meta, &meta) {
            let error = SupervisorError::from(error);
            report_internal(&mut suite, &error);
            run.internal(error);
        }

        AttemptOutcome {
            attempt: run.attempt,
            work_dir: paths.work_dir.clone(),
            timeout: run.timeout,
            suite,
            replay,
            meta,
            exit: run.exit,
            termination: run.termination,
            recipe_errors: run.recipe_errors,
            memory: run.memory,
            tmpfs: run.tmpfs,
            crash: run.crash,
            extra_crashes: run.extra_crashes,
            internal_errors: run.internal_errors,
            stderr: run.stderr,
        }
    }

    /// The suite before any trace events are applied: metadata plus placeholders.
    fn base_suite(&self) -> Suite {
        let config = self.config;
        let mut suite = Suite::new(config.project_path.clone(), config.size);
        suite.tags = config.tags.clone();
        suite.platform = config.platform.clone();
        let chunk = suite.chunk_mut(&config.chunk);
        for id in &config.expected_tests {
            chunk.test_mut(id);
        }
        suite
    }

    /// Records what the supervisor observed on top of what the test reported.
    fn annotate(&self, suite: &mut Suite, run: &AttemptRun, paths: &AttemptPaths) {
        let config = self.config;

        for error in &run.recipe_errors {
            let (status, origin) = recipe_error_origin(error);
            suite.add_error(status, DisplayErrorChain(error).to_string(), origin);
        }
        for error in &run.internal_errors {
            report_internal(suite, error);
        }
        if run.exit == AttemptExit::NotStarted && run.is_ok() && self.cancel.is_cancelled() {
            suite.add_error(
                Status::Internal,
                "the run was cancelled before the test started",
                ErrorOrigin::Infrastructure,
            );
        }
        for (pid, report) in &run.extra_crashes {
            if let Some(core) = &report.core {
                suite.logs.insert(format!("core.{pid}"), core.clone());
            }
            if let Some(backtrace) = &report.backtrace {
                suite.logs.insert(format!("backtrace.{pid}"), backtrace.clone());
            }
        }

        let chunk = suite.chunk_mut(&config.chunk);
        chunk.logs.insert("stdout".to_owned(), paths.stdout.clone());
        chunk.logs.insert("stderr".to_owned(), paths.stderr.clone());
        if run.archived {
            chunk.logs.insert("output".to_owned(), paths.archive.clone());
        }

        let stderr_tail = || {
            let limit = config.stderr_snippet_limit.as_u64() as usize;
            let snippet = read_snippet(&paths.stderr, limit).unwrap_or_default();
            if snippet.is_empty() {
                String::new()
            } else {
                format!("\nstderr:\n{snippet}")
            }
        };
        match run.exit {
            AttemptExit::Exited { code: 0 } | AttemptExit::NotStarted => {}
            AttemptExit::Exited { code } => {
                chunk.add_error(
                    Status::Fail,
                    format!("test command exited with code {code}{}", stderr_tail()),
                    ErrorOrigin::Test,
                );
            }
            AttemptExit::Signaled { .. } => {
                let mut message = format!("test command crashed: {}", run.exit);
                if let Some(report) = &run.crash {
                    swrite!(message, "\n{}", report.describe());
                    if let Some(core) = &report.core {
                        chunk.logs.insert("core".to_owned(), core.clone());
                    }
                    if let Some(backtrace) = &report.backtrace {
                        chunk.logs.insert("backtrace".to_owned(), backtrace.clone());
                    }
                }
                chunk.add_error(Status::Crashed, message, ErrorOrigin::Test);
            }
            AttemptExit::TimedOut { .. } => {
                chunk.add_error(
                    Status::Timeout,
                    format!("test command {}{}", run.exit, stderr_tail()),
                    ErrorOrigin::Test,
                );
            }
            AttemptExit::Cancelled { .. } => {
                chunk.add_error(
                    Status::Internal,
                    "the run was cancelled while the test was running",
                    ErrorOrigin::Infrastructure,
                );
            }
        }

        if let Some(memory) = &run.memory {
            chunk
                .metrics
                .insert("peak_rss_bytes".to_owned(), memory.peak_rss.as_u64() as f64);
            if memory.limit_exceeded
                && let Some(limit) = config.ram_limit
            {
                match std::fs::write(&paths.ram_limit_tree, memory.peak_snapshot.to_string()) {
                    Ok(()) => {
                        chunk
                            .logs
                            .insert("ram_limit_tree".to_owned(), paths.ram_limit_tree.clone());
                    }
                    Err(error) => {
                        warn!(path = %paths.ram_limit_tree, %error, "error writing process tree");
                    }
                }
                let message = format!(
                    "RAM limit exceeded: peak usage {} is over the limit of {limit}",
                    memory.peak_rss,
                );
                if config.strict_limits {
                    chunk.add_error(Status::Fail, message, ErrorOrigin::Test);
                } else {
                    warn!("{message}");
                }
            }
        }
        if let Some(tmpfs) = &run.tmpfs {
            chunk
                .metrics
                .insert("tmpfs_peak_bytes".to_owned(), tmpfs.peak_used_bytes as f64);
            chunk
                .metrics
                .insert("tmpfs_peak_inodes".to_owned(), tmpfs.peak_used_inodes as f64);
        }
    }

    /// Appends the supervisor's view of the chunk and suite, so that replaying the trace yields
    /// the same suite as the one returned.
    fn write_projections(&self, trace: &TraceWriter, suite: &Suite) -> Result<(), TraceWriteError> {
        if let Some(chunk) = suite.chunk(&self.config.chunk) {
            trace.write(TraceEventKind::ChunkEvent(ChunkEventValue {
                chunk: ChunkRef::to_chunk(&chunk.id),
                errors: Some(chunk.errors.clone()),
                logs: Some(chunk.logs.clone()),
                metrics: Some(chunk.metrics.clone()),
            }))?;
        }
        trace.write(TraceEventKind::SuiteEvent(SuiteEventValue {
            errors: Some(suite.errors.clone()),
            logs: Some(suite.logs.clone()),
            metrics: Some(suite.metrics.clone()),
            flaky: Some(suite.flaky),
        }))?;
        trace.sync()
    }
}

/// Classifies how the test command ended. `status` is `None` if a stopped command was never
/// reaped, in which case it's recorded as killed.
fn classify_exit(
    status: Option<ExitStatus>,
    stopped: Option<StopReason>,
    timeout: Duration,
) -> AttemptExit {
    let exit_code = status.map_or(terminate::UNREAPED_EXIT_CODE, |status| {
        AttemptExit::from_status(status).exit_code()
    });
    match (stopped, status) {
        (None, Some(status)) => AttemptExit::from_status(status),
        (None, None) => AttemptExit::Exited { code: exit_code },
        (Some(StopReason::TimedOut), _) => AttemptExit::TimedOut {
            after: timeout,
            exit_code,
        },
        (Some(StopReason::Cancelled), _) => AttemptExit::Cancelled { exit_code },
    }
}

fn create_output(path: &Utf8Path) -> Result<File, ChildStartError> {
    File::create(path).map_err(|error| ChildStartError::OutputFile {
        path: path.to_owned(),
        error: Arc::new(error),
    })
}

fn report_internal(suite: &mut Suite, error: &SupervisorError) {
    suite.add_error(
        Status::Internal,
        DisplayErrorChain(error).to_string(),
        ErrorOrigin::Infrastructure,
    );
}

fn recipe_error_origin(error: &RecipeError) -> (Status, ErrorOrigin) {
    let phase = match error {
        RecipeError::StartupFailed { .. } => RecipePhase::Start,
        RecipeError::TeardownFailed { .. } => RecipePhase::Stop,
        RecipeError::Spawn { phase, .. } => *phase,
        _ => return (Status::Internal, ErrorOrigin::Infrastructure),
    };
    let recipe = SmolStr::from(error.recipe().unwrap_or_default());
    match phase {
        RecipePhase::Start => (Status::Fail, ErrorOrigin::RecipeStartup { recipe }),
        RecipePhase::Stop => (Status::Fail, ErrorOrigin::RecipeTeardown { recipe }),
    }
}
