// Copyright (c) The testvisor Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, ensure};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use testvisor_metadata::{ErrorOrigin, MetaResult, Status, TestvisorExitCode};
use testvisor_runner::{
    cancel::CancellationToken,
    config::elements::ShutdownSignal,
    supervisor::{AttemptExit, EscalationSignal, FinishReason, RetryDecision, Supervisor},
    trace::{ReplayMode, TraceReplayer},
};

#[tokio::test]
async fn passing_test_reports_results() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let script = format!(
        "{}\necho hello\necho \"attempt $TESTVISOR_ATTEMPT\" > \"$TESTVISOR_OUTPUT_DIR/note.txt\"",
        report_test("test_a", Status::Good),
    );
    let config = sh_config(
        temp.path(),
        &script,
        "60s",
        indoc! {r#"
            [[expected-tests]]
            path = "t.sh"
            name = "test_a"
        "#},
    );
    let chunk = config.chunk.clone();
    let sink = Arc::new(RecordingSink::default());
    let supervisor =
        Supervisor::new(config, CancellationToken::new())?.with_status_sink(sink.clone());

    let outcome = supervisor.run().await;
    assert_eq!(outcome.exit_code, TestvisorExitCode::OK);
    assert_eq!(
        outcome.decision,
        RetryDecision::Finish(FinishReason::EmptyStderr)
    );
    assert_eq!(outcome.attempts.len(), 1);

    let attempt = &outcome.attempts[0];
    assert_eq!(attempt.exit, AttemptExit::Exited { code: 0 });
    assert_eq!(attempt.work_dir, temp.path().join("work"));
    assert_eq!(
        find_test(&outcome.suite, "test_a").map(|case| case.status),
        Some(Status::Good)
    );

    let logs = &outcome.suite.chunk(&chunk).expect("chunk exists").logs;
    let stdout = std::fs::read_to_string(&logs["stdout"])?;
    assert_eq!(stdout, "hello\n");
    ensure!(logs["output"].exists(), "output archive exists");

    let meta = std::fs::read(temp.path().join("work/meta.json"))?;
    let meta: MetaResult = serde_json::from_slice(&meta)?;
    assert_eq!(meta.exit_code, 0);
    assert_eq!(meta.cwd, temp.path());

    // The trace file alone reproduces the attempt's result.
    let (replayed, _) = TraceReplayer::new(ReplayMode::Strict)
        .replay_path(&temp.path().join("work/trace.jsonl"), Default::default())?;
    assert_eq!(replayed.chunks, attempt.suite.chunks);
    assert_eq!(replayed.errors, attempt.suite.errors);

    let lines = sink.lines();
    assert_eq!(lines.len(), 1, "one live line: {lines:?}");
    assert_eq!(lines[0].id, test_id("test_a"));
    assert_eq!(lines[0].status, Status::Good);
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried_up_to_the_bound() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let config = sh_config(
        temp.path(),
        "echo \"bind: Address already in use\" >&2\nexit 1",
        "60s",
        "retry = 2",
    );
    let chunk = config.chunk.clone();

    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.attempts.len(), 3, "first attempt plus two restarts");
    assert_eq!(
        outcome.decision,
        RetryDecision::Finish(FinishReason::AttemptsExhausted)
    );
    assert_eq!(outcome.exit_code, TestvisorExitCode::TESTS_FAILED);

    // Earlier attempts are preserved, and their logs still point at their files.
    for (index, attempt) in outcome.attempts[..2].iter().enumerate() {
        let preserved = temp.path().join(format!("work.attempt-{}", index + 1));
        assert_eq!(attempt.work_dir, preserved);
        let stderr = &attempt.suite.chunk(&chunk).expect("chunk exists").logs["stderr"];
        assert_eq!(stderr, &preserved.join("stderr.log"));
        ensure!(stderr.exists(), "{stderr} exists");
    }
    assert_eq!(outcome.attempts[2].work_dir, temp.path().join("work"));

    let merged = outcome.suite.chunk(&chunk).expect("chunk exists");
    assert_eq!(merged.errors.len(), 1, "errors: {:?}", merged.errors);
    let error = &merged.errors[0];
    assert_eq!(error.status, Status::Fail);
    ensure!(
        error
            .message
            .starts_with("Error from 3 runs [1, 2, 3]: test command exited with code 1"),
        "message has provenance: {}",
        error.message
    );
    ensure!(
        error.message.contains("Address already in use"),
        "message has the stderr snippet: {}",
        error.message
    );
    for run in 1..=3 {
        ensure!(
            merged.logs.contains_key(&format!("stderr.run{run}")),
            "log for run {run}: {:?}",
            merged.logs
        );
    }
    Ok(())
}

#[tokio::test]
async fn recipe_start_failure_skips_the_test() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let config = sh_config(
        temp.path(),
        "touch ran.txt",
        "60s",
        indoc! {r#"
            [[recipes]]
            name = "a"
            program = "/bin/sh"
            args = ["-c", "echo \"a $1\" >> phases.log", "a"]
            timeout = "30s"

            [[recipes]]
            name = "b"
            program = "/bin/sh"
            args = ["-c", "echo \"b $1\" >> phases.log; [ \"$1\" = stop ] || { echo no database >&2; exit 2; }", "b"]
            timeout = "30s"
        "#},
    );

    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(
        outcome.decision,
        RetryDecision::Finish(FinishReason::RecipeFailed)
    );
    assert_eq!(outcome.exit_code, TestvisorExitCode::TESTS_FAILED);

    let attempt = &outcome.attempts[0];
    assert_eq!(attempt.exit, AttemptExit::NotStarted);
    assert_eq!(attempt.meta.exit_code, 1);
    ensure!(!temp.path().join("ran.txt").exists(), "test must not run");
    // Only the recipe that started is stopped.
    assert_eq!(
        std::fs::read_to_string(temp.path().join("phases.log"))?,
        "a start\nb start\na stop\n"
    );

    let errors = &outcome.suite.errors;
    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert_eq!(errors[0].status, Status::Fail);
    assert_eq!(
        errors[0].origin,
        ErrorOrigin::RecipeStartup {
            recipe: "b".into()
        }
    );
    ensure!(
        errors[0].message.contains("no database"),
        "message has the recipe's stderr: {}",
        errors[0].message
    );
    Ok(())
}

#[tokio::test]
async fn timeout_escalates_through_signals() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let script = indoc! {r#"
        trap 'echo USR1 >> signals.log' USR1
        trap 'echo TERM >> signals.log; exit 3' TERM
        while true; do sleep 0.1; done
    "#};
    let config = sh_config(
        temp.path(),
        script.trim_end(),
        "1s",
        indoc! {r#"
            smooth-shutdown-signals = ["SIGUSR1"]
            shutdown-grace-period = "1s"
            kill-grace-period = "1s"
        "#},
    );
    let chunk = config.chunk.clone();

    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.attempts.len(), 1);
    let attempt = &outcome.attempts[0];
    match attempt.exit {
        AttemptExit::TimedOut { exit_code, .. } => assert_eq!(exit_code, 3),
        other => panic!("expected a timeout, got {other:?}"),
    }
    let steps: Vec<_> = attempt
        .termination
        .iter()
        .map(|step| (step.signal, step.exited))
        .collect();
    assert_eq!(
        steps,
        vec![
            (EscalationSignal::Smooth(ShutdownSignal::User1), false),
            (EscalationSignal::Term, true),
        ]
    );
    assert_eq!(
        std::fs::read_to_string(temp.path().join("signals.log"))?,
        "USR1\nTERM\n"
    );

    let errors = &outcome.suite.chunk(&chunk).expect("chunk exists").errors;
    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert_eq!(errors[0].status, Status::Timeout);
    assert_eq!(outcome.exit_code, TestvisorExitCode::TESTS_FAILED);
    Ok(())
}

#[tokio::test]
async fn retry_after_timeout_keeps_placeholders() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let script = format!(
        "if [ \"$TESTVISOR_ATTEMPT\" = 1 ]; then\n\
         echo \"Connection reset by peer\" >&2\n\
         sleep 30\n\
         fi\n\
         {}",
        report_test("test_a", Status::Good),
    );
    let config = sh_config(
        temp.path(),
        &script,
        "1s",
        indoc! {r#"
            kill-grace-period = "1s"

            [[expected-tests]]
            path = "t.sh"
            name = "test_a"

            [[expected-tests]]
            path = "t.sh"
            name = "test_b"
        "#},
    );

    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.attempts.len(), 2);
    ensure!(
        matches!(outcome.attempts[0].exit, AttemptExit::TimedOut { .. }),
        "first attempt timed out: {:?}",
        outcome.attempts[0].exit
    );
    assert_eq!(outcome.attempts[1].exit, AttemptExit::Exited { code: 0 });

    // The first attempt never reached either test, so both were placeholders.
    for name in ["test_a", "test_b"] {
        assert_eq!(
            find_test(&outcome.attempts[0].suite, name).map(|case| case.status),
            Some(Status::NotLaunched),
            "{name} in attempt 1"
        );
    }
    assert_eq!(
        find_test(&outcome.suite, "test_a").map(|case| case.status),
        Some(Status::Good)
    );
    assert_eq!(
        find_test(&outcome.suite, "test_b").map(|case| case.status),
        Some(Status::NotLaunched)
    );
    // test_b never reported, so the run failed.
    assert_eq!(outcome.exit_code, TestvisorExitCode::TESTS_FAILED);
    Ok(())
}

#[tokio::test]
async fn cancellation_before_start_is_internal() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let config = sh_config(temp.path(), "touch ran.txt", "60s", "");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = Supervisor::new(config, cancel)?.run().await;
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].exit, AttemptExit::NotStarted);
    assert_eq!(
        outcome.decision,
        RetryDecision::Finish(FinishReason::Cancelled)
    );
    ensure!(!temp.path().join("ran.txt").exists(), "test must not run");
    assert_eq!(outcome.suite.rollup_status(), Status::Internal);
    assert_eq!(outcome.exit_code, TestvisorExitCode::INFRASTRUCTURE_ERROR);
    Ok(())
}

#[tokio::test]
async fn infrastructure_markers_abort_large_tests() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    let config = sh_config(
        temp.path(),
        "echo \"write: No space left on device\" >&2\nexit 1",
        "60s",
        "size = \"large\"",
    );

    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(
        outcome.decision,
        RetryDecision::AbortInfrastructure {
            marker: "No space left on device".to_owned()
        }
    );
    assert_eq!(outcome.exit_code, TestvisorExitCode::INFRASTRUCTURE_ERROR);
    ensure!(
        outcome
            .suite
            .errors
            .iter()
            .any(|error| error.status == Status::Internal),
        "suite has an internal error: {:?}",
        outcome.suite.errors
    );
    Ok(())
}

#[tokio::test]
async fn reused_work_dir_starts_clean() -> Result<()> {
    test_init();
    let temp = Utf8TempDir::new()?;
    std::fs::create_dir_all(temp.path().join("data"))?;
    let data_root = format!(
        "[[data-roots]]\nsource = \"{}/data\"\ntarget = \"data\"\n",
        temp.path()
    );
    let env_file = temp.path().join("work/recipe-env.jsonl");
    let recipe = format!(
        "[[recipes]]\n\
         name = \"env\"\n\
         program = \"/bin/sh\"\n\
         args = ['-c', '''[ \"$1\" = start ] && echo '{{\"LEAKED\": \"1\"}}' > {env_file}; exit 0''', 'env']\n"
    );
    let script = "echo \"leaked=$LEAKED\"";

    let config = sh_config(temp.path(), script, "60s", &format!("{data_root}{recipe}"));
    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.exit_code, TestvisorExitCode::OK);
    assert_eq!(
        std::fs::read_to_string(temp.path().join("work/stdout.log"))?,
        "leaked=1\n",
        "the recipe's variables reach the test"
    );
    ensure!(env_file.exists(), "the recipe wrote its env file");

    // Same work dir, no recipes this time.
    let config = sh_config(temp.path(), script, "60s", &data_root);
    let outcome = Supervisor::new(config, CancellationToken::new())?.run().await;
    assert_eq!(outcome.exit_code, TestvisorExitCode::OK);
    let attempt = &outcome.attempts[0];
    ensure!(
        attempt.internal_errors.is_empty(),
        "the isolated view is rebuilt: {:?}",
        attempt.internal_errors
    );
    assert_eq!(attempt.exit, AttemptExit::Exited { code: 0 });
    assert_eq!(
        std::fs::read_to_string(temp.path().join("work/stdout.log"))?,
        "leaked=\n",
        "variables from the earlier run don't leak"
    );
    Ok(())
}
