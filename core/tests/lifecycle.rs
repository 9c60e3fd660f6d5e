#![cfg(unix)]

use std::time::Duration;

use overseer_core::ProcessStatus;
use overseer_core::RunRequest;
use overseer_core::RunResult;
use overseer_core::SimpleId;
use overseer_core::Supervisor;
use overseer_core::SupervisorError;
use pretty_assertions::assert_eq;

fn open_supervisor(home: &tempfile::TempDir) -> Supervisor {
    Supervisor::open(home.path()).expect("open supervisor")
}

async fn wait_terminal(supervisor: &Supervisor, id: SimpleId) -> ProcessStatus {
    for _ in 0..100 {
        if let Some(record) = supervisor.registry().get(id) {
            if record.status.is_terminal() {
                return record.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("process {id} never reached a terminal status");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_command_completes_without_residue() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let result = supervisor
        .run(RunRequest::new("echo swift"))
        .await
        .expect("run");

    match result {
        RunResult::Completed {
            exit_code,
            captured_text,
        } => {
            assert_eq!(exit_code, Some(0));
            assert_eq!(captured_text, "swift\n");
        }
        other => panic!("expected fast completion, got {other:?}"),
    }
    assert!(supervisor.registry().list().is_empty());
    // The log file went with the record.
    let leftovers: Vec<_> = std::fs::read_dir(home.path().join("logs"))
        .expect("logs dir")
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_command_reports_nonzero_exit() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let result = supervisor
        .run(RunRequest::new("sh -c 'exit 7'"))
        .await
        .expect("run");
    match result {
        RunResult::Completed { exit_code, .. } => assert_eq!(exit_code, Some(7)),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_command_is_promoted_and_finishes_in_background() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("echo early; sleep 1; echo late");
    request.sync_timeout = Duration::from_millis(200);
    let result = supervisor.run(request).await.expect("run");

    let id = match result {
        RunResult::Running {
            simple_id,
            captured_text,
        } => {
            assert_eq!(captured_text, "early\n");
            simple_id
        }
        other => panic!("expected promotion, got {other:?}"),
    };

    let record = supervisor.registry().get(id).expect("record");
    assert_eq!(record.status, ProcessStatus::Running);
    assert!(record.native_pid > 0);

    let status = wait_terminal(&supervisor, id).await;
    assert_eq!(status, ProcessStatus::Completed { exit_code: Some(0) });

    // Promoted output is retained and each line appears exactly once.
    let log = supervisor.log(id).expect("log");
    assert_eq!(log.text(), "early\nlate\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_running_hint_skips_the_sync_wait() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("sleep 5");
    request.is_long_running = true;
    let started = std::time::Instant::now();
    let result = supervisor.run(request).await.expect("run");
    assert!(started.elapsed() < Duration::from_secs(2));

    let id = result.simple_id().expect("promoted id");
    supervisor.kill(id, true).await.expect("kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_defaults_to_most_recent_running_process() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut first = RunRequest::new("sleep 30");
    first.is_long_running = true;
    let first_id = supervisor
        .run(first)
        .await
        .expect("run")
        .simple_id()
        .expect("id");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = RunRequest::new("sleep 30");
    second.is_long_running = true;
    let second_id = supervisor
        .run(second)
        .await
        .expect("run")
        .simple_id()
        .expect("id");

    let target = supervisor.resolve(None).expect("default target");
    assert_eq!(target.simple_id, second_id);

    supervisor.kill(target.simple_id, false).await.expect("kill");
    let status = wait_terminal(&supervisor, second_id).await;
    assert_eq!(status, ProcessStatus::Killed);

    // The earlier process is untouched.
    let first_record = supervisor.registry().get(first_id).expect("record");
    assert_eq!(first_record.status, ProcessStatus::Running);
    supervisor.kill(first_id, true).await.expect("cleanup kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_escalates_when_sigterm_is_ignored() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("trap '' TERM; sleep 60");
    request.is_long_running = true;
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");
    // Give the shell a moment to install the trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.kill(id, false).await.expect("kill escalates");
    let status = wait_terminal(&supervisor, id).await;
    assert_eq!(status, ProcessStatus::Killed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_kill_reaps_background_children_holding_the_pipes() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    // The background sleep inherits the output pipes and would outlive a
    // shell-only kill; the exec'd sleep is what the record's pid points at.
    let mut request = RunRequest::new("sleep 60 & exec sleep 300");
    request.is_long_running = true;
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");
    let pid = supervisor.registry().get(id).expect("record").native_pid;

    supervisor.kill(id, true).await.expect("forced kill");
    let status = wait_terminal(&supervisor, id).await;
    assert_eq!(status, ProcessStatus::Killed);

    // The whole process group goes down, background child included.
    let mut group_gone = false;
    for _ in 0..40 {
        if unsafe { libc::killpg(pid as libc::pid_t, 0) } != 0 {
            group_gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(group_gone, "process group survived the forced kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_kill_reaches_forked_grandchildren() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    // Plain shells fork for this, so the tracked pid is the shell and the
    // sleep is a grandchild; a pid-only SIGTERM would strand it.
    let mut request = RunRequest::new("sleep 30");
    request.is_long_running = true;
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");
    let pid = supervisor.registry().get(id).expect("record").native_pid;

    supervisor.kill(id, false).await.expect("graceful kill");
    let status = wait_terminal(&supervisor, id).await;
    assert_eq!(status, ProcessStatus::Killed);

    let mut group_gone = false;
    for _ in 0..40 {
        if unsafe { libc::killpg(pid as libc::pid_t, 0) } != 0 {
            group_gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(group_gone, "process group survived the graceful kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_timeout_marks_timed_out() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("sleep 30");
    request.is_long_running = true;
    request.hard_timeout = Some(Duration::from_millis(300));
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");

    let status = wait_terminal(&supervisor, id).await;
    assert_eq!(status, ProcessStatus::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_line_to_noninteractive_process_is_rejected() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("sleep 10");
    request.is_long_running = true;
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");

    let err = supervisor
        .bridge()
        .send_line(id, "hello")
        .await
        .expect_err("non-interactive rejection");
    assert!(matches!(err, SupervisorError::NotInteractive { .. }));

    supervisor.kill(id, true).await.expect("cleanup kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactive_process_echoes_stdin_through_the_log() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("cat");
    request.interactive = true;
    let result = supervisor.run(request).await.expect("run");
    let id = match result {
        RunResult::Interactive { simple_id } => simple_id,
        other => panic!("expected interactive surface, got {other:?}"),
    };

    let record = supervisor.registry().get(id).expect("record");
    assert!(record.is_interactive);

    supervisor
        .bridge()
        .send_line(id, "ping")
        .await
        .expect("send line");

    let log = supervisor.log(id).expect("log");
    let mut saw_ping = false;
    for _ in 0..50 {
        if log.text().contains("ping") {
            saw_ping = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_ping, "stdin never surfaced in the captured output");

    supervisor.kill(id, true).await.expect("kill");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_reconciles_dead_processes_and_replays_logs() {
    let home = tempfile::tempdir().expect("tempdir");
    let id;
    {
        let supervisor = open_supervisor(&home);
        let mut request = RunRequest::new("echo persisted; sleep 30");
        request.is_long_running = true;
        id = supervisor
            .run(request)
            .await
            .expect("run")
            .simple_id()
            .expect("id");
        // Wait for the first line to land in the log mirror.
        let log = supervisor.log(id).expect("log");
        for _ in 0..50 {
            if !log.text().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        supervisor.kill(id, true).await.expect("kill");
        wait_terminal(&supervisor, id).await;
    }

    // A fresh instance over the same home sees the record; its pid is dead,
    // so a stale Running marker would have been reconciled here too.
    let reopened = open_supervisor(&home);
    let record = reopened.registry().get(id).expect("record survives restart");
    assert!(record.status.is_terminal());
    assert_eq!(reopened.log(id).expect("log").text(), "persisted\n");

    // And purge drops both record and log.
    reopened.purge(id).expect("purge");
    assert!(reopened.registry().get(id).is_none());
    assert!(matches!(
        reopened.purge(id),
        Err(SupervisorError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolve_prefers_simple_id_and_rejects_unknown_references() {
    let home = tempfile::tempdir().expect("tempdir");
    let supervisor = open_supervisor(&home);

    let mut request = RunRequest::new("sleep 10");
    request.is_long_running = true;
    let id = supervisor
        .run(request)
        .await
        .expect("run")
        .simple_id()
        .expect("id");
    let record = supervisor.registry().get(id).expect("record");

    assert_eq!(
        supervisor
            .resolve(Some(&id.to_string()))
            .expect("by simple id")
            .simple_id,
        id
    );
    assert_eq!(
        supervisor
            .resolve(Some(&record.native_pid.to_string()))
            .expect("by pid")
            .simple_id,
        id
    );
    assert!(matches!(
        supervisor.resolve(Some("999999")),
        Err(SupervisorError::NotFound { .. })
    ));

    supervisor.kill(id, true).await.expect("cleanup kill");
}
