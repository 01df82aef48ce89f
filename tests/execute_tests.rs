//! End-to-end tests for `Client::execute`: real child processes supervised
//! against the mock server, covering every disposition the classifier can
//! reach without external signals (those live in their own test binaries).


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drover::job::{Job, JobState};
use drover::protocol::Method;
use drover::{failreason, DroverError};
use mock_server::{
    reserve_one, FailingBehaviours, FlakyMount, MockServer, MockState, RecordingBehaviours,
    UploadFailMount,
};

const SHELL: &str = "/bin/bash";

#[tokio::test]
async fn successful_cmd_is_archived() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, _cwd) = mock_server::test_job("true");
    queued.requirements.ram = 100;
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobArchive);
    let jes = record.jes.as_ref().unwrap();
    assert_eq!(jes.exitcode, 0);
    assert!(jes.exited);
    // own-process memory is folded in, so this can never be tiny
    assert!(jes.peak_ram >= 10, "peak_ram was {}", jes.peak_ram);

    // a unique hashed working directory was used and survives; its tmp
    // sibling does not
    assert!(!jes.cwd.is_empty());
    let actual_cwd = PathBuf::from(&jes.cwd);
    assert!(actual_cwd.is_dir());
    assert!(actual_cwd.ends_with("cwd"));
    let tmp = actual_cwd.parent().unwrap().join("tmp");
    assert!(!tmp.exists(), "tmp dir should be removed on return");
}

#[tokio::test]
async fn executing_a_job_reserved_by_someone_else_fails_fast() {
    let server = MockServer::start(MockState::default()).await;
    let client = server.client().await;
    let mut job = Job::new("true", "/tmp");
    job.reserved_by = Some(mock_server::other_client_id());

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(matches!(err, DroverError::MustReserve));
    assert!(server.state.lock().unwrap().dispositions.is_empty());
}

#[tokio::test]
async fn nonzero_exit_is_released_and_spends_a_retry() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("exit 42");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    let budget = job.until_buried;

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("exited with code 42"));

    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.until_buried, budget - 1);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::EXIT);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, 42);
}

#[tokio::test]
async fn command_not_found_is_buried() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("exec nonexistent-binary-for-this-test");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("127"));

    assert_eq!(job.state, JobState::Buried);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobBury);
    assert_eq!(record.fail_reason, failreason::CFOUND);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, 127);
}

#[tokio::test]
async fn non_executable_command_is_buried_as_permission_problem() {
    let server = MockServer::start(MockState::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("not-runnable");
    std::fs::write(&script, "#!/bin/sh\ntrue\n").unwrap();
    // no exec bit on purpose
    let mut queued = Job::new(script.to_string_lossy().into_owned(), dir.path().to_string_lossy().into_owned());
    queued.cwd_matters = true;
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap_err();

    assert_eq!(job.state, JobState::Buried);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.fail_reason, failreason::CPERM);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, 126);
}

#[tokio::test]
async fn time_overrun_without_a_signal_still_archives() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, _cwd) = mock_server::test_job("sleep 1");
    queued.requirements.time = Duration::from_millis(1);
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    let state = server.state.lock().unwrap();
    assert_eq!(state.last_disposition().unwrap().method, Method::JobArchive);
    // the touch ticker ran while the cmd slept
    assert!(state.touches >= 1);
}

#[tokio::test]
async fn kill_requested_through_touch_buries_the_job() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("sleep 10");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    server.request_kill(&job.key());

    let start = std::time::Instant::now();
    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(8), "kill should not wait for the sleep");
    assert_eq!(err.fail_reason(), Some(failreason::KILLED));

    assert_eq!(job.state, JobState::Buried);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobBury);
    assert_eq!(record.fail_reason, failreason::KILLED);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, -1);
}

#[tokio::test]
async fn missing_cwd_buries_without_running() {
    let server = MockServer::start(MockState::default()).await;
    server.push_job(Job::new("true", "/definitely/not/a/real/dir"));
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    assert_eq!(job.state, JobState::Buried);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobBury);
    assert_eq!(record.fail_reason, failreason::CWD);
    assert!(record.jes.is_none());
}

#[tokio::test]
async fn unstartable_shell_releases_with_start_reason() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    let err = client
        .execute(&mut job, "/no/such/shell/binary")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("could not start command"));

    assert_eq!(job.state, JobState::Delayed);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::START);
}

#[tokio::test]
async fn started_failure_kills_the_cmd_and_reports_nothing() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("sleep 10");
    server.push_job(queued);
    server.fail_next(Method::JobStart, 1);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    let start = std::time::Instant::now();
    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(8));
    assert!(err.to_string().contains("started running, but I killed it"));
    assert!(server.state.lock().unwrap().dispositions.is_empty());
}

#[tokio::test]
async fn mount_failure_buries_the_job() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    job.mount_driver = Some(Arc::new(FlakyMount::new(u32::MAX, "mount blew up")));

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("failed to mount remote file system(s)"));

    assert_eq!(job.state, JobState::Buried);
    let state = server.state.lock().unwrap();
    assert_eq!(
        state.last_disposition().unwrap().fail_reason,
        failreason::MOUNT
    );
}

#[tokio::test]
async fn known_transient_mount_failure_is_retried_once() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    let mount = Arc::new(FlakyMount::new(1, "fusermount exited with code 256"));
    job.mount_driver = Some(mount.clone());

    client.execute(&mut job, SHELL).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    assert_eq!(mount.attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn behaviours_are_triggered_with_the_outcome() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    let behaviours = Arc::new(RecordingBehaviours::default());
    job.behaviours = Some(behaviours.clone());

    client.execute(&mut job, SHELL).await.unwrap();
    assert_eq!(*behaviours.calls.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn behaviour_problems_are_appended_to_stderr_on_failure() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("exit 3");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    job.behaviours = Some(Arc::new(FailingBehaviours));

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("behaviour(s) also had problem(s)"));

    let state = server.state.lock().unwrap();
    let jes = state.last_disposition().unwrap().jes.clone().unwrap();
    let stderr = String::from_utf8_lossy(&jes.stderr).into_owned();
    assert!(stderr.contains("Behaviour problems:"), "stderr was: {stderr}");
    assert!(stderr.contains("behaviour exploded"));
}

#[tokio::test]
async fn upload_failure_downgrades_success_to_release() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;
    job.mount_driver = Some(Arc::new(UploadFailMount));

    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(err.to_string().contains("failed to upload"));

    assert_eq!(job.state, JobState::Delayed);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::UPLOAD);
    // a clean exit code is overridden so the failure persists
    assert_eq!(record.jes.as_ref().unwrap().exitcode, -2);
}

#[tokio::test]
async fn final_report_is_retried_until_the_server_recovers() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("true");
    server.push_job(queued);
    server.fail_next(Method::JobArchive, 3);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    let state = server.state.lock().unwrap();
    assert_eq!(state.method_count(Method::JobArchive), 4);
}

#[tokio::test]
async fn stdout_is_filtered_and_bounded() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("printf 'a\\rb\\rc\\rdone\\n'; seq 1 5000");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    let state = server.state.lock().unwrap();
    let jes = state.last_disposition().unwrap().jes.clone().unwrap();
    let stdout = String::from_utf8_lossy(&jes.stdout).into_owned();
    // progress-bar middles suppressed
    assert!(stdout.starts_with("a\rc\rdone"), "stdout began: {:.40}", stdout);
    // head and tail bounded, middle omitted
    assert!(jes.stdout.len() <= 2 * 4096 + 64, "len {}", jes.stdout.len());
    assert!(stdout.contains("... omitting"));
    assert!(stdout.trim_end().ends_with("5000"));
}

#[tokio::test]
async fn tmpdir_is_exported_and_home_respects_change_home() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, _cwd) = mock_server::test_job("echo \"$TMPDIR\"; echo \"$HOME\"");
    queued.change_home = true;
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    let state = server.state.lock().unwrap();
    let jes = state.last_disposition().unwrap().jes.clone().unwrap();
    let stdout = String::from_utf8_lossy(&jes.stdout).into_owned();
    let mut lines = stdout.lines();
    let tmpdir = lines.next().unwrap();
    let home = lines.next().unwrap();
    assert!(tmpdir.ends_with("/tmp"), "TMPDIR was {tmpdir}");
    assert_eq!(home, jes.cwd, "HOME should be the actual cwd");
}

#[tokio::test]
async fn cwd_matters_runs_in_place_without_a_hashed_dir() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, cwd) = mock_server::test_job("pwd");
    queued.cwd_matters = true;
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    let state = server.state.lock().unwrap();
    let jes = state.last_disposition().unwrap().jes.clone().unwrap();
    assert!(jes.cwd.is_empty(), "no hashed dir should be recorded");
    let stdout = String::from_utf8_lossy(&jes.stdout).into_owned();
    let reported = std::fs::canonicalize(stdout.trim()).unwrap();
    let expected = std::fs::canonicalize(cwd.path()).unwrap();
    assert_eq!(reported, expected);
}

#[tokio::test]
async fn recorded_environment_is_reconstructed_for_the_cmd() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, _cwd) = mock_server::test_job("echo \"$DROVER_TEST_VALUE\"");
    queued.env_c =
        drover::codec::compress_env(&["DROVER_TEST_VALUE=from the queue".to_string()]).unwrap();
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap();

    let state = server.state.lock().unwrap();
    let jes = state.last_disposition().unwrap().jes.clone().unwrap();
    assert_eq!(String::from_utf8_lossy(&jes.stdout).trim(), "from the queue");
}

#[tokio::test]
async fn piped_cmds_get_pipefail() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("false | cat");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    client.execute(&mut job, SHELL).await.unwrap_err();

    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::EXIT);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, 1);
}
