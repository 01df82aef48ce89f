//! A lone abort signal (no time overrun) during execute. Separate binary:
//! signals hit the whole process, so this cannot share one with other
//! execute tests.


use std::time::Duration;

use drover::failreason;
use drover::job::JobState;
use drover::protocol::Method;
use mock_server::{reserve_one, MockServer, MockState};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const SHELL: &str = "/bin/bash";

#[tokio::test]
async fn signal_without_overrun_is_reported_as_signal() {
    let server = MockServer::start(MockState::default()).await;
    let (queued, _cwd) = mock_server::test_job("sleep 10");
    server.push_job(queued);
    let client = server.client().await;
    let mut job = reserve_one(&client).await;

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        kill(Pid::this(), Signal::SIGUSR2).expect("signal self");
    });
    let start = std::time::Instant::now();
    let err = client.execute(&mut job, SHELL).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(8), "signal should end the sleep early");

    assert_eq!(err.fail_reason(), Some(failreason::SIGNAL));
    assert_eq!(job.state, JobState::Delayed);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::SIGNAL);
    assert_eq!(record.jes.as_ref().unwrap().exitcode, -1);
}
