//! Signal-driven execute outcomes. These live in their own test binary
//! because the abort signals are delivered to the whole process.


use std::time::Duration;

use drover::failreason;
use drover::job::JobState;
use drover::protocol::Method;
use mock_server::{reserve_one, MockServer, MockState};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const SHELL: &str = "/bin/bash";

fn signal_self_after(delay: Duration, signal: Signal) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        kill(Pid::this(), signal).expect("signal self");
    });
}

#[tokio::test]
async fn signal_after_time_overrun_is_out_of_time() {
    let server = MockServer::start(MockState::default()).await;
    let (mut queued, _cwd) = mock_server::test_job("sleep 10");
    // overrun almost immediately; the first touch tick latches it
    queued.requirements.time = Duration::from_millis(1);
    server.push_job(queued);
    let mut config = server.client_config();
    config.touch_interval = Duration::from_millis(100);
    let client = drover::Client::connect(config).await.unwrap();
    let mut job = reserve_one(&client).await;

    signal_self_after(Duration::from_millis(600), Signal::SIGUSR1);
    let err = client.execute(&mut job, SHELL).await.unwrap_err();

    assert_eq!(err.fail_reason(), Some(failreason::TIME));
    assert_eq!(job.state, JobState::Delayed);
    let state = server.state.lock().unwrap();
    let record = state.last_disposition().unwrap();
    assert_eq!(record.method, Method::JobRelease);
    assert_eq!(record.fail_reason, failreason::TIME);
    assert_ne!(record.jes.as_ref().unwrap().exitcode, 0);
}
