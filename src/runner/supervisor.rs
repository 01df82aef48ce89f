//! Running a reserved job's cmd under supervision.
//!
//! `Client::execute` blocks until the job has reached a terminal
//! disposition. Internally it runs the cmd as a child process and hosts
//! three concurrent watchers: a touch ticker keeping the reservation alive
//! (and carrying back kill requests), a memory ticker enforcing the job's
//! RAM requirement, and a signal subscription treating any abort signal as
//! an instruction to stop. Time overruns are observed but never enforced
//! by a kill; only an external signal arriving after the overrun turns
//! into an out-of-time failure.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::{failreason, DroverError, Result};
use crate::host;
use crate::job::{Job, JobEndState};
use crate::runner::output::{spawn_std_filter, PrefixSuffixSaver, STD_STREAM_BOUND};

/// How often the child's memory use is sampled.
const MEM_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How many times the terminal disposition RPC is attempted. With the
/// linear backoff this keeps retrying for over 12 hours, giving plenty of
/// time for a replacement server to come up.
const FINAL_STATE_RETRIES: u32 = 300;

/// Backoff unit between terminal disposition attempts; attempt n waits
/// n times this.
const FINAL_STATE_BACKOFF_STEP: Duration = Duration::from_millis(100);

impl Client {
    /// Run the given job's cmd and block until it exits, then trigger its
    /// behaviours, unmount and report its terminal disposition.
    ///
    /// The cmd runs under `shell` (which must understand
    /// `set -o pipefail`), with the environment recorded when the job was
    /// added, in the job's cwd. When `cwd_matters` is false a unique
    /// hashed subdirectory is created to run in instead, with a sibling
    /// tmp directory exported as $TMPDIR and removed afterwards; the
    /// actual directory used ends up in the job's `actual_cwd`.
    ///
    /// While the cmd runs, the job is touched regularly so the server
    /// knows we are still alive; a kill requested through the server takes
    /// effect at the next touch and buries the job. SIGINT, SIGTERM,
    /// SIGQUIT, SIGUSR1 and SIGUSR2 all abort execution, killing the cmd.
    ///
    /// Returns `Ok(())` when the cmd exited 0 and the job was archived;
    /// otherwise the job has been released or buried as appropriate and
    /// the error says why.
    ///
    /// You must have been the one to reserve the job, or this returns
    /// immediately with an error.
    pub async fn execute(&self, job: &mut Job, shell: &str) -> Result<()> {
        // check upfront that the reservation is ours; other methods leave
        // this to the server, but here we must not start running the cmd
        // before finding out
        if job.reserved_by != Some(self.id()) {
            return Err(DroverError::MustReserve);
        }
        let job_key = job.key();

        // arbitrary shell commands can contain semicolons, quoting and
        // pipes, so hand the whole thing to the shell
        let mut jc = job.cmd.clone();
        if jc.contains(" | ") {
            jc = format!("set -o pipefail; {jc}");
        }
        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(&jc)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(job_key = %job_key, cmd = %job.cmd, "executing job");

        // the cmd runs from the desired directory, which must exist
        let cwd_is_dir = std::fs::metadata(&job.cwd)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !cwd_is_dir {
            let mut msg = format!("working directory [{}] does not exist", job.cwd);
            if let Err(be) = self.bury(job, None, failreason::CWD, None).await {
                msg.push_str(&format!(" (and burying the job failed: {be})"));
            }
            return Err(DroverError::Internal(msg));
        }

        let mut tmp_dir: Option<PathBuf> = None;
        let mut actual_cwd = String::new();
        if job.cwd_matters {
            cmd.current_dir(&job.cwd);
        } else {
            // a unique location to work in
            match host::mk_hashed_dir(Path::new(&job.cwd), &job_key) {
                Ok((cwd_path, tmp_path)) => {
                    cmd.current_dir(&cwd_path);
                    actual_cwd = cwd_path.to_string_lossy().into_owned();
                    job.actual_cwd = actual_cwd.clone();
                    tmp_dir = Some(tmp_path);
                }
                Err(e) => {
                    let mut msg = format!("could not create working directory: {e}");
                    if let Err(be) = self
                        .bury(job, None, failreason::CWD, Some(msg.as_str()))
                        .await
                    {
                        msg.push_str(&format!(" (and burying the job failed: {be})"));
                    }
                    return Err(DroverError::Internal(msg));
                }
            }
        }

        // mount any configured remote file systems
        if let Err(e) = self.mount_with_retry(job, &job_key).await {
            let mut msg = format!("failed to mount remote file system(s): {e}");
            if let Err(be) = self
                .bury(job, None, failreason::MOUNT, Some(msg.as_str()))
                .await
            {
                msg.push_str(&format!(" (and burying the job failed: {be})"));
            }
            return Err(DroverError::Internal(msg));
        }

        // the environment recorded when the job was added, or the current
        // one if none was
        let mut env = match job.env() {
            Ok(env) => env,
            Err(e) => {
                let mut extra = String::new();
                if let Err(be) = self.bury(job, None, failreason::ENV, None).await {
                    extra.push_str(&format!(" (and burying the job failed: {be})"));
                }
                let (_, unmount_err) = job.unmount(true).await;
                if let Some(ue) = unmount_err {
                    extra.push_str(&format!(" (and unmounting the job failed: {ue})"));
                }
                return Err(DroverError::Internal(format!(
                    "failed to extract environment variables for job [{job_key}]: {e}{extra}"
                )));
            }
        };
        if let Some(tmp) = &tmp_dir {
            env = host::env_override(env, &[format!("TMPDIR={}", tmp.display())]);
            if job.change_home {
                env = host::env_override(env, &[format!("HOME={actual_cwd}")]);
            }
        }
        cmd.env_clear();
        for entry in &env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        // subscribe to abort signals for the duration of this execute;
        // under cluster schedulers SIGUSR2 may mean out-of-time, but since
        // out-of-memory has no reliable signal all five get the same
        // treatment
        let signals = match SignalSet::subscribe() {
            Ok(signals) => signals,
            Err(e) => {
                let (_, unmount_err) = job.unmount(true).await;
                let mut msg = format!("could not subscribe to signals: {e}");
                if let Some(ue) = unmount_err {
                    msg.push_str(&format!(" (and unmounting the job failed: {ue})"));
                }
                return Err(DroverError::Internal(msg));
            }
        };

        // start running the command
        let end_t = Instant::now() + job.requirements.time;
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // some obscure error about setting things up
                let mut extra = String::new();
                if let Err(re) = self.release(job, None, failreason::START).await {
                    extra.push_str(&format!(" (and releasing the job failed: {re})"));
                }
                let (_, unmount_err) = job.unmount(true).await;
                if let Some(ue) = unmount_err {
                    extra.push_str(&format!(" (and unmounting the job failed: {ue})"));
                }
                if let Some(tmp) = &tmp_dir {
                    let _ = std::fs::remove_dir_all(tmp);
                }
                return Err(DroverError::Internal(format!(
                    "could not start command [{jc}]: {e}{extra}"
                )));
            }
        };

        // filter stdout/stderr down to a bounded head and tail, dropping
        // the middles of progress bars
        let stdout_pipe = child.stdout.take().expect("stdout is piped");
        let stderr_pipe = child.stderr.take().expect("stderr is piped");
        let abort_reads = CancellationToken::new();
        let stdout_task = spawn_std_filter(stdout_pipe, abort_reads.clone());
        let stderr_task = spawn_std_filter(stderr_pipe, abort_reads.clone());

        let pid = child.id().unwrap_or_default();

        // tell the server we have started
        if let Err(e) = self.started(job, pid).await {
            // can't talk to the server, so bail now: kill the cmd and
            // don't bother releasing, the reservation will auto-release
            // once our touches stop
            let mut extra = String::new();
            if let Err(ke) = child.kill().await {
                extra.push_str(&format!(" (and killing the cmd failed: {ke})"));
            }
            if let Err(te) = job.trigger_behaviours(false).await {
                extra.push_str(&format!(" (and triggering behaviours failed: {te})"));
            }
            let (_, unmount_err) = job.unmount(true).await;
            if let Some(ue) = unmount_err {
                extra.push_str(&format!(" (and unmounting the job failed: {ue})"));
            }
            if let Some(tmp) = &tmp_dir {
                let _ = std::fs::remove_dir_all(tmp);
            }
            return Err(DroverError::Internal(format!(
                "command [{}] started running, but I killed it due to a job queue server error: {e}{extra}",
                job.cmd
            )));
        }

        // supervise: touch the job, watch memory, react to signals
        let flags = Arc::new(StdMutex::new(SupervisedFlags::default()));
        let stop = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(SuperviseArgs {
            client: self.clone(),
            job: job.clone(),
            pid,
            end_t,
            ram_limit: job.requirements.ram,
            touch_every: self.config().touch_interval,
            flags: flags.clone(),
            abort_reads: abort_reads.clone(),
            stop: stop.clone(),
            signals,
        }));

        // drain the pipes, then wait for the cmd to exit
        let (stdout_saver, stdout_read_err) = join_filter(stdout_task).await;
        let (stderr_saver, stderr_read_err) = join_filter(stderr_task).await;
        let wait_result = child.wait().await;
        stop.cancel();
        let _ = supervisor.await;

        let mut flags = flags.lock().expect("supervision flags poisoned").clone();

        // pss needs at least one tick to be sampled; a cmd that exited
        // faster is seeded from the OS's max resident set instead
        let (maxrss_mib, child_cpu) = child_rusage();
        if flags.peakmem == 0 {
            flags.peakmem = maxrss_mib;
        }
        // our own footprint counts too: the cloud scheduler places runners
        // by the combined figure and would kill us for exceeding it
        flags.peakmem += host::self_memory().unwrap_or(host::SELF_MEM_FALLBACK_MIB);

        let outcome = wait_outcome(&wait_result);
        let classified = classify(&job.cmd, &job_key, &outcome, &flags, job.until_buried);
        let mut dobury = classified.disposition == Disposition::Bury;
        let mut dorelease = classified.disposition == Disposition::Release;
        let mut fail_reason = classified.fail_reason;
        let mut exitcode = classified.exitcode;
        let mut myerr = classified.error;

        tracing::info!(
            job_key = %job_key,
            exitcode,
            peak_ram_mib = flags.peakmem,
            disposition = %classified.disposition,
            "cmd finished"
        );

        let mut final_stderr = stderr_saver.bytes().trim_ascii().to_vec();

        // behaviours and unmounting can take a while, so keep touching;
        // but not when a kill or resource overuse ended things, since that
        // would re-assert a kill-able presence on the server
        let suppress_touch = flags.kill_called || flags.ranout_mem || flags.signalled;
        let stop2 = CancellationToken::new();
        let post_toucher = tokio::spawn(post_touch(
            self.clone(),
            job.clone(),
            self.config().touch_interval,
            suppress_touch,
            stop2.clone(),
        ));

        if let Some(kill_err) = &flags.kill_err {
            myerr = append_err(myerr, "; killing the cmd also failed: ", kill_err);
        }

        // run behaviours
        let berr = job.trigger_behaviours(myerr.is_none()).await.err();
        if let Some(be) = &berr {
            myerr = append_err(myerr, "; behaviour(s) also had problem(s): ", be);
        }

        // unmount now, because failing to upload means starting over
        let add_mount_logs = dobury || dorelease;
        let (mount_logs, unmount_err) = job.unmount(false).await;
        if let Some(ue) = unmount_err {
            let text = ue.to_string();
            if text.contains("failed to upload") {
                if !dobury {
                    dorelease = true;
                }
                if fail_reason.is_empty() {
                    fail_reason = failreason::UPLOAD;
                }
                if exitcode == 0 {
                    // persist the failure through an otherwise-clean exit
                    exitcode = -2;
                }
            }
            myerr = append_err(myerr, "; unmounting also caused problem(s): ", text);
        }
        stop2.cancel();
        let _ = post_toucher.await;

        if add_mount_logs && !mount_logs.is_empty() {
            final_stderr.extend_from_slice(b"\n\nMount logs:\n");
            final_stderr.extend_from_slice(mount_logs.as_bytes());
        }
        if (dobury || dorelease) && berr.is_some() {
            final_stderr.extend_from_slice(b"\n\nBehaviour problems:\n");
            final_stderr.extend_from_slice(berr.as_ref().map(|e| e.to_string()).unwrap_or_default().as_bytes());
        }
        if let Some(e) = &stderr_read_err {
            final_stderr.extend_from_slice(b"\n\nSTDERR handling problems:\n");
            final_stderr.extend_from_slice(e.to_string().as_bytes());
        }
        let mut final_stdout = stdout_saver.bytes().trim_ascii().to_vec();
        if let Some(e) = &stdout_read_err {
            final_stdout.extend_from_slice(b"\n\nSTDOUT handling problems:\n");
            final_stdout.extend_from_slice(e.to_string().as_bytes());
        }

        // whatever happened above, report our end state; retry for a long
        // time so a server outage doesn't force the job to be rerun
        let jes = JobEndState {
            cwd: actual_cwd,
            exitcode,
            peak_ram: flags.peakmem,
            cpu_time: child_cpu,
            stdout: final_stdout,
            stderr: final_stderr,
            exited: true,
        };
        let mut worked = false;
        let mut report_err = None;
        for retry_num in 0..FINAL_STATE_RETRIES {
            let attempt = if dobury {
                self.bury(job, Some(&jes), fail_reason, None).await
            } else if dorelease {
                // the server buries instead once retries are exhausted
                self.release(job, Some(&jes), fail_reason).await
            } else {
                self.archive(job, Some(&jes)).await
            };
            match attempt {
                Ok(()) => {
                    worked = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!(job_key = %job_key, retry_num, error = %e, "end state report failed");
                    report_err = Some(e);
                    tokio::time::sleep(FINAL_STATE_BACKOFF_STEP * retry_num).await;
                }
            }
        }

        if !worked {
            let mut extra = String::new();
            if let Err(te) = job.trigger_behaviours(false).await {
                extra = format!(" (and triggering behaviours failed: {te})");
            }
            if let Some(tmp) = &tmp_dir {
                let _ = std::fs::remove_dir_all(tmp);
            }
            let report_err = report_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(DroverError::Internal(format!(
                "command [{}] finished running, but will need to be rerun due to a job queue server error: {report_err}{extra}",
                job.cmd
            )));
        }

        if let Some(tmp) = &tmp_dir {
            if let Err(re) = std::fs::remove_dir_all(tmp) {
                myerr = Some(match myerr {
                    Some(prev) => DroverError::Internal(format!(
                        "{prev} (and removing the tmpdir failed: {re})"
                    )),
                    None => DroverError::Internal(re.to_string()),
                });
            }
        }

        match myerr {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn mount_with_retry(&self, job: &Job, job_key: &str) -> Result<()> {
        let first = job.mount().await;
        let Err(e) = first else { return Ok(()) };
        // cause unknown; a single delayed retry has been seen to help
        if !e.to_string().contains("fusermount exited with code 256") {
            return Err(e);
        }
        tracing::warn!(job_key = %job_key, error = %e, "mount failed, retrying in 5s");
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = job.mount().await;
        if let Err(e2) = &second {
            tracing::warn!(job_key = %job_key, error = %e2, "mount retry failed");
        }
        second
    }
}

/// What the supervisory task latched while the cmd ran. Written under one
/// mutex; the classifier reads a snapshot once the task has stopped.
#[derive(Debug, Default, Clone)]
struct SupervisedFlags {
    /// Peak observed memory of the cmd's process tree, MiB.
    peakmem: u32,
    ranout_mem: bool,
    ranout_time: bool,
    signalled: bool,
    kill_called: bool,
    kill_err: Option<String>,
}

struct SuperviseArgs {
    client: Client,
    job: Job,
    pid: u32,
    end_t: Instant,
    ram_limit: u32,
    touch_every: Duration,
    flags: Arc<StdMutex<SupervisedFlags>>,
    abort_reads: CancellationToken,
    stop: CancellationToken,
    signals: SignalSet,
}

async fn supervise(args: SuperviseArgs) {
    let SuperviseArgs {
        client,
        job,
        pid,
        end_t,
        ram_limit,
        touch_every,
        flags,
        abort_reads,
        stop,
        mut signals,
    } = args;
    let start = tokio::time::Instant::now();
    let mut touch_tick = interval_at(start + touch_every, touch_every);
    let mut mem_tick = interval_at(start + MEM_CHECK_INTERVAL, MEM_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,

            _ = signals.recv() => {
                let kill_err = kill_child(pid);
                let mut f = flags.lock().expect("supervision flags poisoned");
                f.signalled = true;
                if f.kill_err.is_none() {
                    f.kill_err = kill_err;
                }
                drop(f);
                abort_reads.cancel();
                return;
            }

            _ = touch_tick.tick() => {
                {
                    let mut f = flags.lock().expect("supervision flags poisoned");
                    if !f.ranout_time && Instant::now() > end_t {
                        // going over time is allowed; if we get signalled
                        // later we now know it may be because of this
                        f.ranout_time = true;
                    }
                }
                match client.touch(&job).await {
                    Ok(true) => {
                        let kill_err = kill_child(pid);
                        let mut f = flags.lock().expect("supervision flags poisoned");
                        f.kill_called = true;
                        if f.kill_err.is_none() {
                            f.kill_err = kill_err;
                        }
                        drop(f);
                        abort_reads.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // possibly lost contact with the server; fine,
                        // keep touching until it works again
                        tracing::debug!(job_key = %job.key(), error = %e, "touch failed");
                    }
                }
            }

            _ = mem_tick.tick() => {
                let Ok(mem) = host::current_memory(pid) else { continue };
                let mut f = flags.lock().expect("supervision flags poisoned");
                if mem > f.peakmem {
                    f.peakmem = mem;
                    if f.peakmem > ram_limit {
                        // unlike time, memory overuse could take down the
                        // whole machine, so it kills immediately
                        let kill_err = kill_child(pid);
                        f.ranout_mem = true;
                        if f.kill_err.is_none() {
                            f.kill_err = kill_err;
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Keep touching while post-run behaviours and unmounting happen, unless a
/// kill or resource overuse means the server should not be shown a live
/// presence any more.
async fn post_touch(
    client: Client,
    job: Job,
    every: Duration,
    suppressed: bool,
    stop: CancellationToken,
) {
    if suppressed {
        stop.cancelled().await;
        return;
    }
    let mut tick = interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tick.tick() => {
                if client.touch(&job).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// The five abort signals, subscribed for the duration of one execute and
/// deregistered when dropped.
struct SignalSet {
    streams: Vec<Signal>,
}

impl SignalSet {
    fn subscribe() -> std::io::Result<Self> {
        let kinds = [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::quit(),
            SignalKind::user_defined1(),
            SignalKind::user_defined2(),
        ];
        let mut streams = Vec::with_capacity(kinds.len());
        for kind in kinds {
            streams.push(signal(kind)?);
        }
        Ok(Self { streams })
    }

    /// Resolves when any of the subscribed signals arrives.
    async fn recv(&mut self) {
        let pending = self
            .streams
            .iter_mut()
            .map(|s| Box::pin(s.recv()))
            .collect::<Vec<_>>();
        futures::future::select_all(pending).await;
    }
}

fn kill_child(pid: u32) -> Option<String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    // pid 0 would signal our own process group
    if pid == 0 {
        return None;
    }
    match kill(Pid::from_raw(pid as i32), NixSignal::SIGKILL) {
        // ESRCH means it beat us to exiting, which is not a failure
        Ok(()) | Err(Errno::ESRCH) => None,
        Err(e) => Some(e.to_string()),
    }
}

async fn join_filter(
    task: tokio::task::JoinHandle<(PrefixSuffixSaver, Option<std::io::Error>)>,
) -> (PrefixSuffixSaver, Option<std::io::Error>) {
    match task.await {
        Ok(result) => result,
        Err(e) => (
            PrefixSuffixSaver::new(STD_STREAM_BOUND),
            Some(std::io::Error::other(e)),
        ),
    }
}

/// Max resident set of reaped children normalized to MiB, and their system
/// CPU time. Exactly one child is reaped per execute, so the cumulative
/// children figures describe it.
#[cfg(unix)]
fn child_rusage() -> (u32, Duration) {
    use nix::sys::resource::{getrusage, UsageWho};

    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let maxrss = usage.max_rss();
            // maxrss is kiB on most unixes but bytes on macOS
            let mib = if cfg!(target_os = "macos") {
                (maxrss / 1024) / 1024
            } else {
                maxrss / 1024
            };
            let stime = usage.system_time();
            let cpu = Duration::new(
                stime.tv_sec().max(0) as u64,
                (stime.tv_usec().max(0) as u32) * 1000,
            );
            (mib.max(0) as u32, cpu)
        }
        Err(_) => (0, Duration::ZERO),
    }
}

#[cfg(not(unix))]
fn child_rusage() -> (u32, Duration) {
    (0, Duration::ZERO)
}

/// How the cmd's wait ended, reduced to what classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitOutcome {
    Exited(i32),
    Signalled(i32),
    WaitFailed(String),
}

fn wait_outcome(wait_result: &std::io::Result<std::process::ExitStatus>) -> WaitOutcome {
    match wait_result {
        Ok(status) => match status.code() {
            Some(code) => WaitOutcome::Exited(code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    WaitOutcome::Signalled(status.signal().unwrap_or(0))
                }
                #[cfg(not(unix))]
                {
                    WaitOutcome::Signalled(0)
                }
            }
        },
        Err(e) => WaitOutcome::WaitFailed(e.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Bury,
    Release,
    Archive,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Bury => write!(f, "bury"),
            Disposition::Release => write!(f, "release"),
            Disposition::Archive => write!(f, "archive"),
        }
    }
}

struct Classified {
    disposition: Disposition,
    exitcode: i32,
    fail_reason: &'static str,
    error: Option<DroverError>,
}

/// Decide the job's disposition from the wait outcome and the latched
/// supervision flags. First match wins: the permanent-looking exit codes,
/// then resource overuse, then signals, then server-requested kills, then
/// plain failure.
fn classify(
    cmd: &str,
    job_key: &str,
    outcome: &WaitOutcome,
    flags: &SupervisedFlags,
    until_buried: u32,
) -> Classified {
    let may_be_temp = if until_buried > 1 {
        ", which may be a temporary issue, so it will be tried again"
    } else {
        ""
    };

    let permanent_bury = |code: i32, reason: &'static str, why: &str| Classified {
        disposition: Disposition::Bury,
        exitcode: code,
        fail_reason: reason,
        error: Some(DroverError::Internal(format!(
            "command [{cmd}] exited with code {code} ({why}), which seems permanent, so it has been buried"
        ))),
    };

    match outcome {
        WaitOutcome::Exited(0) => Classified {
            disposition: Disposition::Archive,
            exitcode: 0,
            fail_reason: "",
            error: None,
        },
        WaitOutcome::Exited(126) => permanent_bury(
            126,
            failreason::CPERM,
            "permission problem, or command is not executable",
        ),
        WaitOutcome::Exited(127) => permanent_bury(127, failreason::CFOUND, "command not found"),
        WaitOutcome::Exited(128) => permanent_bury(128, failreason::CEXIT, "invalid exit code"),
        WaitOutcome::Exited(_) | WaitOutcome::Signalled(_) => {
            let exitcode = match outcome {
                WaitOutcome::Exited(code) => *code,
                // death by signal has no exit code; the raw wait status
                // convention is -1
                _ => -1,
            };
            let flagged = |reason: &'static str, disposition: Disposition| Classified {
                disposition,
                exitcode,
                fail_reason: reason,
                error: Some(DroverError::Execute {
                    method: "execute",
                    job_key: job_key.to_string(),
                    reason: reason.to_string(),
                }),
            };
            if flags.ranout_mem {
                flagged(failreason::RAM, Disposition::Release)
            } else if flags.signalled {
                if flags.ranout_time {
                    flagged(failreason::TIME, Disposition::Release)
                } else {
                    flagged(failreason::SIGNAL, Disposition::Release)
                }
            } else if flags.kill_called {
                flagged(failreason::KILLED, Disposition::Bury)
            } else {
                Classified {
                    disposition: Disposition::Release,
                    exitcode,
                    fail_reason: failreason::EXIT,
                    error: Some(DroverError::Internal(format!(
                        "command [{cmd}] exited with code {exitcode}{may_be_temp}"
                    ))),
                }
            }
        }
        WaitOutcome::WaitFailed(msg) => Classified {
            disposition: Disposition::Release,
            exitcode: 255,
            fail_reason: failreason::ABNORMAL,
            error: Some(DroverError::Internal(format!(
                "command [{cmd}] failed to complete normally ({msg}){may_be_temp}"
            ))),
        },
    }
}

fn append_err(
    myerr: Option<DroverError>,
    joiner: &str,
    extra: impl fmt::Display,
) -> Option<DroverError> {
    Some(match myerr {
        Some(prev) => DroverError::Internal(format!("{prev}{joiner}{extra}")),
        None => DroverError::Internal(extra.to_string()),
    })
}
