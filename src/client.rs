//! The client side of the job queue server socket.
//!
//! A [`Client`] is created by [`Client::connect`], identified to the server
//! by a fresh random UUID, and holds the single request/reply connection.
//! All methods are thin wrappers over one RPC each; the exceptions are
//! `execute` (in [`crate::runner`]) and the local bookkeeping the terminal
//! dispositions do before and after their RPC.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{DroverError, Result};
use crate::host;
use crate::job::{Job, JobEndState, JobEssence, JobState};
use crate::protocol::{ClientRequest, Method, ServerInfo};
use crate::transport::Transport;

/// A connection to the job queue server. Cheap to clone; clones share the
/// underlying socket and its single-request-at-a-time lock.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ClientInner {
    pub(crate) transport: Transport,
    pub(crate) config: ClientConfig,
    pub(crate) client_id: Uuid,
    /// Static information the server reported at connect time.
    pub(crate) server_info: ServerInfo,
    has_reserved: AtomicBool,
    disconnected: AtomicBool,
    /// Serializes touch against the end-state updates that prepare and
    /// report a terminal disposition, so the server never sees a touch for
    /// a job it has already been told is finished.
    pub(crate) end_state_lock: Mutex<()>,
}

impl Client {
    /// Connect to the job queue server described by `config`.
    ///
    /// The dial succeeds even when nothing is listening on the far side,
    /// so reachability is verified with a ping; its failure distinguishes
    /// a missing server from a bad token.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        // v4 because speed doesn't matter for a one-per-process identity,
        // and it behaves on hosts with low clock resolution
        let client_id = Uuid::new_v4();
        let timeout = config.timeout;
        let transport = Transport::connect(&config, client_id).await?;

        let inner = Arc::new(ClientInner {
            transport,
            config,
            client_id,
            server_info: ServerInfo::default(),
            has_reserved: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            end_state_lock: Mutex::new(()),
        });
        let mut client = Self { inner };

        match client.ping(timeout).await {
            Ok(sinfo) => {
                let inner = Arc::get_mut(&mut client.inner)
                    .expect("client has not been shared yet");
                inner.server_info = sinfo;
                tracing::debug!(
                    addr = %client.inner.config.addr,
                    client_id = %client_id,
                    "connected to job queue server"
                );
                Ok(client)
            }
            Err(DroverError::Server { msg, .. }) if msg == "permission denied" => {
                Err(DroverError::PermissionDenied)
            }
            Err(_) => Err(DroverError::NoServer),
        }
    }

    /// Close the connection. The client (and any clones of it) must not be
    /// used again afterwards; connect a fresh one instead.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnected.store(true, Ordering::SeqCst);
        self.inner.transport.close().await
    }

    /// Static information about the connected server.
    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.server_info
    }

    /// The UUID this client identifies itself with.
    pub fn id(&self) -> Uuid {
        self.inner.client_id
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) async fn request(&self, req: ClientRequest) -> Result<crate::protocol::ServerResponse> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(DroverError::Disconnected);
        }
        self.inner.transport.request(req).await
    }

    /// Check the connection works, returning static server information.
    /// This is the only method that succeeds with a blank or invalid
    /// token.
    pub async fn ping(&self, timeout: Duration) -> Result<ServerInfo> {
        let mut req = ClientRequest::new(Method::Ping);
        req.timeout = timeout;
        let resp = self.request(req).await?;
        Ok(resp.sinfo.unwrap_or_default())
    }

    /// Tell the server to stop spawning runners and exit once existing
    /// runners finish. Returns how many runners still exist and the
    /// estimated time until the last one completes.
    pub async fn drain_server(&self) -> Result<(u32, Duration)> {
        let resp = self.request(ClientRequest::new(Method::Drain)).await?;
        let stats = resp.sstats.unwrap_or_default();
        Ok((stats.running, stats.etc))
    }

    /// Tell the server to cease all operations immediately. The server
    /// cannot reply once it has shut down, so a receive timeout counts as
    /// success.
    pub async fn shutdown_server(&self) -> bool {
        match self.request(ClientRequest::new(Method::Shutdown)).await {
            Ok(_) | Err(DroverError::Timeout) => true,
            Err(_) => false,
        }
    }

    /// Back up the server's database to the given local path, via a
    /// temporary file and an atomic rename.
    pub async fn backup_db(&self, path: &Path) -> Result<()> {
        let resp = self.request(ClientRequest::new(Method::Backup)).await?;
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        if let Err(e) = std::fs::write(&tmp_path, &resp.db) {
            let mut msg = e.to_string();
            if let Err(re) = std::fs::remove_file(&tmp_path) {
                msg = format!("{msg}\n{re}");
            }
            return Err(DroverError::Internal(msg));
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Add new jobs to the queue, recording `env_vars` ("key=value"
    /// strings, typically the caller's whole environment) for their cmds
    /// to run with. Jobs already in the queue are not added again; the
    /// returned counts are (added, already existed). With
    /// `ignore_complete`, jobs that previously ran to completion also
    /// count as existing rather than being rerun.
    pub async fn add(
        &self,
        jobs: Vec<Job>,
        env_vars: &[String],
        ignore_complete: bool,
    ) -> Result<(u32, u32)> {
        let mut req = ClientRequest::new(Method::Add);
        req.jobs = jobs;
        req.env = codec::compress_env(env_vars)?;
        req.ignore_complete = ignore_complete;
        let resp = self.request(req).await?;
        Ok((resp.added, resp.existed))
    }

    /// Take a job off the queue, claiming the exclusive right to run and
    /// report on it. Returns `None` if no job became available within
    /// `timeout`; a zero timeout waits indefinitely.
    pub async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        self.reserve_inner(timeout, String::new()).await
    }

    /// Like [`reserve`](Self::reserve), but only jobs belonging to the
    /// given scheduler group are returned. Only runners spawned by the
    /// server's scheduler have cause to use this.
    pub async fn reserve_scheduled(
        &self,
        timeout: Duration,
        scheduler_group: impl Into<String>,
    ) -> Result<Option<Job>> {
        self.reserve_inner(timeout, scheduler_group.into()).await
    }

    async fn reserve_inner(&self, timeout: Duration, scheduler_group: String) -> Result<Option<Job>> {
        let mut req = ClientRequest::new(Method::Reserve);
        req.timeout = timeout;
        req.scheduler_group = scheduler_group;
        req.first_reserve = !self.inner.has_reserved.load(Ordering::SeqCst);
        let resp = self.request(req).await?;
        self.inner.has_reserved.store(true, Ordering::SeqCst);
        Ok(resp.job)
    }

    /// Extend the server-side time-to-release of a reserved job: the sole
    /// keep-alive. A `true` return means kill has been requested for this
    /// job; stop what you are doing and bury it.
    pub async fn touch(&self, job: &Job) -> Result<bool> {
        let _guard = self.inner.end_state_lock.lock().await;
        let mut req = ClientRequest::new(Method::JobTouch);
        req.job = Some(job.clone());
        let resp = self.request(req).await?;
        Ok(resp.kill_called)
    }

    /// Record on the server that the job's cmd has started running, along
    /// with where and as what pid, so a user can go to the host and
    /// investigate if something goes wrong.
    pub async fn started(&self, job: &mut Job, pid: u32) -> Result<()> {
        job.host = host::hostname();
        job.host_ip = match host::current_ip("") {
            Ok(ip) => ip.to_string(),
            Err(_) => "localhost".to_string(),
        };
        job.pid = Some(pid);
        // the server tracks these itself; updated here for the benefit of
        // this process only
        job.attempts += 1;
        job.start_time = Some(Utc::now());
        let mut req = ClientRequest::new(Method::JobStart);
        req.job = Some(job.clone());
        self.request(req).await?;
        Ok(())
    }

    /// Remove a job from the queue and store it as completed, for use
    /// after its cmd ran successfully.
    pub async fn archive(&self, job: &mut Job, jes: Option<&JobEndState>) -> Result<()> {
        self.ended(job, jes).await?;
        let _guard = self.inner.end_state_lock.lock().await;
        let mut req = ClientRequest::new(Method::JobArchive);
        req.job = Some(job.clone());
        req.job_end_state = jes.cloned();
        self.request(req).await?;
        job.state = JobState::Complete;
        Ok(())
    }

    /// Put a reserved job back on the queue for someone to try again
    /// later, for suspected-transient failures. Once a job that ran and
    /// failed has been released `retries` times in a row, the server
    /// buries it instead.
    pub async fn release(
        &self,
        job: &mut Job,
        jes: Option<&JobEndState>,
        fail_reason: &str,
    ) -> Result<()> {
        self.ended(job, jes).await?;
        let _guard = self.inner.end_state_lock.lock().await;
        job.fail_reason = fail_reason.to_string();
        let mut req = ClientRequest::new(Method::JobRelease);
        req.job = Some(job.clone());
        req.job_end_state = jes.cloned();
        self.request(req).await?;

        // mirror what the server will have done to the job
        if job.exited && job.exitcode != 0 {
            job.until_buried = job.until_buried.saturating_sub(1);
            job.update_recs_after_failure(&self.inner.config);
        }
        if job.until_buried == 0 {
            job.state = JobState::Buried;
        } else {
            job.state = JobState::Delayed;
        }
        Ok(())
    }

    /// Mark a reserved job as unrunnable; it will be ignored until a user
    /// kicks it. An optional `stderr` override is recorded as the job's
    /// stderr in place of whatever was captured.
    pub async fn bury(
        &self,
        job: &mut Job,
        jes: Option<&JobEndState>,
        fail_reason: &str,
        stderr: Option<&str>,
    ) -> Result<()> {
        self.ended(job, jes).await?;
        let _guard = self.inner.end_state_lock.lock().await;
        job.fail_reason = fail_reason.to_string();
        if let Some(text) = stderr {
            job.std_err_c = codec::compress(text.as_bytes())?;
        }
        let mut req = ClientRequest::new(Method::JobBury);
        req.job = Some(job.clone());
        req.job_end_state = jes.cloned();
        self.request(req).await?;
        job.state = JobState::Buried;
        Ok(())
    }

    /// Make previously buried jobs runnable again. Returns how many were
    /// actually kicked.
    pub async fn kick(&self, jes: &[JobEssence]) -> Result<u32> {
        self.keyed_request(Method::JobKick, jes).await
    }

    /// Remove incomplete, not currently running jobs from the queue
    /// entirely. Returns how many were actually removed.
    pub async fn delete(&self, jes: &[JobEssence]) -> Result<u32> {
        self.keyed_request(Method::JobDelete, jes).await
    }

    /// Arrange for the next touch of each running job to carry a kill
    /// request back to its runner. Killing is therefore asynchronous:
    /// wait for the jobs to become buried before rerunning them. Returns
    /// how many jobs were eligible.
    pub async fn kill(&self, jes: &[JobEssence]) -> Result<u32> {
        self.keyed_request(Method::JobKill, jes).await
    }

    async fn keyed_request(&self, method: Method, jes: &[JobEssence]) -> Result<u32> {
        let mut req = ClientRequest::new(method);
        req.keys = jes.iter().map(JobEssence::key).collect();
        let resp = self.request(req).await?;
        Ok(resp.existed)
    }

    /// Get a job by its essence. With the flags set this is the way to get
    /// a job whose stdout/stderr and environment are populated.
    pub async fn get_by_essence(
        &self,
        je: &JobEssence,
        get_std: bool,
        get_env: bool,
    ) -> Result<Option<Job>> {
        let mut req = ClientRequest::new(Method::GetByKeys);
        req.keys = vec![je.key()];
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.request(req).await?;
        Ok(resp.jobs.into_iter().next())
    }

    /// Get multiple jobs at once given essences that describe them.
    pub async fn get_by_essences(&self, jes: &[JobEssence]) -> Result<Vec<Job>> {
        let mut req = ClientRequest::new(Method::GetByKeys);
        req.keys = jes.iter().map(JobEssence::key).collect();
        let resp = self.request(req).await?;
        Ok(resp.jobs)
    }

    /// Get jobs by their rep group. `limit`, when non-zero, caps how many
    /// jobs sharing a state, fail reason and exit code are returned;
    /// `state` filters to that state only.
    pub async fn get_by_rep_group(
        &self,
        rep_group: impl Into<String>,
        limit: u32,
        state: Option<JobState>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = ClientRequest::new(Method::GetByRepGroup);
        let mut job = Job::new("", "");
        job.rep_group = rep_group.into();
        req.job = Some(job);
        req.limit = limit;
        req.state = state;
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.request(req).await?;
        Ok(resp.jobs)
    }

    /// Get all jobs currently in the queue, ie. excluding archived ones.
    /// Arguments as in [`get_by_rep_group`](Self::get_by_rep_group).
    pub async fn get_incomplete(
        &self,
        limit: u32,
        state: Option<JobState>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = ClientRequest::new(Method::GetIncomplete);
        req.limit = limit;
        req.state = state;
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.request(req).await?;
        Ok(resp.jobs)
    }

    /// Upload a small local file to the server's machine, for cloud jobs
    /// that need a script or config file copied over. With a blank remote
    /// path the server picks one based on the file's checksum. Returns the
    /// absolute remote path.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<String> {
        let mut req = ClientRequest::new(Method::Upload);
        req.file = codec::compress_file(local)?;
        req.path = remote.to_string();
        let resp = self.request(req).await?;
        Ok(resp.path)
    }

    /// Update the job's record of its cmd having finished, compressing the
    /// captured stdout/stderr for the trip to the server. Affects only the
    /// local job; the terminal disposition RPC tells the server.
    pub(crate) async fn ended(&self, job: &mut Job, jes: Option<&JobEndState>) -> Result<()> {
        let Some(jes) = jes else { return Ok(()) };
        if !jes.exited {
            return Ok(());
        }
        let _guard = self.inner.end_state_lock.lock().await;
        job.exited = true;
        job.exitcode = jes.exitcode;
        job.peak_ram = jes.peak_ram;
        job.cpu_time = jes.cpu_time;
        if !jes.cwd.is_empty() {
            job.actual_cwd = jes.cwd.clone();
        }
        if !jes.stdout.is_empty() {
            job.std_out_c = codec::compress(&jes.stdout)?;
        }
        if !jes.stderr.is_empty() {
            job.std_err_c = codec::compress(&jes.stderr)?;
        }
        Ok(())
    }
}
