//! Job records and the collaborator interfaces a job carries.
//!
//! A [`Job`] is owned by the server; clients receive one from
//! `Client::reserve`, mutate it while they hold the reservation, and report
//! a terminal disposition back. Remote file system mounting and post-run
//! behaviours are driven by external components, seen here only through the
//! [`MountDriver`] and [`BehaviourEngine`] traits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{failreason, DroverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    New,
    Delayed,
    Ready,
    Reserved,
    Running,
    Lost,
    Buried,
    Dependent,
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::New => write!(f, "new"),
            JobState::Delayed => write!(f, "delayed"),
            JobState::Ready => write!(f, "ready"),
            JobState::Reserved => write!(f, "reserved"),
            JobState::Running => write!(f, "running"),
            JobState::Lost => write!(f, "lost"),
            JobState::Buried => write!(f, "buried"),
            JobState::Dependent => write!(f, "dependent"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

/// Resources a job needs in order to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    /// MiB of memory the command is expected to need.
    pub ram: u32,
    /// How long the command is expected to run for.
    pub time: Duration,
    /// CPU cores the command is expected to keep busy.
    pub cores: f64,
    /// MiB of local disk the command is expected to need.
    pub disk: u32,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            ram: 1024,
            time: Duration::from_secs(3600),
            cores: 1.0,
            disk: 0,
        }
    }
}

/// Compact identity for bulk operations (kick, delete, kill, get).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEssence {
    /// Key of the job, when already known.
    pub job_key: String,
    /// Otherwise the cmd...
    pub cmd: String,
    /// ...and cwd it was added with, from which the key is derived.
    pub cwd: String,
}

impl JobEssence {
    pub fn key(&self) -> String {
        if !self.job_key.is_empty() {
            return self.job_key.clone();
        }
        job_key_of(&self.cmd, &self.cwd)
    }
}

/// The state of a job after its cmd has (tried to) run, supplied to
/// `Client::bury`, `release` and `archive`. Always set `exited` to true and
/// populate the other fields, unless the cmd never actually started, in
/// which case pass `None` instead of a `JobEndState` at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEndState {
    /// The actual working directory used, when it differs from the job's
    /// `cwd` property; empty otherwise.
    pub cwd: String,
    pub exitcode: i32,
    /// Peak memory in MiB, inclusive of the runner's own footprint.
    pub peak_ram: u32,
    pub cpu_time: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exited: bool,
}

/// Drives mounting and unmounting of any remote file systems a job has
/// configured. Implemented by the mount layer, injected on to jobs before
/// execution; jobs without one simply have nothing to mount.
#[async_trait]
pub trait MountDriver: Send + Sync + fmt::Debug {
    async fn mount(&self) -> Result<()>;

    /// Unmount, uploading any cached writes. Returns collected mount logs
    /// alongside the error, since the logs are wanted even on failure.
    /// `force` abandons the unmount protocol and lazily detaches.
    async fn unmount(&self, force: bool) -> (String, Option<DroverError>);
}

/// Runs user-supplied post-run actions (upload, cleanup, run-next) once a
/// job's cmd has exited.
#[async_trait]
pub trait BehaviourEngine: Send + Sync + fmt::Debug {
    async fn trigger(&self, success: bool) -> Result<()>;
}

/// A command line to run, plus everything the server and runner track about
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The shell command to run.
    pub cmd: String,
    /// The working directory to run it in.
    pub cwd: String,
    /// If true the cmd runs directly in `cwd`; if false a unique hashed
    /// subdirectory of `cwd` is created to run in.
    pub cwd_matters: bool,
    /// With `cwd_matters` false, also point $HOME at the unique directory.
    pub change_home: bool,
    /// User-supplied label grouping related jobs for reporting.
    pub rep_group: String,
    /// Label applied by the server's scheduler so only a matching runner
    /// reserves this job.
    pub scheduler_group: String,
    pub requirements: Requirements,
    /// How many times a failed job is retried before burial.
    pub retries: u32,
    /// Remaining automatic retries; at zero a failing release becomes a
    /// bury.
    pub until_buried: u32,
    /// Compressed encoding of the environment the cmd should run with.
    pub env_c: Vec<u8>,
    /// UUID of the client currently holding the reservation.
    pub reserved_by: Option<Uuid>,
    pub attempts: u32,
    pub host: String,
    pub host_ip: String,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    /// The unique working directory actually used, when one was created.
    pub actual_cwd: String,
    pub exited: bool,
    pub exitcode: i32,
    /// Peak memory of the cmd in MiB, runner overhead included.
    pub peak_ram: u32,
    pub cpu_time: Duration,
    /// Compressed captured stdout.
    pub std_out_c: Vec<u8>,
    /// Compressed captured stderr.
    pub std_err_c: Vec<u8>,
    pub fail_reason: String,
    pub state: JobState,
    #[serde(skip)]
    pub mount_driver: Option<Arc<dyn MountDriver>>,
    #[serde(skip)]
    pub behaviours: Option<Arc<dyn BehaviourEngine>>,
}

impl Job {
    pub fn new(cmd: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: cwd.into(),
            cwd_matters: false,
            change_home: false,
            rep_group: String::new(),
            scheduler_group: String::new(),
            requirements: Requirements::default(),
            retries: 3,
            until_buried: 3,
            env_c: Vec::new(),
            reserved_by: None,
            attempts: 0,
            host: String::new(),
            host_ip: String::new(),
            pid: None,
            start_time: None,
            actual_cwd: String::new(),
            exited: false,
            exitcode: 0,
            peak_ram: 0,
            cpu_time: Duration::ZERO,
            std_out_c: Vec::new(),
            std_err_c: Vec::new(),
            fail_reason: String::new(),
            state: JobState::New,
            mount_driver: None,
            behaviours: None,
        }
    }

    /// The opaque identity of this job, derived from what makes it unique:
    /// its cmd and cwd.
    pub fn key(&self) -> String {
        job_key_of(&self.cmd, &self.cwd)
    }

    pub fn essence(&self) -> JobEssence {
        JobEssence {
            job_key: self.key(),
            cmd: self.cmd.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// The environment variables the cmd should run with: those recorded
    /// at add time, or the current process environment if none were.
    pub fn env(&self) -> Result<Vec<String>> {
        if self.env_c.is_empty() {
            return Ok(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect());
        }
        codec::decompress_env(&self.env_c)
    }

    /// Captured stdout as bytes, decompressed.
    pub fn stdout(&self) -> Result<Vec<u8>> {
        if self.std_out_c.is_empty() {
            return Ok(Vec::new());
        }
        codec::decompress(&self.std_out_c)
    }

    /// Captured stderr as bytes, decompressed.
    pub fn stderr(&self) -> Result<Vec<u8>> {
        if self.std_err_c.is_empty() {
            return Ok(Vec::new());
        }
        codec::decompress(&self.std_err_c)
    }

    pub(crate) async fn mount(&self) -> Result<()> {
        match &self.mount_driver {
            Some(driver) => driver.mount().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn unmount(&self, force: bool) -> (String, Option<DroverError>) {
        match &self.mount_driver {
            Some(driver) => driver.unmount(force).await,
            None => (String::new(), None),
        }
    }

    pub(crate) async fn trigger_behaviours(&self, success: bool) -> Result<()> {
        match &self.behaviours {
            Some(engine) => engine.trigger(success).await,
            None => Ok(()),
        }
    }

    /// After a failure caused by hitting the RAM limit, bump the job's RAM
    /// requirement so the next attempt gets scheduled with more headroom.
    pub(crate) fn update_recs_after_failure(&mut self, config: &ClientConfig) {
        if self.fail_reason != failreason::RAM {
            return;
        }
        let current = f64::from(self.requirements.ram);
        let mult = if current < config.ram_increase_mult_breakpoint {
            config.ram_increase_mult_low
        } else {
            config.ram_increase_mult_high
        };
        let increased = (current * mult).max(current + config.ram_increase_min);
        self.requirements.ram = increased.ceil() as u32;
    }
}

fn job_key_of(cmd: &str, cwd: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cmd.as_bytes());
    hasher.update(b"\0");
    hasher.update(cwd.as_bytes());
    let digest = hasher.finalize();
    // 16 bytes of hex is plenty of key space and keeps paths short
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}
