//! The request/response envelopes exchanged with the server.
//!
//! Every interaction is a single [`ClientRequest`] answered by a single
//! [`ServerResponse`]. Both sides encode with the same schema, so variant
//! and field order here must stay stable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobEndState, JobState};

/// The operation a [`ClientRequest`] asks the server to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Ping,
    Drain,
    Shutdown,
    Backup,
    Add,
    Reserve,
    JobStart,
    JobTouch,
    JobArchive,
    JobRelease,
    JobBury,
    JobKick,
    JobDelete,
    JobKill,
    GetByKeys,
    GetByRepGroup,
    GetIncomplete,
    Upload,
}

impl Method {
    /// Short wire-style name, used in error messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::Drain => "drain",
            Method::Shutdown => "shutdown",
            Method::Backup => "backup",
            Method::Add => "add",
            Method::Reserve => "reserve",
            Method::JobStart => "jstart",
            Method::JobTouch => "jtouch",
            Method::JobArchive => "jarchive",
            Method::JobRelease => "jrelease",
            Method::JobBury => "jbury",
            Method::JobKick => "jkick",
            Method::JobDelete => "jdel",
            Method::JobKill => "jkill",
            Method::GetByKeys => "getbc",
            Method::GetByRepGroup => "getbr",
            Method::GetIncomplete => "getin",
            Method::Upload => "upload",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniform envelope clients send to the server. Fields irrelevant to a
/// given method are left at their defaults; `client_id` and `token` are
/// injected by the transport just before encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: Uuid,
    pub token: Vec<u8>,
    pub method: Method,
    pub job: Option<Job>,
    pub jobs: Vec<Job>,
    pub job_end_state: Option<JobEndState>,
    pub keys: Vec<String>,
    /// Compressed encoding of environment "key=value" strings.
    pub env: Vec<u8>,
    /// Compressed bytes of an uploaded file's content.
    pub file: Vec<u8>,
    /// Desired remote path for an uploaded file; may be blank.
    pub path: String,
    pub timeout: Duration,
    pub scheduler_group: String,
    pub state: Option<JobState>,
    pub limit: u32,
    pub get_env: bool,
    pub get_std: bool,
    pub ignore_complete: bool,
    pub first_reserve: bool,
}

impl ClientRequest {
    pub fn new(method: Method) -> Self {
        Self {
            client_id: Uuid::nil(),
            token: Vec::new(),
            method,
            job: None,
            jobs: Vec::new(),
            job_end_state: None,
            keys: Vec::new(),
            env: Vec::new(),
            file: Vec::new(),
            path: String::new(),
            timeout: Duration::ZERO,
            scheduler_group: String::new(),
            state: None,
            limit: 0,
            get_env: false,
            get_std: false,
            ignore_complete: false,
            first_reserve: false,
        }
    }
}

/// Static information about the server, reported by ping at connect time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub addr: String,
    pub host: String,
    pub port: u16,
    pub web_port: u16,
    pub pid: u32,
    pub deployment: String,
    pub scheduler: String,
    pub mode: String,
}

/// Live statistics about the server, reported when draining.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStats {
    pub running: u32,
    /// Estimated time until the last of the running jobs completes.
    pub etc: Duration,
}

/// What the server sends back for every request. Exactly which fields are
/// populated depends on the method; a non-empty `err` means the request
/// failed server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerResponse {
    pub jobs: Vec<Job>,
    pub job: Option<Job>,
    pub sinfo: Option<ServerInfo>,
    pub sstats: Option<ServerStats>,
    pub db: Vec<u8>,
    pub path: String,
    pub added: u32,
    pub existed: u32,
    pub kill_called: bool,
    pub err: String,
}
