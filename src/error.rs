use thiserror::Error;

/// Fail reasons recorded on jobs when command execution goes wrong. These
/// exact strings are stored by the server and shown to users, so they are
/// stable constants rather than enum variants.
pub mod failreason {
    pub const ENV: &str = "failed to get environment variables";
    pub const CWD: &str = "working directory does not exist";
    pub const START: &str = "command failed to start";
    pub const CPERM: &str = "command permission problem";
    pub const CFOUND: &str = "command not found";
    pub const CEXIT: &str = "command invalid exit code";
    pub const EXIT: &str = "command exited non-zero";
    pub const RAM: &str = "command used too much RAM";
    pub const TIME: &str = "command used too much time";
    pub const ABNORMAL: &str = "command failed to complete normally";
    pub const LOST: &str = "lost contact with runner";
    pub const SIGNAL: &str = "runner received a signal to stop";
    pub const RESOURCE: &str = "resource requirements cannot be met";
    pub const MOUNT: &str = "mounting of remote file system(s) failed";
    pub const UPLOAD: &str = "failed to upload files to remote file system";
    pub const KILLED: &str = "killed by user request";
}

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("could not reach the server")]
    NoServer,

    #[error("permission denied")]
    PermissionDenied,

    #[error("you must Reserve() a Job before passing it to other methods")]
    MustReserve,

    #[error("receive time out")]
    Timeout,

    #[error("server error in {}{}: {}", .method, job_key_suffix(.job_key), .msg)]
    Server {
        method: &'static str,
        job_key: String,
        msg: String,
    },

    #[error("job execution failed in {}{}: {}", .method, job_key_suffix(.job_key), .reason)]
    Execute {
        method: &'static str,
        job_key: String,
        reason: String,
    },

    #[error("client has been disconnected and cannot be reused")]
    Disconnected,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("encoding failed: {0}")]
    Codec(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

fn job_key_suffix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!(" (job {key})")
    }
}

impl DroverError {
    /// The fail reason carried by an Execute classification error, if any.
    pub fn fail_reason(&self) -> Option<&str> {
        match self {
            DroverError::Execute { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;
