use std::path::PathBuf;
use std::time::Duration;

/// Tuning and connection settings for a [`Client`](crate::client::Client).
///
/// The original daemon exposed most of these as process-wide mutable
/// globals; here they are an immutable value handed to `Client::connect`,
/// so two clients in one process can run with different tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// host:port of the job queue server.
    pub addr: String,
    /// TLS settings for the connection to the server.
    pub tls: TlsConfig,
    /// Authentication token returned by the server when it was started.
    pub token: Vec<u8>,
    /// How long to wait for a response from the server, both at connect
    /// time and for every subsequent request.
    pub timeout: Duration,
    /// How often a running job is touched to keep its reservation alive.
    /// Must be strictly less than the server's item TTR.
    pub touch_interval: Duration,
    /// How long the server delays a released job before making it ready.
    pub release_delay: Duration,
    /// Minimum MiB added to a job's RAM requirement after it dies from
    /// overuse.
    pub ram_increase_min: f64,
    /// RAM requirement multiplier applied below the breakpoint.
    pub ram_increase_mult_low: f64,
    /// RAM requirement multiplier applied at or above the breakpoint.
    pub ram_increase_mult_high: f64,
    /// RAM requirement (MiB) at which the low multiplier gives way to the
    /// high one.
    pub ram_increase_mult_breakpoint: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:11301".to_string(),
            tls: TlsConfig::default(),
            token: Vec::new(),
            timeout: Duration::from_secs(120),
            touch_interval: Duration::from_secs(15),
            release_delay: Duration::from_secs(30),
            ram_increase_min: 1000.0,
            ram_increase_mult_low: 2.0,
            ram_increase_mult_high: 1.3,
            ram_increase_mult_breakpoint: 8192.0,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, token: Vec<u8>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            token,
            timeout,
            ..Default::default()
        }
    }
}

/// TLS settings for the client side of the server socket.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM encoded CA certificate that signed the server's certificate.
    /// When unset, or when the file does not exist, the system's installed
    /// CAs are trusted instead.
    pub ca_cert_path: Option<PathBuf>,
    /// Domain the server's certificate is expected to be valid for.
    pub server_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            server_name: "localhost".to_string(),
        }
    }
}
