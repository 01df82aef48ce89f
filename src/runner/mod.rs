//! Execution of reserved jobs.
//!
//! This module is the runner side of the queue: it takes a job this client
//! has reserved and drives it through mount, spawn, supervision (memory,
//! time, signals, server-requested kills), output capture, post-run
//! behaviours, unmount, and the retried report of the terminal disposition
//! back to the server.
//!
//! # Components
//!
//! - [`supervisor`]: `Client::execute` and its cooperating tasks
//! - [`output`]: progress-bar suppression and bounded stdout/stderr capture
//!
//! # Execution flow
//!
//! 1. Pre-flight: reservation check, working directory, mounts, environment
//! 2. `Client::execute` spawns `<shell> -c <cmd>` with filtered pipes
//! 3. A supervisory task touches the server, samples memory and watches for
//!    abort signals while the cmd runs
//! 4. The exit status and latched supervision flags classify the outcome as
//!    archive, release or bury, which is reported with retries

pub mod output;
pub mod supervisor;

pub use output::PrefixSuffixSaver;
