pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod job;
pub mod protocol;
pub mod runner;
pub mod transport;

pub use client::Client;
pub use config::{ClientConfig, TlsConfig};
pub use error::{failreason, DroverError, Result};
pub use job::{BehaviourEngine, Job, JobEndState, JobEssence, JobState, MountDriver, Requirements};
