//! Groundwork library
//!
//! Staged, idempotent provisioning for a single Debian/Ubuntu host over
//! SSH. Every stage pairs a read-only idempotency check with an action
//! and an independent verification; re-running a finished pipeline
//! issues nothing but read-only probes.

pub mod background;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod runner;
pub mod session;
pub mod stage;
pub mod stages;
pub mod vault;

// Re-export main types for convenience
pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use error::{ConfigError, SessionError, StageError, VaultError};
pub use runner::{Halt, PipelineRun, PipelineRunner, StageReport};
pub use session::{
    ChannelOpener, CommandChannel, ExecOutput, SessionParams, SshOpener, SshSession,
};
pub use stage::{Criticality, Stage, StageGroup, StageState};
pub use vault::{CredentialVault, Secret, SecretOrigin};
