//! Error types for the provisioning pipeline.
//!
//! The taxonomy mirrors the phases of a run: configuration problems are
//! caught before any connection is opened, connectivity problems kill the
//! whole pipeline, and per-stage problems are split by the phase of the
//! stage that produced them (check, action, verification).

use std::path::PathBuf;
use thiserror::Error;

/// Errors detected while loading or validating the run configuration.
///
/// These are always raised before a single remote command is issued.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for the expected schema.
    #[error("cannot parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A field every run needs is absent or empty.
    #[error("required field `{field}` is missing or empty")]
    Missing { field: &'static str },

    /// A field is empty but the requested stage group needs it.
    #[error("`{field}` is required by the {group} stages but is empty")]
    MissingForGroup {
        field: &'static str,
        group: &'static str,
    },

    /// The target address is not four dot-separated 1-3 digit groups.
    #[error("`{value}` is not a valid IPv4 address (expected four dot-separated 1-3 digit groups)")]
    InvalidAddress { value: String },

    /// A size field does not parse as digits plus an M/G/T suffix.
    #[error("`{value}` is not a valid size (expected digits with an M/G/T suffix, e.g. \"2G\")")]
    InvalidSize { value: String },
}

/// Errors establishing or using the remote command channel.
///
/// Any of these is fatal for the pipeline: no stage can proceed without a
/// working channel, and a channel that died mid-command leaves the remote
/// state unknown.
#[derive(Error, Debug)]
pub enum SessionError {
    /// TCP-level connect failure (refused, timed out, unroutable).
    #[error("cannot reach {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// An SSH protocol operation failed (handshake, auth, channel, exec).
    #[error("{context}: {source}")]
    Ssh {
        context: &'static str,
        #[source]
        source: ssh2::Error,
    },

    /// An I/O failure on an established channel.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The non-mutating echo probe did not round-trip.
    #[error("connectivity probe returned {actual:?} (expected {expected:?})")]
    Probe { expected: String, actual: String },

    /// The session was already closed when a command was issued.
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Wrap an ssh2 error with a short context label.
    pub fn ssh(context: &'static str, source: ssh2::Error) -> Self {
        Self::Ssh { context, source }
    }

    /// Wrap an I/O error with a short context label.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Errors from the credential vault.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The expected credential file is absent on the remote host. This is
    /// the signal that an earlier required stage has not completed.
    #[error("no credential file at {path} (has the stage that creates it run?)")]
    NotFound { path: String },

    /// The credential file exists but does not hold a `label: value` line.
    #[error("credential file {path} is malformed")]
    Malformed { path: String },

    /// The credential file could not be written.
    #[error("cannot persist credential to {path}: {reason}")]
    Store { path: String, reason: String },

    /// The credential file exists but could not be read back.
    #[error("cannot read credential file {path}: {reason}")]
    Load { path: String, reason: String },

    /// The channel died while reading or writing a credential.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors from a single stage, split by the phase that produced them.
#[derive(Error, Debug)]
pub enum StageError {
    /// The read-only idempotency probe itself failed. Distinct from "not
    /// yet satisfied": without a working probe the stage cannot safely
    /// decide whether to act at all.
    #[error("idempotency check failed: {reason}")]
    Check { reason: String },

    /// The mutating action returned a non-success status after every
    /// command variant was exhausted.
    #[error("action failed: {reason}")]
    Action { reason: String },

    /// The action reported success but the independent re-query of remote
    /// state disagrees with the expected value.
    #[error("verification failed: expected {expected}, observed {observed}")]
    Verify { expected: String, observed: String },

    /// The channel itself failed mid-stage.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A credential this stage needs could not be obtained.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl StageError {
    /// Create a check-phase error.
    pub fn check(reason: impl Into<String>) -> Self {
        Self::Check {
            reason: reason.into(),
        }
    }

    /// Create an action-phase error.
    pub fn action(reason: impl Into<String>) -> Self {
        Self::Action {
            reason: reason.into(),
        }
    }

    /// Create a verification error from the expected and observed state.
    pub fn verify(expected: impl Into<String>, observed: impl Into<String>) -> Self {
        Self::Verify {
            expected: expected.into(),
            observed: observed.into(),
        }
    }

    /// True when the underlying cause is a dead or unusable channel.
    ///
    /// Connectivity failures abort the pipeline regardless of the stage's
    /// criticality: even a non-critical stage cannot be skipped past a
    /// channel that no longer answers.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::Vault(VaultError::Session(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidAddress {
            value: "999.1.1".to_string(),
        };
        assert!(err.to_string().contains("999.1.1"));
        assert!(err.to_string().contains("IPv4"));

        let err = ConfigError::MissingForGroup {
            field: "site_name",
            group: "bootstrap",
        };
        assert!(err.to_string().contains("site_name"));
        assert!(err.to_string().contains("bootstrap"));
    }

    #[test]
    fn test_verify_error_names_both_states() {
        let err = StageError::verify("swap of 4096 MiB", "no active swap");
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("no active swap"));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(StageError::Session(SessionError::Closed).is_connectivity());
        assert!(
            StageError::Vault(VaultError::Session(SessionError::Closed)).is_connectivity()
        );
        assert!(!StageError::action("apt-get exited 100").is_connectivity());
        assert!(
            !StageError::Vault(VaultError::NotFound {
                path: "/home/app/.credentials/mariadb-root".to_string(),
            })
            .is_connectivity()
        );
    }

    #[test]
    fn test_vault_not_found_is_actionable() {
        let err = VaultError::NotFound {
            path: "/home/app/.credentials/site-admin".to_string(),
        };
        assert!(err.to_string().contains("site-admin"));
        assert!(err.to_string().contains("has the stage"));
    }
}
