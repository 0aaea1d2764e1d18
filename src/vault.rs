//! Credential vault.
//!
//! Secrets are memoized for the duration of one run and persisted on the
//! remote host as single-line `label: value` files under the application
//! user's home, mode 600. A later, completely independent invocation
//! recovers them from there; a path that was never written reads back as
//! [`VaultError::NotFound`], which is the durable signal that the stage
//! responsible for it has not completed.
//!
//! Secret values are never logged.

use std::collections::HashMap;
use std::fmt;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use strum::Display;
use tracing::{debug, info};

use crate::command::{first_success, privileged, shell_quote};
use crate::error::VaultError;
use crate::session::CommandChannel;

/// Label of the database superuser credential.
pub const DB_ROOT_CREDENTIAL: &str = "mariadb-root";

/// Label of the site administrator credential.
pub const SITE_ADMIN_CREDENTIAL: &str = "site-admin";

/// Length of generated secrets. Alphanumeric only, so the values pass
/// unescaped through every tool that ends up seeing them.
pub const SECRET_LEN: usize = 24;

/// Where a secret's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SecretOrigin {
    /// Taken from the run configuration.
    Supplied,
    /// Generated this run from the operating system CSPRNG.
    Generated,
    /// Read back from a credential file persisted by an earlier run.
    Recovered,
}

/// A named secret.
#[derive(Clone)]
pub struct Secret {
    pub label: String,
    pub value: String,
    pub origin: SecretOrigin,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("label", &self.label)
            .field("value", &"<redacted>")
            .field("origin", &self.origin)
            .finish()
    }
}

/// Remote directory holding the credential files for `owner`.
pub fn credential_dir(owner: &str) -> String {
    format!("{}/.credentials", home_dir(owner))
}

/// Remote path of the credential file for `label`, owned by `owner`.
pub fn credential_path(owner: &str, label: &str) -> String {
    format!("{}/{label}", credential_dir(owner))
}

pub(crate) fn home_dir(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}

fn generate_secret() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

fn parse_credential_line(text: &str) -> Option<(String, String)> {
    let line = text.lines().next()?;
    let (label, value) = line.split_once(':')?;
    let label = label.trim();
    let value = value.trim();
    if label.is_empty() || value.is_empty() {
        return None;
    }
    Some((label.to_string(), value.to_string()))
}

/// Per-run secret store.
///
/// `ensure` and `obtain` memoize, so a stage that generates a credential
/// and a later stage that consumes it agree on the value within one run
/// without any remote round trip.
#[derive(Default)]
pub struct CredentialVault {
    cache: HashMap<String, Secret>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// A usable secret for `label`: the memoized one if this run already
    /// has it, else the supplied value, else a freshly generated one.
    pub fn ensure(&mut self, label: &str, supplied: Option<&str>) -> Secret {
        if let Some(secret) = self.cache.get(label) {
            return secret.clone();
        }
        let (value, origin) = match supplied {
            Some(value) if !value.is_empty() => (value.to_string(), SecretOrigin::Supplied),
            _ => (generate_secret(), SecretOrigin::Generated),
        };
        let secret = Secret {
            label: label.to_string(),
            value,
            origin,
        };
        info!(credential = label, origin = %origin, "credential ensured");
        self.cache.insert(label.to_string(), secret.clone());
        secret
    }

    /// Like [`ensure`](Self::ensure), but consults the persisted remote
    /// file before generating, so independent invocations converge on the
    /// credential that is already in use.
    pub fn obtain(
        &mut self,
        chan: &mut dyn CommandChannel,
        label: &str,
        path: &str,
        supplied: Option<&str>,
    ) -> Result<Secret, VaultError> {
        if let Some(secret) = self.cache.get(label) {
            return Ok(secret.clone());
        }
        match self.retrieve(chan, path) {
            Ok(secret) => {
                debug!(credential = label, path = %path, "credential recovered from host");
                self.cache.insert(label.to_string(), secret.clone());
                Ok(secret)
            }
            Err(VaultError::NotFound { .. }) => Ok(self.ensure(label, supplied)),
            Err(err) => Err(err),
        }
    }

    /// A credential some earlier stage was responsible for persisting:
    /// the memoized value when this run produced it, else the remote
    /// file. Unlike [`obtain`](Self::obtain) this never generates;
    /// [`VaultError::NotFound`] surfaces to the caller as the signal
    /// that the owning stage has not completed.
    pub fn require(
        &mut self,
        chan: &mut dyn CommandChannel,
        label: &str,
        path: &str,
    ) -> Result<Secret, VaultError> {
        if let Some(secret) = self.cache.get(label) {
            return Ok(secret.clone());
        }
        let secret = self.retrieve(chan, path)?;
        debug!(credential = label, path = %path, "credential recovered from host");
        self.cache.insert(label.to_string(), secret.clone());
        Ok(secret)
    }

    /// Write `secret` to `path` as a `label: value` line, mode 600, owned
    /// by `owner`.
    pub fn persist(
        &self,
        chan: &mut dyn CommandChannel,
        owner: &str,
        secret: &Secret,
        path: &str,
    ) -> Result<(), VaultError> {
        let label = shell_quote(&secret.label);
        let value = shell_quote(&secret.value);
        // umask first, so the file is born 600 rather than tightened
        // after the fact.
        let cmd = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => format!(
                "umask 077 && mkdir -p {dir} && printf '%s: %s\\n' {label} {value} > {path} \
                 && chmod 700 {dir} && chmod 600 {path} && chown -R {owner}:{owner} {dir}"
            ),
            _ => format!(
                "umask 077 && printf '%s: %s\\n' {label} {value} > {path} \
                 && chmod 600 {path} && chown {owner}:{owner} {path}"
            ),
        };
        let out = first_success(chan, &privileged(&cmd))?;
        if !out.success() {
            return Err(VaultError::Store {
                path: path.to_string(),
                reason: format!("exit {}: {}", out.exit_code, out.stderr.trim()),
            });
        }
        info!(credential = %secret.label, path = %path, "credential persisted");
        Ok(())
    }

    /// Read the credential file at `path` back into a [`Secret`].
    pub fn retrieve(
        &self,
        chan: &mut dyn CommandChannel,
        path: &str,
    ) -> Result<Secret, VaultError> {
        if !self.exists(chan, path)? {
            return Err(VaultError::NotFound {
                path: path.to_string(),
            });
        }
        let out = first_success(chan, &privileged(&format!("cat {path}")))?;
        if !out.success() {
            return Err(VaultError::Load {
                path: path.to_string(),
                reason: format!("exit {}: {}", out.exit_code, out.stderr.trim()),
            });
        }
        let (label, value) =
            parse_credential_line(&out.stdout).ok_or_else(|| VaultError::Malformed {
                path: path.to_string(),
            })?;
        Ok(Secret {
            label,
            value,
            origin: SecretOrigin::Recovered,
        })
    }

    /// Whether the credential file at `path` is present on the host.
    pub fn exists(&self, chan: &mut dyn CommandChannel, path: &str) -> Result<bool, VaultError> {
        let out = first_success(chan, &privileged(&format!("test -f {path}")))?;
        Ok(out.success())
    }
}
