//! Run configuration loaded from the YAML provisioning file.
//!
//! The configuration is read once at startup, validated before any
//! connection is opened, and passed around immutably for the rest of the
//! run. Stage-group specific requirements are checked with
//! [`Config::require_for`] so a run that cannot finish is rejected before
//! the first remote command.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::stage::StageGroup;

/// Default location of the run configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./provision.yml";

/// Immutable per-run configuration.
///
/// Every field either has a serde default or is checked by
/// [`Config::validate`], so a loaded `Config` is always usable.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IPv4 address of the target host.
    #[serde(default)]
    pub address: String,

    /// Account used for the SSH connection and privileged commands.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Unprivileged account that owns the application workspace.
    #[serde(default = "default_app_user")]
    pub app_user: String,

    /// Port sshd listens on once hardening has run. The initial connection
    /// falls back to 22 so re-runs work on either side of that stage.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key for authentication. SSH agent is used when absent.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// IANA timezone name applied to the host.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Swap file size with an M/G/T suffix, e.g. "4G".
    #[serde(default = "default_swap_size")]
    pub swap_size: String,

    /// MariaDB series to pin, e.g. "10.11".
    #[serde(default = "default_database_version")]
    pub database_version: String,

    /// Framework branch the workspace is initialized from.
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Site created during bootstrap. Required by that group only.
    #[serde(default)]
    pub site_name: String,

    /// Pre-supplied site administrator password. Generated when absent.
    #[serde(default)]
    pub admin_password: Option<String>,

    /// Install the optional PDF/asset toolchain.
    #[serde(default)]
    pub install_extras: bool,
}

fn default_admin_user() -> String {
    "root".to_string()
}

fn default_app_user() -> String {
    "app".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timezone() -> String {
    "Etc/UTC".to_string()
}

fn default_swap_size() -> String {
    "2G".to_string()
}

fn default_database_version() -> String {
    "10.11".to_string()
}

fn default_app_version() -> String {
    "version-15".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: String::new(),
            admin_user: default_admin_user(),
            app_user: default_app_user(),
            ssh_port: default_ssh_port(),
            key_file: None,
            timezone: default_timezone(),
            swap_size: default_swap_size(),
            database_version: default_database_version(),
            app_version: default_app_version(),
            site_name: String::new(),
            admin_password: None,
            install_extras: false,
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that hold for every run, whatever stages were requested.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Missing { field: "address" });
        }
        if !is_ipv4_syntax(&self.address) {
            return Err(ConfigError::InvalidAddress {
                value: self.address.clone(),
            });
        }
        if self.admin_user.trim().is_empty() {
            return Err(ConfigError::Missing { field: "admin_user" });
        }
        if self.app_user.trim().is_empty() {
            return Err(ConfigError::Missing { field: "app_user" });
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::Missing { field: "ssh_port" });
        }
        self.swap_size_mib()?;
        Ok(())
    }

    /// Checks the fields a specific stage group cannot run without.
    pub fn require_for(&self, group: StageGroup) -> Result<(), ConfigError> {
        let missing = |field| ConfigError::MissingForGroup {
            field,
            group: group.into(),
        };
        match group {
            StageGroup::Hardening => {
                if self.timezone.trim().is_empty() {
                    return Err(missing("timezone"));
                }
            }
            StageGroup::Dependencies => {
                if self.database_version.trim().is_empty() {
                    return Err(missing("database_version"));
                }
            }
            StageGroup::Bootstrap => {
                if self.site_name.trim().is_empty() {
                    return Err(missing("site_name"));
                }
                if self.app_version.trim().is_empty() {
                    return Err(missing("app_version"));
                }
            }
        }
        Ok(())
    }

    /// Swap size in MiB, parsed from the suffixed string form.
    pub fn swap_size_mib(&self) -> Result<u64, ConfigError> {
        parse_size_mib(&self.swap_size).ok_or_else(|| ConfigError::InvalidSize {
            value: self.swap_size.clone(),
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{} (app user {})",
            self.admin_user, self.address, self.ssh_port, self.app_user
        )
    }
}

/// Syntax-only IPv4 gate: exactly four dot-separated groups of one to
/// three digits. Range checking is left to the connection attempt.
pub fn is_ipv4_syntax(value: &str) -> bool {
    let groups: Vec<&str> = value.split('.').collect();
    groups.len() == 4
        && groups.iter().all(|group| {
            !group.is_empty() && group.len() <= 3 && group.bytes().all(|b| b.is_ascii_digit())
        })
}

/// Parse a unit-suffixed size ("512M", "4G", "1T") into MiB.
pub fn parse_size_mib(value: &str) -> Option<u64> {
    let value = value.trim();
    // The suffix is split off as a char, not a byte; the value comes
    // straight from operator-written YAML.
    let (last, suffix) = value.char_indices().last()?;
    let digits = &value[..last];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    match suffix {
        'M' | 'm' => Some(n),
        'G' | 'g' => n.checked_mul(1024),
        'T' | 't' => n.checked_mul(1024 * 1024),
        _ => None,
    }
}
