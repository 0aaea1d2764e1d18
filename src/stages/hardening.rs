//! Security hardening stages: timezone, swap, service user, sshd, firewall.

use crate::command::{ensure_success, first_success, privileged, shell_quote};
use crate::config::Config;
use crate::error::StageError;
use crate::session::{CommandChannel, SessionParams, DEFAULT_SSH_PORT};
use crate::stage::{Criticality, Stage, StageGroup};
use crate::vault::CredentialVault;

const TIMEZONE_QUERY: &str = "timedatectl show --property=Timezone --value";

/// Applies the configured IANA timezone.
pub struct SetTimezone;

impl Stage for SetTimezone {
    fn name(&self) -> &'static str {
        "set-timezone"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(TIMEZONE_QUERY)?;
        if !out.success() {
            return Err(StageError::check(format!(
                "`{TIMEZONE_QUERY}` exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim() == config.timezone)
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let cmd = format!("timedatectl set-timezone {}", shell_quote(&config.timezone));
        let out = first_success(chan, &privileged(&cmd))?;
        ensure_success(out, "timedatectl set-timezone")?;
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = chan.run(TIMEZONE_QUERY)?;
        let observed = out.stdout.trim();
        if out.success() && observed == config.timezone {
            return Ok(());
        }
        let observed = if observed.is_empty() {
            format!("timedatectl exited {}", out.exit_code)
        } else {
            format!("timezone {observed}")
        };
        Err(StageError::verify(
            format!("timezone {}", config.timezone),
            observed,
        ))
    }
}

const SWAP_FILE: &str = "/swapfile";
const SWAP_QUERY: &str = "swapon --noheadings --bytes --show=NAME,SIZE";
const FSTAB_LINE: &str = "/swapfile none swap sw 0 0";

/// Creates and activates a swap file of the configured size.
pub struct ProvisionSwap;

/// `swapon` reports the usable area, which is the file size minus the
/// one-page mkswap header. 64 KiB covers every page size in the wild.
const SWAP_HEADER_SLACK: u64 = 64 * 1024;

/// True when the listing shows the swap file active at the requested
/// size, allowing for the mkswap header.
fn swap_active(listing: &str, bytes: u64) -> bool {
    listing.lines().any(|line| {
        let mut cols = line.split_whitespace();
        if cols.next() != Some(SWAP_FILE) {
            return false;
        }
        match cols.next().and_then(|size| size.parse::<u64>().ok()) {
            Some(size) => size <= bytes && bytes - size <= SWAP_HEADER_SLACK,
            None => false,
        }
    })
}

fn swap_mib(config: &Config) -> Result<u64, StageError> {
    config
        .swap_size_mib()
        .map_err(|err| StageError::check(err.to_string()))
}

impl Stage for ProvisionSwap {
    fn name(&self) -> &'static str {
        "provision-swap"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let bytes = swap_mib(config)? * 1024 * 1024;
        let out = chan.run(SWAP_QUERY)?;
        if !out.success() {
            return Err(StageError::check(format!(
                "`{SWAP_QUERY}` exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(swap_active(&out.stdout, bytes))
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let mib = swap_mib(config)?;
        let steps: [(&str, String); 6] = [
            (
                "deactivate old swap file",
                format!("swapoff {SWAP_FILE} 2>/dev/null || true"),
            ),
            (
                "allocate swap file",
                format!(
                    "fallocate -l {mib}M {SWAP_FILE} \
                     || dd if=/dev/zero of={SWAP_FILE} bs=1M count={mib}"
                ),
            ),
            ("restrict swap file", format!("chmod 600 {SWAP_FILE}")),
            ("format swap file", format!("mkswap {SWAP_FILE}")),
            ("activate swap file", format!("swapon {SWAP_FILE}")),
            (
                "register swap in fstab",
                format!(
                    "grep -q '^{SWAP_FILE} ' /etc/fstab \
                     || printf '%s\\n' '{FSTAB_LINE}' >> /etc/fstab"
                ),
            ),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let mib = swap_mib(config)?;
        let out = chan.run(SWAP_QUERY)?;
        if out.success() && swap_active(&out.stdout, mib * 1024 * 1024) {
            return Ok(());
        }
        let observed = if out.stdout.trim().is_empty() {
            "no active swap".to_string()
        } else {
            out.stdout.trim().to_string()
        };
        Err(StageError::verify(
            format!("active swap of {mib} MiB at {SWAP_FILE}"),
            observed,
        ))
    }
}

/// Creates the unprivileged account that owns the application workspace.
pub struct CreateServiceUser;

impl Stage for CreateServiceUser {
    fn name(&self) -> &'static str {
        "create-service-user"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(&format!("id -u {}", config.app_user))?;
        match out.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(StageError::check(format!(
                "`id -u {}` exited {code}: {}",
                config.app_user,
                out.stderr.trim()
            ))),
        }
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let user = &config.app_user;
        let steps: [(&str, String); 3] = [
            (
                "create user",
                format!("useradd --create-home --shell /bin/bash {user}"),
            ),
            ("grant sudo group", format!("usermod -aG sudo {user}")),
            (
                "install sudoers entry",
                format!(
                    "printf '%s\\n' '{user} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{user} \
                     && chmod 440 /etc/sudoers.d/{user}"
                ),
            ),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let user = &config.app_user;
        let out = chan.run(&format!("id -u {user} && test -d /home/{user}"))?;
        if out.success() {
            return Ok(());
        }
        Err(StageError::verify(
            format!("user {user} with a home directory"),
            format!("account check exited {}", out.exit_code),
        ))
    }
}

const SSHD_QUERY: &str = "sshd -T 2>/dev/null | grep -E '^(port|passwordauthentication) '";
const SSHD_DROPIN: &str = "/etc/ssh/sshd_config.d/50-groundwork.conf";

/// Moves sshd to the configured port and disables password logins.
///
/// The running session survives the restart; the runner reopens on the
/// new port before the next stage via [`Stage::session_update`].
pub struct HardenSsh;

/// Effective (port, password auth enabled) pair from `sshd -T` output.
fn sshd_effective(listing: &str) -> (Option<u16>, Option<bool>) {
    let mut port = None;
    let mut password_auth = None;
    for line in listing.lines() {
        let mut cols = line.split_whitespace();
        match (cols.next(), cols.next()) {
            (Some("port"), Some(value)) => port = value.parse().ok(),
            (Some("passwordauthentication"), Some(value)) => {
                password_auth = Some(value == "yes");
            }
            _ => {}
        }
    }
    (port, password_auth)
}

fn describe_sshd(port: Option<u16>, password_auth: Option<bool>) -> String {
    let port = port.map_or_else(|| "unknown".to_string(), |p| p.to_string());
    let auth = match password_auth {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "unknown",
    };
    format!("port {port}, password authentication {auth}")
}

impl Stage for HardenSsh {
    fn name(&self) -> &'static str {
        "harden-ssh"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = first_success(chan, &privileged(SSHD_QUERY))?;
        if !out.success() {
            return Err(StageError::check(format!(
                "cannot query effective sshd configuration (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let (port, password_auth) = sshd_effective(&out.stdout);
        Ok(port == Some(config.ssh_port) && password_auth == Some(false))
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let dropin = format!(
            "Port {}\nPasswordAuthentication no\nPermitRootLogin prohibit-password\n",
            config.ssh_port
        );
        let steps: [(&str, String); 3] = [
            (
                "write sshd drop-in",
                format!(
                    "mkdir -p /etc/ssh/sshd_config.d \
                     && printf '%s' {} > {SSHD_DROPIN}",
                    shell_quote(&dropin)
                ),
            ),
            // An invalid config must never reach the restart; sshd -t
            // failing leaves the old daemon untouched.
            ("validate sshd configuration", "sshd -t".to_string()),
            (
                "restart sshd",
                "systemctl restart sshd 2>/dev/null || systemctl restart ssh".to_string(),
            ),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = first_success(chan, &privileged(SSHD_QUERY))?;
        let (port, password_auth) = sshd_effective(&out.stdout);
        if out.success() && port == Some(config.ssh_port) && password_auth == Some(false) {
            return Ok(());
        }
        Err(StageError::verify(
            format!(
                "sshd on port {} with password authentication disabled",
                config.ssh_port
            ),
            describe_sshd(port, password_auth),
        ))
    }

    fn session_update(&self, config: &Config) -> Option<SessionParams> {
        if config.ssh_port == DEFAULT_SSH_PORT {
            return None;
        }
        Some(SessionParams::from_config(config))
    }
}

const UFW_STATUS: &str = "ufw status";

/// Enables ufw with the SSH and web ports open. Advisory: a host without
/// ufw still provisions, with a warning in the report.
pub struct EnableFirewall;

fn firewall_ready(status: &str, ssh_port: u16) -> bool {
    let active = status
        .lines()
        .next()
        .is_some_and(|line| line.trim() == "Status: active");
    // The rule is the first column of its line; a substring match would
    // let 2222/tcp stand in for 22/tcp.
    let rule = format!("{ssh_port}/tcp");
    active
        && status
            .lines()
            .skip(1)
            .any(|line| line.split_whitespace().next() == Some(rule.as_str()))
}

impl Stage for EnableFirewall {
    fn name(&self) -> &'static str {
        "enable-firewall"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Hardening
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = first_success(chan, &privileged(UFW_STATUS))?;
        if !out.success() {
            return Err(StageError::check(format!(
                "`{UFW_STATUS}` exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(firewall_ready(&out.stdout, config.ssh_port))
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        // The SSH allow rule goes in before enable so the session that is
        // issuing these commands cannot lock itself out.
        let steps: [(&str, String); 5] = [
            (
                "allow ssh port",
                format!("ufw allow {}/tcp", config.ssh_port),
            ),
            ("allow http", "ufw allow 80/tcp".to_string()),
            ("allow https", "ufw allow 443/tcp".to_string()),
            ("allow app port", "ufw allow 8000/tcp".to_string()),
            ("enable firewall", "ufw --force enable".to_string()),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = first_success(chan, &privileged(UFW_STATUS))?;
        if out.success() && firewall_ready(&out.stdout, config.ssh_port) {
            return Ok(());
        }
        let observed = out
            .stdout
            .lines()
            .next()
            .unwrap_or("no status output")
            .trim()
            .to_string();
        Err(StageError::verify(
            format!("ufw active with {}/tcp allowed", config.ssh_port),
            observed,
        ))
    }
}
