//! Platform dependency stages: base packages, MariaDB, optional extras.

use crate::command::{
    ensure_success, first_success, privileged, run_script, shell_quote,
};
use crate::config::Config;
use crate::error::StageError;
use crate::session::CommandChannel;
use crate::stage::{Criticality, Stage, StageGroup};
use crate::vault::{credential_path, CredentialVault, DB_ROOT_CREDENTIAL};

/// Everything the workspace tooling needs before the framework itself is
/// installed. Redis ships here but its distro service stays disabled;
/// the workspace supervises its own instances and the scoped helper
/// during site creation would otherwise collide with it on the port.
pub const BASE_PACKAGES: &[&str] = &[
    "git",
    "curl",
    "python3-dev",
    "python3-venv",
    "python3-pip",
    "pipx",
    "redis-server",
    "nodejs",
    "npm",
];

/// Optional PDF/asset toolchain, gated by `install_extras`.
pub const EXTRA_PACKAGES: &[&str] = &["wkhtmltopdf", "xvfb", "fontconfig"];

/// Query that exits zero only when every listed package is installed.
fn dpkg_query(packages: &[&str]) -> String {
    format!(
        "dpkg-query -W -f='${{Package}}\\n' {}",
        packages.join(" ")
    )
}

/// Installs the base package set.
pub struct InstallBasePackages;

impl Stage for InstallBasePackages {
    fn name(&self) -> &'static str {
        "install-base-packages"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Dependencies
    }

    fn is_satisfied(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(&dpkg_query(BASE_PACKAGES))?;
        match out.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(StageError::check(format!(
                "dpkg-query exited {code}: {}",
                out.stderr.trim()
            ))),
        }
    }

    fn apply(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let steps: [(&str, String); 3] = [
            (
                "apt-get update",
                "DEBIAN_FRONTEND=noninteractive apt-get update -q".to_string(),
            ),
            (
                "apt-get install base packages",
                format!(
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}",
                    BASE_PACKAGES.join(" ")
                ),
            ),
            (
                "disable distro redis service",
                "systemctl disable --now redis-server 2>/dev/null || true".to_string(),
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
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = chan.run(&dpkg_query(BASE_PACKAGES))?;
        if out.success() {
            return Ok(());
        }
        let missing = out.stderr.lines().next().unwrap_or("").trim().to_string();
        let observed = if missing.is_empty() {
            format!("dpkg-query exited {}", out.exit_code)
        } else {
            missing
        };
        Err(StageError::verify("all base packages installed", observed))
    }
}

const DB_SETUP_SCRIPT_NAME: &str = "groundwork-install-mariadb.sh";

/// The one pre-built script artifact in the pipeline: uploading a pinned
/// database server, starting it and setting the root password is a
/// genuinely multi-line unit that must run to completion as one piece.
const DB_SETUP_SCRIPT: &str = r#"#!/bin/sh
set -eu
root_password="$1"
series="$2"
export DEBIAN_FRONTEND=noninteractive
apt-get update -q
apt-get install -y -q "mariadb-server-${series}" "mariadb-client-${series}" libmariadb-dev
systemctl enable --now mariadb
sql="ALTER USER 'root'@'localhost' IDENTIFIED BY '${root_password}'; FLUSH PRIVILEGES;"
mariadb -u root -e "$sql" || MYSQL_PWD="${root_password}" mariadb -u root -e "$sql"
"#;

/// Installs the pinned MariaDB series and persists the root credential.
pub struct InstallDatabase;

/// The setup script installs `mariadb-server-<series>`, not the
/// metapackage, so the state probe has to ask for the versioned name.
fn db_state_query(series: &str) -> String {
    format!(
        "systemctl is-active --quiet mariadb \
         && dpkg-query -W -f='${{Version}}' mariadb-server-{series}"
    )
}

impl Stage for InstallDatabase {
    fn name(&self) -> &'static str {
        "install-database"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Dependencies
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(&db_state_query(&config.database_version))?;
        if out.exit_code == 127 {
            return Err(StageError::check(format!(
                "cannot inspect database state: {}",
                out.stderr.trim()
            )));
        }
        if !out.success() || !out.stdout.contains(&config.database_version) {
            return Ok(false);
        }
        // The stage also owns getting the root credential onto disk; a
        // running server without it is unfinished work.
        let path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        Ok(vault.exists(chan, &path)?)
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        let secret = vault.obtain(chan, DB_ROOT_CREDENTIAL, &path, None)?;
        let out = run_script(
            chan,
            DB_SETUP_SCRIPT_NAME,
            DB_SETUP_SCRIPT,
            &[&secret.value, &config.database_version],
        )?;
        ensure_success(out, "mariadb install script")?;
        vault.persist(chan, &config.app_user, &secret, &path)?;
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        let secret = vault.obtain(chan, DB_ROOT_CREDENTIAL, &path, None)?;
        let cmd = format!(
            "systemctl is-active --quiet mariadb \
             && MYSQL_PWD={} mariadb -u root -N -s -e 'SELECT VERSION()'",
            shell_quote(&secret.value)
        );
        let out = first_success(chan, &privileged(&cmd))?;
        if out.success() && out.stdout.contains(&config.database_version) {
            return Ok(());
        }
        let observed = if out.success() {
            format!("server version {}", out.stdout.trim())
        } else {
            format!(
                "login check exited {}: {}",
                out.exit_code,
                out.stderr.lines().next().unwrap_or("").trim()
            )
        };
        Err(StageError::verify(
            format!(
                "mariadb {} active and accepting root logins",
                config.database_version
            ),
            observed,
        ))
    }
}

const CHARSET_DROPIN: &str = "/etc/mysql/mariadb.conf.d/60-groundwork.cnf";
const CHARSET_CONTENT: &str =
    "[mysqld]\ncharacter-set-server = utf8mb4\ncollation-server = utf8mb4_unicode_ci\n";

fn charset_query(root_password: &str) -> String {
    format!(
        "MYSQL_PWD={} mariadb -u root -N -s -e \"SHOW VARIABLES LIKE 'character_set_server'\"",
        shell_quote(root_password)
    )
}

/// Value column of a `SHOW VARIABLES` single-row result.
fn variable_value(stdout: &str) -> Option<&str> {
    stdout.split_whitespace().nth(1)
}

/// Switches the server to utf8mb4, which the framework requires before
/// any site schema is created.
pub struct ConfigureDatabase;

impl Stage for ConfigureDatabase {
    fn name(&self) -> &'static str {
        "configure-database"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Dependencies
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        // Owned by install-database; absence means that stage never ran.
        let path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        let secret = vault.require(chan, DB_ROOT_CREDENTIAL, &path)?;
        let out = first_success(chan, &privileged(&charset_query(&secret.value)))?;
        if !out.success() {
            return Err(StageError::check(format!(
                "cannot query server charset (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(variable_value(&out.stdout) == Some("utf8mb4"))
    }

    fn apply(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let steps: [(&str, String); 2] = [
            (
                "write charset drop-in",
                format!(
                    "printf '%s' {} > {CHARSET_DROPIN}",
                    shell_quote(CHARSET_CONTENT)
                ),
            ),
            ("restart mariadb", "systemctl restart mariadb".to_string()),
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
        vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        let secret = vault.require(chan, DB_ROOT_CREDENTIAL, &path)?;
        let out = first_success(chan, &privileged(&charset_query(&secret.value)))?;
        let observed = variable_value(&out.stdout).unwrap_or("unknown");
        if out.success() && observed == "utf8mb4" {
            return Ok(());
        }
        Err(StageError::verify(
            "character_set_server = utf8mb4",
            format!("character_set_server = {observed}"),
        ))
    }
}

/// Installs the optional PDF/asset toolchain. Advisory; sites render
/// without it, minus PDF output.
pub struct InstallExtras;

fn extras_query() -> String {
    format!(
        "{} >/dev/null 2>&1 && command -v yarn >/dev/null 2>&1",
        dpkg_query(EXTRA_PACKAGES)
    )
}

impl Stage for InstallExtras {
    fn name(&self) -> &'static str {
        "install-extras"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Dependencies
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    fn is_satisfied(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(&extras_query())?;
        Ok(out.success())
    }

    fn apply(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let steps: [(&str, String); 2] = [
            (
                "apt-get install extras",
                format!(
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}",
                    EXTRA_PACKAGES.join(" ")
                ),
            ),
            ("install yarn", "npm install -g yarn".to_string()),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        Ok(())
    }

    fn verify(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = chan.run(&extras_query())?;
        if out.success() {
            return Ok(());
        }
        Err(StageError::verify(
            "PDF toolchain and yarn installed",
            format!("toolchain check exited {}", out.exit_code),
        ))
    }
}
