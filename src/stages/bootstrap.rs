//! Workspace bootstrap stages: bench CLI, workspace init, first site,
//! systemd unit.

use std::thread;
use std::time::Duration;

use crate::background::with_background_process;
use crate::command::{
    as_user, ensure_success, first_success, privileged, shell_quote,
};
use crate::config::Config;
use crate::error::{StageError, VaultError};
use crate::session::CommandChannel;
use crate::stage::{Stage, StageGroup};
use crate::vault::{
    credential_path, home_dir, CredentialVault, DB_ROOT_CREDENTIAL,
    SITE_ADMIN_CREDENTIAL,
};

/// Directory under the app user's home holding the bench workspace.
pub const WORKSPACE_DIR: &str = "frappe-bench";

/// Installs the bench CLI into the app user's pipx environment.
pub struct InstallBenchCli;

impl Stage for InstallBenchCli {
    fn name(&self) -> &'static str {
        "install-bench-cli"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Bootstrap
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let probe = as_user(&config.app_user, "command -v bench >/dev/null 2>&1");
        let out = first_success(chan, &probe)?;
        Ok(out.success())
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let cmd = as_user(
            &config.app_user,
            "pipx install frappe-bench && pipx ensurepath",
        );
        let out = first_success(chan, &cmd)?;
        ensure_success(out, "pipx install frappe-bench")?;
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let out = first_success(chan, &as_user(&config.app_user, "bench --version"))?;
        if out.success() && !out.stdout.trim().is_empty() {
            return Ok(());
        }
        Err(StageError::verify(
            "bench CLI answering --version",
            format!("exit {}: {}", out.exit_code, out.stderr.trim()),
        ))
    }
}

/// Initializes the bench workspace on the pinned framework branch.
pub struct InitWorkspace;

impl Stage for InitWorkspace {
    fn name(&self) -> &'static str {
        "init-workspace"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Bootstrap
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let probe = as_user(
            &config.app_user,
            &format!("test -d ~/{WORKSPACE_DIR}/apps/frappe"),
        );
        let out = first_success(chan, &probe)?;
        Ok(out.success())
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let cmd = as_user(
            &config.app_user,
            &format!(
                "cd ~ && bench init --frappe-branch {} {WORKSPACE_DIR}",
                shell_quote(&config.app_version)
            ),
        );
        let out = first_success(chan, &cmd)?;
        ensure_success(out, "bench init")?;
        Ok(())
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let probe = as_user(
            &config.app_user,
            &format!(
                "test -d ~/{WORKSPACE_DIR}/apps/frappe && test -x ~/{WORKSPACE_DIR}/env/bin/python"
            ),
        );
        let out = first_success(chan, &probe)?;
        if out.success() {
            return Ok(());
        }
        Err(StageError::verify(
            "workspace with framework checkout and virtualenv",
            format!("layout check exited {}", out.exit_code),
        ))
    }
}

/// How long the scoped redis gets to come up before site creation starts.
const REDIS_SETTLE: Duration = Duration::from_secs(2);

/// `bench new-site` expects a cache on the default port. The distro
/// service is disabled at package install time, so a scoped instance is
/// spawned just for the duration of this stage.
const SCOPED_REDIS: &str = "redis-server --port 6379";

/// Creates the first site and persists its admin credential.
pub struct CreateSite;

impl Stage for CreateSite {
    fn name(&self) -> &'static str {
        "create-site"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Bootstrap
    }

    fn is_satisfied(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let probe = as_user(
            &config.app_user,
            &format!(
                "test -d ~/{WORKSPACE_DIR}/sites/{}",
                shell_quote(&config.site_name)
            ),
        );
        let out = first_success(chan, &probe)?;
        if !out.success() {
            return Ok(false);
        }
        let path = credential_path(&config.app_user, SITE_ADMIN_CREDENTIAL);
        Ok(vault.exists(chan, &path)?)
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        // The database root credential belongs to the install-database
        // stage; if it is not on the host the dependencies group has not
        // completed, and inventing a value here would only defer the
        // failure to a confusing auth error inside bench.
        let db_path = credential_path(&config.app_user, DB_ROOT_CREDENTIAL);
        let db_root = vault.require(chan, DB_ROOT_CREDENTIAL, &db_path)?;

        // The credential hits disk before the site that bakes it in is
        // created, so an interrupted run never leaves a site whose admin
        // password exists nowhere durable. A value persisted by an
        // earlier attempt is honored over generating a fresh one.
        let admin_path = credential_path(&config.app_user, SITE_ADMIN_CREDENTIAL);
        let admin = vault.obtain(
            chan,
            SITE_ADMIN_CREDENTIAL,
            &admin_path,
            config.admin_password.as_deref(),
        )?;
        vault.persist(chan, &config.app_user, &admin, &admin_path)?;

        let new_site = format!(
            "cd ~/{WORKSPACE_DIR} && bench new-site {} --db-root-password {} --admin-password {}",
            shell_quote(&config.site_name),
            shell_quote(&db_root.value),
            shell_quote(&admin.value)
        );
        let variants = as_user(&config.app_user, &new_site);

        with_background_process(chan, SCOPED_REDIS, REDIS_SETTLE, |chan| {
            let out = first_success(chan, &variants)?;
            ensure_success(out, "bench new-site")?;
            Ok(())
        })
    }

    fn verify(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let probe = as_user(
            &config.app_user,
            &format!(
                "test -f ~/{WORKSPACE_DIR}/sites/{}/site_config.json",
                shell_quote(&config.site_name)
            ),
        );
        let out = first_success(chan, &probe)?;
        if !out.success() {
            return Err(StageError::verify(
                format!("site {} on disk", config.site_name),
                "site_config.json missing".to_string(),
            ));
        }
        let admin_path = credential_path(&config.app_user, SITE_ADMIN_CREDENTIAL);
        match vault.retrieve(chan, &admin_path) {
            Ok(_) => Ok(()),
            Err(VaultError::NotFound { .. }) => Err(StageError::verify(
                "persisted site admin credential",
                "credential file absent".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }
}

const SERVICE_NAME: &str = "frappe-bench";
const SERVICE_SETTLE: Duration = Duration::from_secs(3);
const APP_PORT: u16 = 8000;

fn unit_text(config: &Config) -> String {
    let home = home_dir(&config.app_user);
    format!(
        "[Unit]\n\
         Description=Frappe bench development server\n\
         After=network.target mariadb.service\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         WorkingDirectory={home}/{WORKSPACE_DIR}\n\
         ExecStart=/bin/sh -lc 'exec bench start'\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        user = config.app_user,
    )
}

/// Any listener bound to the given TCP port in `ss -ltn` output.
fn listening(listing: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    listing.lines().any(|line| {
        line.split_whitespace()
            .nth(3)
            .is_some_and(|addr| addr.ends_with(&suffix))
    })
}

/// Installs and starts the systemd unit that keeps the bench running.
pub struct EnableAppService;

impl Stage for EnableAppService {
    fn name(&self) -> &'static str {
        "enable-app-service"
    }

    fn group(&self) -> StageGroup {
        StageGroup::Bootstrap
    }

    fn is_satisfied(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<bool, StageError> {
        let out = chan.run(&format!("systemctl is-active --quiet {SERVICE_NAME}"))?;
        Ok(out.success())
    }

    fn apply(
        &self,
        config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let steps: [(&str, String); 3] = [
            (
                "write service unit",
                format!(
                    "printf '%s' {} > /etc/systemd/system/{SERVICE_NAME}.service",
                    shell_quote(&unit_text(config))
                ),
            ),
            ("daemon-reload", "systemctl daemon-reload".to_string()),
            (
                "enable service",
                format!("systemctl enable --now {SERVICE_NAME}"),
            ),
        ];
        for (what, cmd) in &steps {
            let out = first_success(chan, &privileged(cmd))?;
            ensure_success(out, what)?;
        }
        // Give the dev server a moment to bind before verification looks
        // for the listener.
        thread::sleep(SERVICE_SETTLE);
        Ok(())
    }

    fn verify(
        &self,
        _config: &Config,
        chan: &mut dyn CommandChannel,
        _vault: &mut CredentialVault,
    ) -> Result<(), StageError> {
        let cmd = format!("systemctl is-active --quiet {SERVICE_NAME} && ss -ltn");
        let out = first_success(chan, &privileged(&cmd))?;
        if !out.success() {
            return Err(StageError::verify(
                format!("{SERVICE_NAME} unit active"),
                "unit inactive".to_string(),
            ));
        }
        if listening(&out.stdout, APP_PORT) {
            return Ok(());
        }
        Err(StageError::verify(
            format!("listener on port {APP_PORT}"),
            "nothing listening".to_string(),
        ))
    }
}
