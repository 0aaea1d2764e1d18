//! The shipped pipeline, grouped into hardening, dependencies and
//! bootstrap. Order within each group is load-bearing: later stages
//! assume the state their predecessors verified.

mod bootstrap;
mod dependencies;
mod hardening;

pub use bootstrap::{
    CreateSite, EnableAppService, InitWorkspace, InstallBenchCli, WORKSPACE_DIR,
};
pub use dependencies::{
    ConfigureDatabase, InstallBasePackages, InstallDatabase, InstallExtras,
    BASE_PACKAGES, EXTRA_PACKAGES,
};
pub use hardening::{
    CreateServiceUser, EnableFirewall, HardenSsh, ProvisionSwap, SetTimezone,
};

use crate::config::Config;
use crate::stage::{Stage, StageGroup};

/// Host hardening: timezone, swap, service user, sshd, firewall.
pub fn hardening() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SetTimezone),
        Box::new(ProvisionSwap),
        Box::new(CreateServiceUser),
        Box::new(HardenSsh),
        Box::new(EnableFirewall),
    ]
}

/// Platform dependencies: packages, database, optional extras.
pub fn dependencies(config: &Config) -> Vec<Box<dyn Stage>> {
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(InstallBasePackages),
        Box::new(InstallDatabase),
        Box::new(ConfigureDatabase),
    ];
    if config.install_extras {
        stages.push(Box::new(InstallExtras));
    }
    stages
}

/// Workspace bootstrap: bench CLI, workspace, site, systemd unit.
pub fn bootstrap() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(InstallBenchCli),
        Box::new(InitWorkspace),
        Box::new(CreateSite),
        Box::new(EnableAppService),
    ]
}

/// Stages for one group, in pipeline order.
pub fn for_group(config: &Config, group: StageGroup) -> Vec<Box<dyn Stage>> {
    match group {
        StageGroup::Hardening => hardening(),
        StageGroup::Dependencies => dependencies(config),
        StageGroup::Bootstrap => bootstrap(),
    }
}

/// The whole pipeline, all groups in order.
pub fn full(config: &Config) -> Vec<Box<dyn Stage>> {
    let mut stages = hardening();
    stages.extend(dependencies(config));
    stages.extend(bootstrap());
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Criticality;

    fn names(stages: &[Box<dyn Stage>]) -> Vec<&'static str> {
        stages.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_hardening_order() {
        assert_eq!(
            names(&hardening()),
            vec![
                "set-timezone",
                "provision-swap",
                "create-service-user",
                "harden-ssh",
                "enable-firewall",
            ]
        );
    }

    #[test]
    fn test_dependencies_order_and_extras_gate() {
        let mut config = Config::default();
        config.install_extras = false;
        assert_eq!(
            names(&dependencies(&config)),
            vec![
                "install-base-packages",
                "install-database",
                "configure-database",
            ]
        );

        config.install_extras = true;
        assert_eq!(
            names(&dependencies(&config)),
            vec![
                "install-base-packages",
                "install-database",
                "configure-database",
                "install-extras",
            ]
        );
    }

    #[test]
    fn test_bootstrap_order() {
        assert_eq!(
            names(&bootstrap()),
            vec![
                "install-bench-cli",
                "init-workspace",
                "create-site",
                "enable-app-service",
            ]
        );
    }

    #[test]
    fn test_full_concatenates_groups_in_order() {
        let mut config = Config::default();
        config.install_extras = true;
        let all = full(&config);
        assert_eq!(all.len(), 13);
        assert_eq!(all[0].name(), "set-timezone");
        assert_eq!(all[5].name(), "install-base-packages");
        assert_eq!(all[12].name(), "enable-app-service");
    }

    #[test]
    fn test_every_stage_reports_its_group() {
        let config = Config::default();
        for group in StageGroup::all() {
            for stage in for_group(&config, group) {
                assert_eq!(stage.group(), group, "{}", stage.name());
            }
        }
    }

    #[test]
    fn test_only_firewall_and_extras_are_advisory() {
        let mut config = Config::default();
        config.install_extras = true;
        for stage in full(&config) {
            let advisory = matches!(stage.criticality(), Criticality::Advisory);
            let expected = matches!(stage.name(), "enable-firewall" | "install-extras");
            assert_eq!(advisory, expected, "{}", stage.name());
        }
    }
}
