use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Groundwork - staged SSH provisioning for a single host
#[derive(Parser)]
#[command(name = "groundwork")]
#[command(about = "Provision a Debian/Ubuntu host over SSH in idempotent stages")]
#[command(version)]
pub struct Cli {
    /// Path to the provisioning config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hardening stages (timezone, swap, service user, sshd, firewall)
    Harden,
    /// Run the dependency stages (packages, database, optional extras)
    Deps,
    /// Run the bootstrap stages (bench CLI, workspace, site, app service)
    Bootstrap,
    /// Run every stage, all groups in order
    Provision,
    /// Check the config file without touching the host
    Validate,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
