//! Groundwork - staged SSH provisioning entry point.

use std::path::Path;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use groundwork::cli::{Cli, Commands};
use groundwork::{
    stages, Config, PipelineRun, PipelineRunner, SshOpener, StageGroup, StageState,
};

/// Initialize the logger with appropriate settings; RUST_LOG overrides.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse_args();

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate => validate(&cli.config),
        Commands::Harden => run_pipeline(&cli.config, Some(StageGroup::Hardening)),
        Commands::Deps => run_pipeline(&cli.config, Some(StageGroup::Dependencies)),
        Commands::Bootstrap => run_pipeline(&cli.config, Some(StageGroup::Bootstrap)),
        Commands::Provision => run_pipeline(&cli.config, None),
    }
}

/// Load and fully check the config without opening a connection.
fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    for group in StageGroup::all() {
        config.require_for(group)?;
    }
    println!("✓ {} is valid: {config}", path.display());
    Ok(())
}

/// Run one group, or the whole pipeline when `group` is `None`.
fn run_pipeline(path: &Path, group: Option<StageGroup>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    match group {
        Some(group) => config.require_for(group)?,
        None => {
            for group in StageGroup::all() {
                config.require_for(group)?;
            }
        }
    }

    let stages = match group {
        Some(group) => stages::for_group(&config, group),
        None => stages::full(&config),
    };
    info!(host = %config, stages = stages.len(), "starting provisioning run");

    let mut opener = SshOpener::default();
    let mut runner = PipelineRunner::new(&config, &mut opener);
    let run = runner
        .run(&stages)
        .with_context(|| format!("connecting to {config}"))?;

    print_report(&run);
    if !run.succeeded() {
        bail!("provisioning halted");
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

fn print_report(run: &PipelineRun) {
    println!();
    println!("{:<24} {:<14} RESULT", "STAGE", "GROUP");
    for report in run.reports() {
        let mark = match report.state {
            StageState::Verified => "✓",
            StageState::Skipped => "-",
            StageState::Failed => "✗",
            StageState::Pending | StageState::Running => "?",
        };
        println!(
            "{:<24} {:<14} {mark} {}",
            report.name,
            report.group.to_string(),
            report.state
        );
        if let Some(err) = &report.error {
            println!("{:<41}{err}", "");
        }
    }

    let warnings = run.warnings();
    if warnings > 0 {
        println!("\n⚠ {warnings} advisory stage(s) failed");
    }
    match run.halt() {
        Some(halt) => println!("\n✗ {halt}"),
        None => println!("\n✓ all stages passed"),
    }
}
