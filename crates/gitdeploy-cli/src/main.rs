//! gitdeploy - operator CLI
//!
//! ## Commands
//!
//! - `deploy`: run a manual deployment
//! - `check`: validate the configuration and the server environment
//! - `status`: show the run lock holder and the published version
//! - `unlock`: clear a stale run lock

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use gitdeploy_core::obs::DeploySpan;
use gitdeploy_core::{
    DeployConfig, Deployer, RunLock, RunOutput, TriggerRequest, VersionLedger, CONFIG_ENV,
};

/// Caller address recorded for deployments started from this CLI.
const LOCAL_CALLER: &str = "127.0.0.1";

#[derive(Parser)]
#[command(name = "gitdeploy")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Webhook-triggered git deployment agent", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV, default_value = "deploy.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a branch now
    Deploy {
        /// Branch to deploy (default: first configured branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Commit to deploy (default: newest on the branch)
        #[arg(short = 'C', long)]
        commit: Option<String>,

        /// Access token (default: the configured token)
        #[arg(long, env = "GITDEPLOY_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Print the full report as JSON instead of the transcript
        #[arg(long)]
        report_json: bool,
    },

    /// Validate the configuration and check that git and rsync are installed
    Check,

    /// Show the run lock holder and the published version
    Status,

    /// Remove a stale run lock left by a crashed deployment
    Unlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gitdeploy_core::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Deploy {
            branch,
            commit,
            token,
            report_json,
        } => cmd_deploy(config, branch, commit, token, report_json).await,
        Commands::Check => cmd_check(config).await,
        Commands::Status => cmd_status(&config),
        Commands::Unlock => cmd_unlock(&config),
    }
}

fn load_config(path: &Path) -> Result<DeployConfig> {
    DeployConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn cmd_deploy(
    config: DeployConfig,
    branch: Option<String>,
    commit: Option<String>,
    token: Option<String>,
    report_json: bool,
) -> Result<()> {
    let token = token.unwrap_or_else(|| config.access_token.clone());
    let mut trigger = TriggerRequest::manual(LOCAL_CALLER, token);
    if let Some(branch) = branch {
        trigger = trigger.with_branch(branch);
    }
    if let Some(commit) = commit {
        trigger = trigger.with_commit(commit);
    }

    let deployer = Deployer::from_config(config).context("Failed to set up deployer")?;
    let report = deployer.handle(trigger).await;

    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.body());
        println!();
        println!("Run ID: {}", report.run_id);
        println!("Outcome: {} ({})", report.outcome.label(), report.status());
    }

    if !report.outcome.is_success() {
        anyhow::bail!(
            "deployment {} with status {}",
            report.outcome.label(),
            report.status()
        );
    }
    Ok(())
}

async fn cmd_check(config: DeployConfig) -> Result<()> {
    let problems = config.problems();
    if problems.is_empty() {
        println!("Configuration OK.");
    } else {
        println!("Configuration Error:");
        for problem in &problems {
            println!("  - {problem}");
        }
    }

    let deployer = Deployer::from_config(config).context("Failed to set up deployer")?;
    let _span = DeploySpan::enter("check", "");
    let mut out = RunOutput::new("check");
    let env = deployer.check_environment(&mut out).await;
    print!("{}", out.render());

    for ext in &deployer.config().extensions {
        println!("Extension: {}", ext.name);
    }

    if !problems.is_empty() {
        anyhow::bail!("{} configuration problem(s)", problems.len());
    }
    env.context("Environment check failed")?;
    Ok(())
}

fn cmd_status(config: &DeployConfig) -> Result<()> {
    let lock = RunLock::new(config.lock_file.clone());
    match lock.holder()? {
        Some(holder) => {
            println!("Lock:      held ({})", lock.path().display());
            println!("  run id:  {}", holder.run_id);
            println!("  pid:     {}", holder.pid);
            println!("  since:   {}", holder.acquired_at.to_rfc3339());
        }
        None if lock.is_held() => {
            println!(
                "Lock:      held by an unknown process ({})",
                lock.path().display()
            );
        }
        None => println!("Lock:      free"),
    }

    let ledger = VersionLedger::new(config.version_file());
    match ledger.read()? {
        Some(commit) => println!("Published: {commit}"),
        None => println!("Published: (no {} file)", ledger.path().display()),
    }
    Ok(())
}

fn cmd_unlock(config: &DeployConfig) -> Result<()> {
    let lock = RunLock::new(config.lock_file.clone());
    if let Some(holder) = lock.holder()? {
        info!(run_id = %holder.run_id, pid = holder.pid, "clearing run lock");
    }
    if lock.clear()? {
        println!("Removed {}", lock.path().display());
    } else {
        println!("No lock at {}", lock.path().display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_deploy_flags_parse() {
        let cli = Cli::try_parse_from([
            "gitdeploy", "--config", "/etc/gitdeploy/site.toml", "deploy", "-b", "staging", "-C",
            "abc1",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/gitdeploy/site.toml"));
        match cli.command {
            Commands::Deploy { branch, commit, .. } => {
                assert_eq!(branch.as_deref(), Some("staging"));
                assert_eq!(commit.as_deref(), Some("abc1"));
            }
            _ => panic!("expected deploy"),
        }
    }
}
