use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polar_startup::{
    init_tracing, inspect_skill_manifest, load_governance_config, render_skill_inspection,
    GovernanceRuntime,
};

#[derive(Debug, Parser)]
#[command(
    name = "polar-governance",
    about = "Operator tooling for the Polar extension governance engine",
    version
)]
struct Cli {
    #[arg(long, global = true, help = "Emit machine-readable JSON instead of text.")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a governance config file and report the effective policy.
    CheckConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Parse a skill manifest and report capability risk metadata.
    InspectSkill {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { path } => {
            let config = load_governance_config(&path)?;
            let runtime = GovernanceRuntime::new(config)?;
            let config = runtime.config();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!(
                    "config ok: path={} schema_version={} dev_mode={} approval_required_permissions={} auto_enable_trusted={} default_model={} contracts={}",
                    path.display(),
                    config.schema_version(),
                    config.dev_mode,
                    config.approval_required_permissions.len(),
                    config.auto_enable_trusted,
                    config.models.default_model,
                    runtime.contracts().len()
                );
            }
        }
        Command::InspectSkill { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read skill manifest {}", path.display()))?;
            let report = inspect_skill_manifest(&raw)
                .with_context(|| format!("invalid skill manifest {}", path.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_skill_inspection(&report));
            }
        }
    }
    Ok(())
}
