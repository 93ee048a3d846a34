use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use deploy_scripts::config::CONFIG_FILE;
use deploy_scripts::{
    copy, new_script, AppliedStore, Config, CopyObserver, EnhancedError, ExecutionReport,
    FileLoader, Migrator, PendingGuard, Registry, RunDirection, ScriptDescriptor,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deploy-scripts")]
#[command(about = "Versioned post-deploy script sequencer", version)]
#[command(after_help = "Scripts are named <version>_<name>[.<scope>].<ext> and live in the configured sources.

Examples:
  deploy-scripts new backfill_totals
  deploy-scripts migrate
  deploy-scripts migrate --to 20240101
  deploy-scripts down --version 3
  deploy-scripts merge --dest post_deploy_scripts --source billing=vendor/billing/scripts")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new script with the next version
    New { name: String },

    /// Apply pending scripts, or move to a specific version
    Migrate {
        #[arg(long, value_name = "VERSION")]
        to: Option<u64>,
    },

    /// Apply a single script
    Up {
        #[arg(long)]
        version: u64,
    },

    /// Revert a single script
    Down {
        #[arg(long)]
        version: u64,
    },

    /// Revert the most recently applied scripts
    Rollback {
        #[arg(long, default_value = "1")]
        steps: usize,
    },

    /// Revert and re-apply the most recently applied scripts
    Redo {
        #[arg(long, default_value = "1")]
        steps: usize,
    },

    /// Revert every applied script
    Reset,

    /// List scripts and whether they have been applied
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Exit non-zero if any script is pending
    Check,

    /// Copy scripts from other sources into a destination
    Merge {
        #[arg(long)]
        dest: PathBuf,

        #[arg(long = "source", value_name = "SCOPE=DIR", value_parser = parse_source, required = true)]
        sources: Vec<(String, PathBuf)>,
    },
}

fn parse_source(raw: &str) -> std::result::Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((scope, dir)) if !scope.is_empty() && !dir.is_empty() => {
            Ok((scope.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected SCOPE=DIR, got `{raw}`")),
    }
}

struct MergePrinter;

impl CopyObserver for MergePrinter {
    fn on_skip(&mut self, scope: &str, script: &ScriptDescriptor) {
        println!(
            "{} Script {} from {} has been skipped. A script with the same name already exists.",
            "NOTE:".bright_yellow(),
            script.name.bright_white(),
            scope.bright_cyan()
        );
    }

    fn on_copy(&mut self, scope: &str, script: &ScriptDescriptor, old_path: &Path) {
        println!(
            "{} {} from {} {}",
            "Copied".green(),
            script.path.display().to_string().bright_white(),
            scope.bright_cyan(),
            format!("({})", old_path.display()).bright_black()
        );
    }
}

fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("{}", EnhancedError::new(err).display().red());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::New { name } => {
            let script = new_script(&config, &name)?;
            println!("{} Created {}", "✓".green(), script.path.display().to_string().bright_white());
        }

        Commands::Merge { dest, sources } => {
            let copied = copy(&dest, &sources, &config.parser(), config.numbering, &mut MergePrinter)?;
            println!("{} {} script(s) copied", "✓".green(), copied.len());
        }

        command => {
            let db = deploy_scripts::storage::open(&config)?;
            let loader = FileLoader;

            if let Commands::Check = command {
                PendingGuard::new(&config).check(&db)?;
                println!("{} No pending scripts", "✓".green());
                return Ok(());
            }

            let registry = Registry::build(&config.sources, &config.parser())?;
            let migrator = Migrator::new(registry, AppliedStore::new(&db, &config.table_name), &loader)?;

            let reports = match command {
                Commands::Migrate { to: Some(version) } => migrator.migrate_to(version)?,
                Commands::Migrate { to: None } => migrator.migrate(RunDirection::Apply, None)?,
                Commands::Up { version } => migrator.run(RunDirection::Apply, version)?.into_iter().collect(),
                Commands::Down { version } => migrator.run(RunDirection::Revert, version)?.into_iter().collect(),
                Commands::Rollback { steps } => migrator.rollback(steps)?,
                Commands::Redo { steps } => migrator.redo(steps)?,
                Commands::Reset => migrator.reset()?,
                Commands::Status { json } => {
                    show_status(&migrator, &config, json)?;
                    return Ok(());
                }
                Commands::New { .. } | Commands::Merge { .. } | Commands::Check => unreachable!(),
            };

            print_reports(&reports);
        }
    }

    Ok(())
}

fn print_reports(reports: &[ExecutionReport]) {
    if reports.is_empty() {
        println!("{} Nothing to do", "✓".green());
        return;
    }

    for report in reports {
        let verb = match report.direction {
            RunDirection::Apply => "applied".green(),
            RunDirection::Revert => "reverted".yellow(),
        };
        println!(
            "{} {} {} {}",
            verb.bold(),
            format!("{:>14}", report.version).bright_black(),
            report.name.bright_white(),
            format!("({}ms)", report.duration_ms).bright_black()
        );
    }
}

fn show_status(migrator: &Migrator<'_>, config: &Config, json: bool) -> Result<()> {
    let rows = migrator.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("\n{} {}", "database:".cyan().bold(), config.database.display());
    println!("{}", "═".repeat(60).bright_black());
    println!(" {:<6} {:>14}  {}", "Status", "Version", "Name");
    println!("{}", "─".repeat(60).bright_black());

    for row in rows {
        let status = if row.applied { "up".green() } else { "down".red() };
        let name = match &row.scope {
            Some(scope) => format!("{} [{}]", row.name, scope),
            None => row.name.clone(),
        };
        println!(" {:<6} {:>14}  {}", status, row.version, name);
    }
    println!();

    Ok(())
}
