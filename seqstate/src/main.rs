//! Operator CLI for seqstate.
//!
//! Reads the suite from `seqstate.toml` and drives units through their
//! environment lifecycle. Exit codes are listed in [`seqstate::exit_codes`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use seqstate::core::suite::Suite;
use seqstate::exit_codes;
use seqstate::io::config::{DEFAULT_CONFIG_FILE, SeqstateConfig, load_config};
use seqstate::io::environment::EnvironmentManager;
use seqstate::io::executor::CommandUnitRunner;
use seqstate::logging;
use seqstate::orchestrator::Orchestrator;
use seqstate::status::{collect_status, render_status};

#[derive(Parser)]
#[command(
    name = "seqstate",
    version,
    about = "Run sequential suite units against trustworthy environments"
)]
struct Cli {
    /// Path to the suite configuration.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration.
    Validate,
    /// Prepare the unit's environment, run its command, record the outcome.
    Run { unit: String },
    /// Prepare the unit's environment and print its work directory.
    /// The caller runs the body and then calls `complete`.
    Prepare { unit: String },
    /// Record completion of a unit started by `prepare`.
    Complete { unit: String },
    /// Show unit states per environment.
    Status {
        /// Only report this environment.
        #[arg(long)]
        env: Option<String>,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Delete an environment's working directory and markers.
    Wipe {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        env: Option<String>,
        /// Wipe every environment under the state root.
        #[arg(long)]
        all: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let suite = config.suite()?;
    let envs = environment_manager(&config, &cli.config);
    match cli.command {
        Command::Validate => cmd_validate(&suite),
        Command::Run { unit } => cmd_run(&config, &suite, &envs, &unit),
        Command::Prepare { unit } => cmd_prepare(&config, &suite, &envs, &unit),
        Command::Complete { unit } => cmd_complete(&config, &suite, &envs, &unit),
        Command::Status { env, json } => cmd_status(&suite, &envs, env.as_deref(), json),
        Command::Wipe { env, all } => cmd_wipe(&envs, env.as_deref(), all),
    }
}

fn environment_manager(config: &SeqstateConfig, config_path: &Path) -> EnvironmentManager {
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    EnvironmentManager::new(config.resolved_state_root(base), config.lock_policy())
}

fn command_runner(config: &SeqstateConfig) -> CommandUnitRunner {
    CommandUnitRunner::new(
        config.commands(),
        config.unit_timeout(),
        config.output_limit_bytes,
    )
}

fn cmd_validate(suite: &Suite) -> Result<()> {
    let independent = suite.units().count() - suite.order().len();
    println!(
        "ok: {} sequential, {} independent",
        suite.order().len(),
        independent
    );
    Ok(())
}

fn cmd_run(
    config: &SeqstateConfig,
    suite: &Suite,
    envs: &EnvironmentManager,
    unit: &str,
) -> Result<()> {
    let orchestrator = Orchestrator::new(suite, envs, command_runner(config));
    let report = orchestrator
        .run(unit)
        .with_context(|| format!("run unit '{unit}'"))?;
    if report.rebuilt {
        info!(environment = %report.environment, "environment was rebuilt");
    }
    println!("{} complete in {}", report.unit, report.environment);
    Ok(())
}

fn cmd_prepare(
    config: &SeqstateConfig,
    suite: &Suite,
    envs: &EnvironmentManager,
    unit: &str,
) -> Result<()> {
    let orchestrator = Orchestrator::new(suite, envs, command_runner(config));
    let activation = orchestrator
        .begin(unit)
        .with_context(|| format!("prepare unit '{unit}'"))?;
    if let Some(pollution) = activation.pollution() {
        info!(%pollution, "environment was rebuilt");
    }
    if !activation.prerequisites_run().is_empty() {
        info!(chain = ?activation.prerequisites_run(), "prerequisites materialized");
    }
    println!("{}", activation.environment().work_dir().display());
    Ok(())
}

fn cmd_complete(
    config: &SeqstateConfig,
    suite: &Suite,
    envs: &EnvironmentManager,
    unit: &str,
) -> Result<()> {
    let orchestrator = Orchestrator::new(suite, envs, command_runner(config));
    orchestrator
        .mark_complete(unit)
        .with_context(|| format!("complete unit '{unit}'"))?;
    Ok(())
}

fn cmd_status(
    suite: &Suite,
    envs: &EnvironmentManager,
    only: Option<&str>,
    json: bool,
) -> Result<()> {
    let report = collect_status(suite, envs, only)?;
    if json {
        let payload = serde_json::to_string_pretty(&report).context("serialize status")?;
        println!("{payload}");
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

fn cmd_wipe(envs: &EnvironmentManager, env: Option<&str>, all: bool) -> Result<()> {
    let targets: Vec<String> = match (env, all) {
        (_, true) => envs.list()?.into_iter().collect(),
        (Some(name), false) => vec![name.to_string()],
        (None, false) => bail!("name an environment or pass --all"),
    };
    for name in targets {
        envs.wipe(&name)?;
        println!("wiped {name}");
    }
    Ok(())
}
