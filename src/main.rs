use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sqlduet::config::{FileConfig, HarnessConfig};
use sqlduet::db::NativeConnector;
use sqlduet::loader::RequestDir;
use sqlduet::model::Model;
use sqlduet::orchestrator::{self, Orchestrator, RunOptions, DEFAULT_PREVIEW_LIMIT};
use sqlduet::report::Presenter;
use sqlduet::seed::SeedPlan;

/// Run the same SQL against PostgreSQL and Oracle and compare results and plans
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML config file (default: <config dir>/sqlduet/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// .env file to load before reading the environment (default: ./.env if present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Never colour the report
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to both engines and create any missing table
    Init,
    /// Init, then clear and reinsert the fixture data
    Seed {
        /// Multiply every table size by this factor
        #[arg(long, default_value_t = 1.0)]
        scale: f64,
    },
    /// Execute every request file on both engines and report
    Run {
        /// Directory of *.sql request files
        #[arg(long, default_value = "requests")]
        requests: PathBuf,

        /// Rows shown per result
        #[arg(long, default_value_t = DEFAULT_PREVIEW_LIMIT)]
        limit: usize,

        /// Reseed before running
        #[arg(long)]
        seed: bool,

        /// Fixture scale when seeding
        #[arg(long, default_value_t = 1.0)]
        scale: f64,

        /// Exit with status 2 if any statement or file failed
        #[arg(long)]
        strict: bool,
    },
    /// Drop every harness table on both engines
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Before the subscriber, so RUST_LOG may come from the .env file.
    let env_loaded = load_env_file(cli.env_file.as_deref());
    init_tracing(cli.verbose);

    let result = match env_loaded {
        Ok(()) => run(cli).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("sqlduet=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlduet=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_env_file(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("failed to load .env"),
        },
    }
    Ok(())
}

fn seed_plan(scale: f64) -> Result<SeedPlan> {
    ensure!(
        scale.is_finite() && scale > 0.0,
        "--scale must be a positive number, got {scale}"
    );
    Ok(SeedPlan::scaled(scale))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let file_config = match &cli.config {
        Some(path) => FileConfig::read(path, true)?,
        None => FileConfig::read(&FileConfig::default_path(), false)?,
    };
    let config = HarnessConfig::from_env(&file_config).context("invalid configuration")?;
    let connector = NativeConnector;
    let model = Model::festival();
    let mut presenter = Presenter::stdout(cli.no_color);

    let (options, strict) = match cli.command {
        Command::Reset => {
            let code = match orchestrator::reset(&connector, &config, &model, &mut presenter).await
            {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::from(1),
            };
            return Ok(code);
        }
        Command::Init => (RunOptions::default(), false),
        Command::Seed { scale } => (
            RunOptions {
                seed: Some(seed_plan(scale)?),
                ..RunOptions::default()
            },
            false,
        ),
        Command::Run {
            requests,
            limit,
            seed,
            scale,
            strict,
        } => (
            RunOptions {
                requests: Some(RequestDir::new(requests)),
                preview_limit: limit,
                seed: if seed { Some(seed_plan(scale)?) } else { None },
            },
            strict,
        ),
    };

    let outcome = Orchestrator::new(&connector, &config, model, options, &mut presenter)
        .run()
        .await;
    Ok(ExitCode::from(outcome.exit_code(strict)))
}
