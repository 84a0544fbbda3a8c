//! Air quality ensemble forecaster
//!
//! Evaluates retraining triggers, retrains and promotes PM2.5 forecasters,
//! and reports on the health of the retraining loop.

use air_quality_forecast::app::App;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use database::{create_pool, run_migrations};
use forecast_structs::ModelScope;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;

/// Air quality ensemble forecaster
#[derive(Parser)]
#[command(name = "aqi-forecast")]
#[command(about = "PM2.5 ensemble forecasting with automated retraining")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trigger control loop until Ctrl-C
    Run,

    /// Evaluate retraining triggers once and print them as JSON
    Evaluate,

    /// Retrain a model (or the whole ensemble) now
    Retrain {
        /// Model kind (`gradient_boost`, `recurrent`, `graph_spatial`) or `ensemble`
        #[arg(short, long, default_value = "ensemble")]
        model: ModelScope,

        /// Reason recorded on the manual trigger
        #[arg(short, long, default_value = "requested from cli")]
        reason: String,
    },

    /// Print system status, blend weights and retraining history
    Status,

    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let file_layer = match &config.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(log_file))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    let pool = create_pool(&config.database_url)
        .await
        .context("Failed to open database")?;

    if matches!(cli.command, Commands::Migrate) {
        run_migrations(&pool).await?;
        info!("Migrations completed successfully");
        return Ok(());
    }

    run_migrations(&pool).await.context("Failed to migrate database")?;
    let app = App::build(config, pool).await?;

    match cli.command {
        Commands::Run => commands::run::run(&app).await?,
        Commands::Evaluate => commands::evaluate::run(&app).await?,
        Commands::Retrain { model, reason } => {
            commands::retrain::run(&app, model, &reason).await?;
        }
        Commands::Status => commands::status::run(&app).await?,
        Commands::Migrate => {}
    }

    Ok(())
}
