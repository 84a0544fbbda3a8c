//! Status command - health, blend weights and run history.

use air_quality_forecast::app::App;
use anyhow::{Context, Result};
use tracing::info;

/// Prints the system status report as JSON.
///
/// Queue load is read from the trigger log, since the control loop runs in
/// another process.
///
/// # Errors
///
/// Returns an error if the history cannot be read or encoded.
pub async fn run(app: &App) -> Result<()> {
    let pending = app.pending_tasks().await?;
    let status = app.status(pending).await?;
    info!(
        status = %status.status,
        active_tasks = status.active_tasks,
        total_runs = status.report.total_runs,
        success_rate = status.report.success_rate,
        "System status"
    );

    let json = serde_json::to_string_pretty(&status).context("Failed to encode status")?;
    println!("{json}");
    Ok(())
}
