//! Evaluate command - one trigger evaluation pass, printed as JSON.

use air_quality_forecast::app::App;
use anyhow::{Context, Result};
use tracing::info;

/// Runs every trigger check once without dispatching anything.
///
/// # Errors
///
/// Returns an error if the triggers cannot be encoded.
pub async fn run(app: &App) -> Result<()> {
    let triggers = app.evaluator().evaluate().await;
    let actionable = triggers
        .iter()
        .filter(|trigger| trigger.severity.is_actionable())
        .count();
    info!(raised = triggers.len(), actionable, "Evaluation complete");

    let json = serde_json::to_string_pretty(&triggers).context("Failed to encode triggers")?;
    println!("{json}");
    Ok(())
}
