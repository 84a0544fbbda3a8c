//! Retrain command - runs a manual trigger inline.

use air_quality_forecast::app::App;
use air_quality_forecast::orchestrator::OrchestrationOutcome;
use anyhow::{Context, Result, bail};
use forecast_structs::{ModelScope, RetrainingTrigger};
use tracing::{info, warn};

/// Retrains `scope` now and prints the run result.
///
/// # Errors
///
/// Returns an error if the run was coalesced or the result cannot be encoded.
pub async fn run(app: &App, scope: ModelScope, reason: &str) -> Result<()> {
    let trigger = RetrainingTrigger::manual(scope, reason);
    info!(trigger = %trigger.id, scope = %scope, "Manual retraining requested");

    let outcome = app.orchestrator.execute(trigger).await;
    app.monitor.flush().await;

    let result = match outcome {
        OrchestrationOutcome::Completed(result) => result,
        OrchestrationOutcome::Coalesced { busy, .. } => {
            bail!("Models already being retrained: {busy:?}");
        }
    };

    if result.success {
        let promoted: Vec<_> = result.promoted_models().collect();
        info!(
            promoted = ?promoted,
            duration_seconds = result.duration_seconds,
            "Retraining finished"
        );
    } else {
        warn!(error = ?result.error, "Retraining promoted no model");
    }

    let json = serde_json::to_string_pretty(&result).context("Failed to encode result")?;
    println!("{json}");
    Ok(())
}
