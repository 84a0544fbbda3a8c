//! Run command - the control loop until Ctrl-C.

use std::sync::Arc;

use air_quality_forecast::app::App;
use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Evaluates triggers on the configured cadence and retrains in the background.
///
/// Untrained models are queued for a warm start first.
///
/// # Errors
///
/// Returns an error if a warm-start trigger cannot be queued.
pub async fn run(app: &App) -> Result<()> {
    let queue = app.start_queue();

    let warm_start = app.warm_start_triggers();
    if !warm_start.is_empty() {
        info!(models = warm_start.len(), "Queuing warm-start retraining");
    }
    for trigger in &warm_start {
        queue.submit(trigger).await?;
    }

    let control = app.control_loop(Arc::clone(&queue));
    let (shutdown, receiver) = watch::channel(false);

    tokio::join!(control.run(receiver), async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(error) => error!(%error, "Could not listen for Ctrl-C, shutting down"),
        }
        // The loop may already be gone.
        let _ = shutdown.send(true);
    });

    drop(control);
    match Arc::into_inner(queue) {
        Some(queue) => queue.close().await,
        None => warn!("Retraining queue still shared, not draining"),
    }
    app.monitor.flush().await;

    info!("Stopped");
    Ok(())
}
