//! Picks up jobs whose driver went away (crash, restart, lost HTTP trigger)
//! and drives them again.

use crate::services::driver::{spawn_drive, with_orchestrator};
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;

pub fn start_stall_watcher(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = state.cancel.cancelled() => break,
                _ = interval.tick() => {
                    match with_orchestrator(&state.orchestrator, |o| o.stalled_jobs()).await {
                        Ok(Ok(stalled)) => {
                            for job in stalled {
                                tracing::warn!(
                                    job_id = %job.id,
                                    phase = ?job.phase,
                                    last_update = %job.last_update,
                                    "Stalled backup job, resuming"
                                );
                                spawn_drive(state.clone(), job.id).await;
                            }
                        }
                        Ok(Err(e)) => tracing::warn!("Stall check failed: {}", e),
                        Err(e) => tracing::error!("Stall check failed: {e:#}"),
                    }
                }
            }
        }
        tracing::info!("Stall watcher stopped");
    });
}
