use crate::state::AppState;
use backup_engine::{BackupJob, BackupOrchestrator, EngineError};
use std::sync::{Arc, Mutex};

/// Run `f` against the orchestrator on the blocking pool.
///
/// The outer error covers a panicked task or a poisoned lock; the inner one is
/// whatever the engine returned.
pub async fn with_orchestrator<T, F>(
    orchestrator: &Arc<Mutex<BackupOrchestrator>>,
    f: F,
) -> anyhow::Result<Result<T, EngineError>>
where
    T: Send + 'static,
    F: FnOnce(&mut BackupOrchestrator) -> Result<T, EngineError> + Send + 'static,
{
    let orchestrator = orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = orchestrator
            .lock()
            .map_err(|_| anyhow::anyhow!("engine lock poisoned"))?;
        Ok::<_, anyhow::Error>(f(&mut guard))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(result)
}

/// Drive `id` in budgeted slices until it is terminal.
///
/// The lock is released between slices so status reads and cancellations
/// interleave with the backup.
pub async fn drive_to_end(
    orchestrator: &Arc<Mutex<BackupOrchestrator>>,
    id: &str,
) -> anyhow::Result<BackupJob> {
    loop {
        let job_id = id.to_string();
        let job = with_orchestrator(orchestrator, move |o| {
            let budget = o.drive_budget();
            o.drive(&job_id, budget)
        })
        .await??;
        tracing::debug!(job_id = %job.id, progress = job.progress, "{}", job.message);
        if job.is_terminal() {
            return Ok(job);
        }
        tokio::task::yield_now().await;
    }
}

/// Drive `id` on a background task unless one is already driving it.
pub async fn spawn_drive(state: Arc<AppState>, id: String) {
    {
        let mut driving = state.driving.lock().await;
        if !driving.insert(id.clone()) {
            return;
        }
    }

    tokio::spawn(async move {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                tracing::info!(job_id = %id, "Shutdown: job left for the next run to resume");
            }
            result = drive_to_end(&state.orchestrator, &id) => match result {
                Ok(job) => tracing::info!(
                    job_id = %job.id,
                    phase = ?job.phase,
                    "Backup job finished: {}",
                    job.message
                ),
                Err(e) => tracing::error!(job_id = %id, "Backup job driver failed: {e:#}"),
            },
        }
        state.driving.lock().await.remove(&id);
    });
}
