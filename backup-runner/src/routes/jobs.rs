use crate::db::store::SqliteJobStore;
use crate::error::AppError;
use crate::services::driver::{spawn_drive, with_orchestrator};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::{BackupJob, JobRequest};
use serde::Deserialize;
use std::sync::Arc;

pub const TOKEN_HEADER: &str = "x-continuation-token";

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job))
        .route("/{id}/continue", post(continue_job))
        .route("/{id}/cancel", post(cancel_job))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupJob>>, AppError> {
    let db = state.db.clone();
    let limit = query.limit.unwrap_or(50).min(500);
    let jobs = tokio::task::spawn_blocking(move || SqliteJobStore::new(db).list_recent(limit))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<JobRequest>,
) -> Result<(StatusCode, Json<BackupJob>), AppError> {
    if body.destinations.iter().any(|d| d.trim().is_empty()) {
        return Err(AppError::BadRequest("destinations must not contain empty ids".into()));
    }

    let job = with_orchestrator(&state.orchestrator, move |o| o.start(body)).await??;

    if state.auto_drive {
        spawn_drive(state.clone(), job.id.clone()).await;
    }

    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupJob>, AppError> {
    let job = with_orchestrator(&state.orchestrator, move |o| o.status(&id)).await??;
    Ok(Json(job))
}

/// One advance per call; the caller keeps calling until the job is terminal.
async fn continue_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BackupJob>, AppError> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::Forbidden("Missing continuation token".into()))?;

    let job = with_orchestrator(&state.orchestrator, move |o| o.continue_job(&id, &token))
        .await??;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupJob>, AppError> {
    let job = with_orchestrator(&state.orchestrator, move |o| o.cancel(&id)).await??;
    tracing::info!(job_id = %job.id, "Backup job cancelled");
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::db::store::SqliteHistoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use backup_engine::{BackupOrchestrator, EngineConfig, JobPhase};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let site = dir.path().join("site");
        std::fs::create_dir_all(site.join("pages")).unwrap();
        std::fs::write(site.join("pages/index.html"), b"<h1>home</h1>").unwrap();

        let mut engine = EngineConfig::default();
        engine.paths.work_root = dir.path().join("work");
        engine.paths.archive_dir = dir.path().join("archives");
        engine.paths.status_dir = dir.path().join("status");
        engine.transfer.root = site;
        engine.memory.limit_mb = Some(64 * 1024);

        let pool = create_pool(&dir.path().join("runner.db").to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();
        let orchestrator = BackupOrchestrator::new(
            engine.clone(),
            Box::new(SqliteJobStore::new(pool.clone())),
            Box::new(SqliteHistoryStore::new(pool.clone())),
        );
        let config = AppConfig {
            port: 0,
            data_dir: dir.path().to_path_buf(),
            db_path: dir.path().join("runner.db"),
            log_level: "info".into(),
            site_database: None,
            engine,
        };
        let state = AppState::new(pool, config, orchestrator).with_auto_drive(false);
        crate::routes::create_router(Arc::new(state))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn create_files_job(app: &Router) -> serde_json::Value {
        let req = Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"kind":"files"}"#))
            .unwrap();
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        body
    }

    fn continue_request(id: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/jobs/{id}/continue"));
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let job = create_files_job(&app).await;
        let id = job["id"].as_str().unwrap();
        assert_eq!(job["phase"], "files");

        let req = Request::builder()
            .uri(format!("/api/jobs/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id);

        let req = Request::builder().uri("/api/jobs").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_database_job_without_database_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let req = Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"kind":"full"}"#))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let req = Request::builder()
            .uri("/api/jobs/does-not-exist")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_continue_checks_token_and_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let job = create_files_job(&app).await;
        let id = job["id"].as_str().unwrap().to_string();
        let token = job["continuation_token"].as_str().unwrap().to_string();

        let (status, _) = send(&app, continue_request(&id, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, continue_request(&id, Some("wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let mut last = serde_json::Value::Null;
        for _ in 0..100 {
            let (status, body) = send(&app, continue_request(&id, Some(&token))).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["phase"] == "completed" || last["phase"] == "failed" {
                break;
            }
        }
        assert_eq!(last["phase"], "completed");
        assert_eq!(last["progress"], 100);

        // Repeated triggers on a finished job are harmless.
        let (status, body) = send(&app, continue_request(&id, Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "completed");
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let job = create_files_job(&app).await;
        let id = job["id"].as_str().unwrap();

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/jobs/{id}/cancel"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let phase: JobPhase = serde_json::from_value(body["phase"].clone()).unwrap();
        assert_eq!(phase, JobPhase::Cancelled);
        assert!(!dir.path().join("work").join(id).exists());
    }
}
