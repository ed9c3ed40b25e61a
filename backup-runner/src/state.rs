use crate::config::AppConfig;
use crate::db::connection::DbPool;
use backup_engine::BackupOrchestrator;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    /// Serializes engine calls: only one advance runs at a time
    pub orchestrator: Arc<Mutex<BackupOrchestrator>>,
    /// Jobs currently being driven by a background task
    pub driving: Arc<tokio::sync::Mutex<HashSet<String>>>,
    /// Drive new jobs in the background right after creation
    pub auto_drive: bool,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, orchestrator: BackupOrchestrator) -> Self {
        Self {
            db,
            config,
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            driving: Arc::new(tokio::sync::Mutex::new(HashSet::new())),
            auto_drive: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_auto_drive(mut self, auto_drive: bool) -> Self {
        self.auto_drive = auto_drive;
        self
    }
}
