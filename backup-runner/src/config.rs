use backup_engine::EngineConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Job and history database of the runner itself
    pub db_path: PathBuf,
    pub log_level: String,
    /// SQLite file of the site whose database is backed up
    pub site_database: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Read `.env`, the engine TOML named by `BACKUP_CONFIG` (or `config_file`)
    /// and the environment overrides.
    pub fn from_env(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("BACKUP_DATA_DIR").unwrap_or_else(|_| "/var/lib/site-backup".into()),
        );

        let config_file = config_file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("BACKUP_CONFIG").ok().map(PathBuf::from));
        let mut engine = match &config_file {
            Some(path) => EngineConfig::from_file(path)?,
            None => {
                let mut engine = EngineConfig::default();
                engine.paths.work_root = data_dir.join("work");
                engine.paths.archive_dir = data_dir.join("archives");
                engine.paths.status_dir = data_dir.join("status");
                engine
            }
        };
        if let Ok(root) = std::env::var("BACKUP_SITE_ROOT") {
            engine.transfer.root = PathBuf::from(root);
        }

        Ok(Self {
            port: std::env::var("BACKUP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3080),
            db_path: data_dir.join("site-backup.db"),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| engine.log.level.clone()),
            site_database: std::env::var("BACKUP_DATABASE").ok().map(PathBuf::from),
            engine,
        })
    }
}
