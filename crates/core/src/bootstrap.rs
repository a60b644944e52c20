use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{error, info};

use crate::Result;
use crate::app_db::open_app_db;
use crate::backup::BackupService;
use crate::config::{ConfigStore, LegacyStore, MigrationOutcome};
use crate::snapshot::SnapshotManager;
use crate::storage::RemoteFileClient;
use crate::tasks::BackgroundTasks;

pub const CONFIG_DIR_ENV: &str = "SAISON_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "SAISON_DATA_DIR";
pub const APP_DB_FILE_NAME: &str = "saison.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Scratch space for archives in flight.
    pub temp_dir: PathBuf,
}

impl BackupPaths {
    /// `<root>/config` and `<root>/data`.
    pub fn under(root: &Path) -> Self {
        Self::with_dirs(root.join("config"), root.join("data"))
    }

    pub fn with_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            db_path: data_dir.join(APP_DB_FILE_NAME),
            temp_dir: data_dir.join("tmp"),
            config_dir,
            data_dir,
        }
    }

    /// Like [`Self::under`], with `SAISON_CONFIG_DIR` / `SAISON_DATA_DIR` taking precedence.
    pub fn from_env(default_root: &Path) -> Self {
        Self::from_overrides(
            default_root,
            std::env::var_os(CONFIG_DIR_ENV),
            std::env::var_os(DATA_DIR_ENV),
        )
    }

    fn from_overrides(
        default_root: &Path,
        config_dir: Option<OsString>,
        data_dir: Option<OsString>,
    ) -> Self {
        let pick = |v: Option<OsString>, fallback: &str| {
            v.filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| default_root.join(fallback))
        };
        Self::with_dirs(pick(config_dir, "config"), pick(data_dir, "data"))
    }
}

/// Everything the host application wires up once at startup.
#[derive(Debug)]
pub struct Bootstrapped {
    pub paths: BackupPaths,
    pub store: Arc<ConfigStore>,
    pub migration: MigrationOutcome,
    pub snapshots: SnapshotManager,
    pub tasks: BackgroundTasks,
}

impl Bootstrapped {
    pub fn backup_service<R: RemoteFileClient>(&self, remote: R) -> BackupService<R> {
        BackupService::new(Arc::clone(&self.store), remote, self.paths.temp_dir.clone())
    }

    pub async fn open_app_db(&self) -> Result<SqlitePool> {
        open_app_db(&self.paths.db_path, &self.snapshots, &self.tasks).await
    }
}

/// Opens the config store and runs the legacy migration as an explicit, reported step.
///
/// A failed migration does not fail startup; it is logged and returned as
/// [`MigrationOutcome::Failed`] with the store left as it was.
pub fn init(paths: BackupPaths) -> Result<Bootstrapped> {
    let store = ConfigStore::open(&paths.config_dir)?;
    let migration = run_migration(&store, &LegacyStore::in_dir(&paths.config_dir));
    let snapshots = SnapshotManager::new(&paths.db_path, &paths.data_dir);

    info!(
        event = "bootstrap.ready",
        config_dir = %paths.config_dir.display(),
        data_dir = %paths.data_dir.display(),
        "bootstrap.ready"
    );
    Ok(Bootstrapped {
        paths,
        store: Arc::new(store),
        migration,
        snapshots,
        tasks: BackgroundTasks::new(),
    })
}

pub fn run_migration(store: &ConfigStore, legacy: &LegacyStore) -> MigrationOutcome {
    match store.migrate_from_legacy(legacy) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                event = "config.migrate.failed",
                legacy_path = %legacy.path().display(),
                error = %e,
                "config.migrate.failed"
            );
            MigrationOutcome::Failed {
                message: e.to_string(),
            }
        }
    }
}
