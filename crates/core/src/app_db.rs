use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, error};

use crate::Result;
use crate::snapshot::SnapshotManager;
use crate::tasks::BackgroundTasks;

const MAX_CONNECTIONS: u32 = 4;

/// Opens the app database and schedules an automatic snapshot on `tasks`.
///
/// The snapshot runs detached on its own connection; its failure is logged and never fails
/// the open.
pub async fn open_app_db(
    path: &Path,
    snapshots: &SnapshotManager,
    tasks: &BackgroundTasks,
) -> Result<SqlitePool> {
    debug!(
        event = "sqlite.open",
        db_path = %path.display(),
        create_if_missing = true,
        "sqlite.open"
    );
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| {
            error!(
                event = "io.sqlite.connect_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.connect_failed"
            );
            e
        })?;

    let snapshots = snapshots.clone();
    let scheduled = tasks.spawn("snapshot.auto", async move { snapshots.auto_snapshot().await });
    debug!(
        event = "snapshot.auto.scheduled",
        scheduled,
        "snapshot.auto.scheduled"
    );
    Ok(pool)
}
