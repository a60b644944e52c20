use std::cmp::Ordering;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Local;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, info, warn};

use crate::paths::TIMESTAMP_FORMAT;
use crate::{Error, Result};

pub const MANUAL_SNAPSHOT_DIR: &str = "database_backups";
pub const AUTO_SNAPSHOT_DIR: &str = "auto_backups";
pub const EMERGENCY_SNAPSHOT_DIR: &str = "emergency_backups";
pub const AUTO_LABEL: &str = "auto";
pub const AUTO_SNAPSHOT_LIMIT: usize = 5;

const SNAPSHOT_PREFIX: &str = "saison_db_";
const SNAPSHOT_EXTENSION: &str = ".db";
const SIDE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified_epoch_ms: i64,
    pub is_automatic: bool,
}

impl LocalSnapshot {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Same-device copies of the app database.
///
/// Automatic snapshots live in their own pool capped at [`AUTO_SNAPSHOT_LIMIT`]; manual ones
/// are kept until deleted. Everything except [`SnapshotManager::auto_snapshot`] is blocking
/// file I/O.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    db_path: PathBuf,
    data_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(db_path: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn manual_dir(&self) -> PathBuf {
        self.data_dir.join(MANUAL_SNAPSHOT_DIR)
    }

    pub fn auto_dir(&self) -> PathBuf {
        self.data_dir.join(AUTO_SNAPSHOT_DIR)
    }

    pub fn emergency_dir(&self) -> PathBuf {
        self.data_dir.join(EMERGENCY_SNAPSHOT_DIR)
    }

    /// Copies the live database and its side files. `"auto"` snapshots prune their pool afterwards.
    pub fn create_snapshot(&self, label: &str) -> Result<LocalSnapshot> {
        validate_label(label)?;
        if !self.db_path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("database not found: {}", self.db_path.display()),
            )));
        }

        let is_automatic = label == AUTO_LABEL;
        let dir = if is_automatic {
            self.auto_dir()
        } else {
            self.manual_dir()
        };
        fs::create_dir_all(&dir)?;

        let dest = unique_snapshot_path(&dir, label);
        copy_with_side_files(&self.db_path, &dest).inspect_err(|e| {
            warn!(
                event = "snapshot.copy_failed",
                dest = %dest.display(),
                error = %e,
                "snapshot.copy_failed"
            )
        })?;
        let snapshot = describe(&dest, is_automatic)?;
        info!(
            event = "snapshot.create",
            path = %dest.display(),
            label,
            size_bytes = snapshot.size_bytes,
            "snapshot.create"
        );

        if is_automatic {
            self.prune_automatic()?;
        }
        Ok(snapshot)
    }

    /// Runs on every database open. A missing database is a skip, not an error.
    ///
    /// Goes through SQLite's `VACUUM INTO` on a connection of its own, so the copy is one
    /// consistent transaction even while other connections write.
    pub async fn auto_snapshot(&self) -> Result<Option<LocalSnapshot>> {
        if !tokio::fs::try_exists(&self.db_path).await? {
            debug!(
                event = "snapshot.auto.skip",
                reason = "no_database",
                db_path = %self.db_path.display(),
                "snapshot.auto.skip"
            );
            return Ok(None);
        }

        let dir = self.auto_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let dest = unique_snapshot_path(&dir, AUTO_LABEL);
        let Some(dest_str) = dest.to_str() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("snapshot path is not UTF-8: {}", dest.display()),
            )));
        };

        let mut conn = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(false)
            .connect()
            .await?;
        let vacuumed = sqlx::query("VACUUM INTO ?")
            .bind(dest_str)
            .execute(&mut conn)
            .await;
        conn.close().await?;
        vacuumed.inspect_err(|e| {
            warn!(
                event = "snapshot.vacuum_failed",
                dest = %dest.display(),
                error = %e,
                "snapshot.vacuum_failed"
            )
        })?;

        let snapshot = describe(&dest, true)?;
        info!(
            event = "snapshot.create",
            path = %dest.display(),
            label = AUTO_LABEL,
            size_bytes = snapshot.size_bytes,
            "snapshot.create"
        );
        self.prune_automatic()?;
        Ok(Some(snapshot))
    }

    /// Overwrites the live database from `snapshot`, after an emergency copy of the current file.
    ///
    /// Returns the emergency copy, if there was a live database to copy.
    pub fn restore_snapshot(&self, snapshot: &LocalSnapshot) -> Result<Option<PathBuf>> {
        if !snapshot.path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("snapshot not found: {}", snapshot.path.display()),
            )));
        }

        let emergency = if self.db_path.is_file() {
            let dir = self.emergency_dir();
            fs::create_dir_all(&dir)?;
            let dest = unique_snapshot_path(&dir, "emergency");
            copy_with_side_files(&self.db_path, &dest)?;
            debug!(
                event = "snapshot.emergency_copy",
                path = %dest.display(),
                "snapshot.emergency_copy"
            );
            Some(dest)
        } else {
            None
        };

        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&snapshot.path, &self.db_path)?;
        for suffix in SIDE_SUFFIXES {
            let src = side_path(&snapshot.path, suffix);
            let live = side_path(&self.db_path, suffix);
            if src.is_file() {
                fs::copy(&src, &live)?;
            } else {
                remove_if_exists(&live)?;
            }
        }

        info!(
            event = "snapshot.restore",
            from = %snapshot.path.display(),
            db_path = %self.db_path.display(),
            "snapshot.restore"
        );
        Ok(emergency)
    }

    /// Both pools, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<LocalSnapshot>> {
        let mut out = list_pool(&self.manual_dir(), false)?;
        out.extend(list_pool(&self.auto_dir(), true)?);
        out.sort_by(newest_first);
        Ok(out)
    }

    pub fn delete_snapshot(&self, snapshot: &LocalSnapshot) -> Result<()> {
        let parent = snapshot.path.parent().unwrap_or(Path::new(""));
        if parent != self.manual_dir() && parent != self.auto_dir() {
            return Err(Error::invalid(format!(
                "not a snapshot of this database: {}",
                snapshot.path.display()
            )));
        }
        remove_with_side_files(&snapshot.path)?;
        info!(
            event = "snapshot.delete",
            path = %snapshot.path.display(),
            "snapshot.delete"
        );
        Ok(())
    }

    fn prune_automatic(&self) -> Result<usize> {
        let mut pool = list_pool(&self.auto_dir(), true)?;
        pool.sort_by(newest_first);
        let mut removed = 0;
        for stale in pool.iter().skip(AUTO_SNAPSHOT_LIMIT) {
            match remove_with_side_files(&stale.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    event = "snapshot.prune_failed",
                    path = %stale.path.display(),
                    error = %e,
                    "snapshot.prune_failed"
                ),
            }
        }
        if removed > 0 {
            debug!(event = "snapshot.prune", removed, "snapshot.prune");
        }
        Ok(removed)
    }
}

fn validate_label(label: &str) -> Result<()> {
    let ok = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(Error::invalid(format!(
            "snapshot label must be [A-Za-z0-9_-]+ (got {label:?})"
        )));
    }
    Ok(())
}

/// `saison_db_<label>_<ts>.db`, with `_001`, `_002`... when that second is taken.
fn unique_snapshot_path(dir: &Path, label: &str) -> PathBuf {
    let stem = format!(
        "{SNAPSHOT_PREFIX}{label}_{}",
        Local::now().format(TIMESTAMP_FORMAT)
    );
    unique_path_for_stem(dir, &stem)
}

fn unique_path_for_stem(dir: &Path, stem: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{stem}{SNAPSHOT_EXTENSION}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n:03}{SNAPSHOT_EXTENSION}"));
        n += 1;
    }
    candidate
}

fn side_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn copy_with_side_files(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest)?;
    for suffix in SIDE_SUFFIXES {
        let side = side_path(src, suffix);
        if side.is_file() {
            fs::copy(&side, side_path(dest, suffix))?;
        }
    }
    Ok(())
}

fn remove_with_side_files(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    for suffix in SIDE_SUFFIXES {
        remove_if_exists(&side_path(path, suffix))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn list_pool(dir: &Path, is_automatic: bool) -> Result<Vec<LocalSnapshot>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_EXTENSION));
        if is_snapshot && path.is_file() {
            out.push(describe(&path, is_automatic)?);
        }
    }
    Ok(out)
}

fn describe(path: &Path, is_automatic: bool) -> Result<LocalSnapshot> {
    let meta = fs::metadata(path)?;
    let last_modified_epoch_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(LocalSnapshot {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        last_modified_epoch_ms,
        is_automatic,
    })
}

fn newest_first(a: &LocalSnapshot, b: &LocalSnapshot) -> Ordering {
    b.last_modified_epoch_ms
        .cmp(&a.last_modified_epoch_ms)
        .then_with(|| b.file_name().cmp(a.file_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> SnapshotManager {
        let db = dir.join("saison.db");
        fs::write(&db, b"live-v1").unwrap();
        SnapshotManager::new(db, dir)
    }

    #[test]
    fn labels_are_restricted() {
        let temp = tempfile::tempdir().unwrap();
        let mgr = manager(temp.path());
        for bad in ["", "../x", "a b", "x/y"] {
            assert!(matches!(
                mgr.create_snapshot(bad).unwrap_err(),
                Error::InvalidConfiguration { .. }
            ));
        }
        mgr.create_snapshot("pre-migration_v3").unwrap();
    }

    #[test]
    fn same_second_names_get_suffixes() {
        let temp = tempfile::tempdir().unwrap();
        let stem = "saison_db_manual_20240101_120000";

        let first = unique_path_for_stem(temp.path(), stem);
        assert!(first.ends_with("saison_db_manual_20240101_120000.db"));
        fs::write(&first, b"x").unwrap();

        let second = unique_path_for_stem(temp.path(), stem);
        assert!(second.ends_with("saison_db_manual_20240101_120000_001.db"));
        fs::write(&second, b"x").unwrap();

        let third = unique_path_for_stem(temp.path(), stem);
        assert!(third.ends_with("saison_db_manual_20240101_120000_002.db"));
    }

    #[test]
    fn side_files_travel_with_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let mgr = manager(temp.path());
        fs::write(side_path(mgr.db_path(), "-wal"), b"wal").unwrap();

        let snap = mgr.create_snapshot("manual").unwrap();
        assert!(!snap.is_automatic);
        assert_eq!(fs::read(side_path(&snap.path, "-wal")).unwrap(), b"wal");
        assert!(!side_path(&snap.path, "-shm").exists());

        mgr.delete_snapshot(&snap).unwrap();
        assert!(!snap.path.exists());
        assert!(!side_path(&snap.path, "-wal").exists());
    }

    #[tokio::test]
    async fn missing_database_fails_manual_and_skips_auto() {
        let temp = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(temp.path().join("absent.db"), temp.path());
        assert!(matches!(
            mgr.create_snapshot("manual").unwrap_err(),
            Error::Io(_)
        ));
        assert_eq!(mgr.auto_snapshot().await.unwrap(), None);
        assert!(mgr.list_snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_snapshot_is_a_standalone_database() {
        let temp = tempfile::tempdir().unwrap();
        let db = temp.path().join("saison.db");
        let mut conn = SqliteConnectOptions::new()
            .filename(&db)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .connect()
            .await
            .unwrap();
        sqlx::query("CREATE TABLE notes (body TEXT NOT NULL)")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO notes (body) VALUES ('kept')")
            .execute(&mut conn)
            .await
            .unwrap();

        let mgr = SnapshotManager::new(&db, temp.path());
        let snap = mgr.auto_snapshot().await.unwrap().unwrap();
        conn.close().await.unwrap();

        assert!(snap.is_automatic);
        assert!(!side_path(&snap.path, "-wal").exists());
        let mut copy = SqliteConnectOptions::new()
            .filename(&snap.path)
            .connect()
            .await
            .unwrap();
        let body: String = sqlx::query_scalar("SELECT body FROM notes")
            .fetch_one(&mut copy)
            .await
            .unwrap();
        assert_eq!(body, "kept");
    }

    #[test]
    fn restore_drops_stale_side_files() {
        let temp = tempfile::tempdir().unwrap();
        let mgr = manager(temp.path());
        let snap = mgr.create_snapshot("manual").unwrap();

        fs::write(mgr.db_path(), b"live-v2").unwrap();
        fs::write(side_path(mgr.db_path(), "-wal"), b"stale").unwrap();

        let emergency = mgr.restore_snapshot(&snap).unwrap().unwrap();
        assert_eq!(fs::read(mgr.db_path()).unwrap(), b"live-v1");
        assert!(!side_path(mgr.db_path(), "-wal").exists());
        assert_eq!(fs::read(&emergency).unwrap(), b"live-v2");
        assert_eq!(fs::read(side_path(&emergency, "-wal")).unwrap(), b"stale");
    }

    #[test]
    fn delete_refuses_foreign_files() {
        let temp = tempfile::tempdir().unwrap();
        let mgr = manager(temp.path());
        let foreign = LocalSnapshot {
            path: mgr.db_path().to_path_buf(),
            size_bytes: 0,
            last_modified_epoch_ms: 0,
            is_automatic: false,
        };
        assert!(matches!(
            mgr.delete_snapshot(&foreign).unwrap_err(),
            Error::InvalidConfiguration { .. }
        ));
        assert!(mgr.db_path().exists());
    }
}
