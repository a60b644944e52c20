use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveCodec, ZipArchiveCodec, encode_content};
use crate::config::ConfigStore;
use crate::model::{BackupArchiveContent, BackupPreferences, Credentials};
use crate::paths::{
    backup_directory, backup_file_name, backup_file_path, normalize_url, probe_file_path,
};
use crate::storage::RemoteFileClient;
use crate::{Error, Result};

/// Use-case layer over the config store, a remote file client and an archive codec.
///
/// Remote operations for the same `<url>|<username>` identity run one at a time.
pub struct BackupService<R, C = ZipArchiveCodec> {
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) remote: R,
    pub(crate) codec: Arc<C>,
    pub(crate) temp_dir: PathBuf,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Resolved remote target for one operation.
pub(crate) struct Session {
    pub(crate) base_url: String,
    pub(crate) creds: Credentials,
    _guard: OwnedMutexGuard<()>,
}

impl<R: RemoteFileClient> BackupService<R, ZipArchiveCodec> {
    pub fn new(store: Arc<ConfigStore>, remote: R, temp_dir: impl Into<PathBuf>) -> Self {
        Self::with_codec(store, remote, ZipArchiveCodec, temp_dir)
    }
}

impl<R: RemoteFileClient, C: ArchiveCodec + 'static> BackupService<R, C> {
    pub fn with_codec(
        store: Arc<ConfigStore>,
        remote: R,
        codec: C,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            remote,
            codec: Arc::new(codec),
            temp_dir: temp_dir.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn configure(&self, url: &str, username: &str, password: &str) -> Result<()> {
        let url = normalize_url(url)?;
        if username.trim().is_empty() {
            return Err(Error::invalid("username must not be blank"));
        }
        self.store.save_remote_config(&url, username, password)?;
        info!(
            event = "backup.configure",
            url = %url,
            username = %username,
            password_updated = !password.trim().is_empty(),
            "backup.configure"
        );
        Ok(())
    }

    /// Reachability, then the backup directory, then a probe write; stops at the first failure.
    pub async fn test_connection(&self) -> Result<()> {
        let session = self.session().await?;
        let provider = self.remote.provider();
        debug!(event = "backup.test.start", provider, url = %session.base_url, "backup.test.start");

        let reachable = self
            .remote
            .check_connection(&session.base_url, &session.creds)
            .await
            .map_err(|e| with_stage("reachability check", e))?;
        if !reachable {
            return Err(Error::Connectivity {
                message: format!("reachability check: server rejected {}", session.base_url),
            });
        }

        let dir = backup_directory(&session.base_url);
        let created = self
            .remote
            .create_directory(&dir, &session.creds)
            .await
            .map_err(|e| with_stage("backup directory", e))?;
        if !created {
            return Err(Error::Permission {
                message: format!("backup directory: cannot create {dir}"),
            });
        }

        self.remote
            .test_write_permission(&probe_file_path(&session.base_url), &session.creds)
            .await
            .map_err(|e| with_stage("write permission", e))?;

        info!(event = "backup.test.ok", provider, url = %session.base_url, "backup.test.ok");
        Ok(())
    }

    /// Packs the enabled categories of `content`, uploads the archive and returns its file name.
    pub async fn create_and_upload_backup(
        &self,
        prefs: &BackupPreferences,
        content: &BackupArchiveContent,
    ) -> Result<String> {
        if !prefs.any_enabled() {
            return Err(Error::NoCategorySelected);
        }
        let session = self.session().await?;

        let now = Local::now();
        let file_name = backup_file_name(&now);
        let entries = encode_content(prefs, content, now.with_timezone(&Utc))?;
        let temp_path = self
            .temp_path(&format!("backup_{}.zip", uuid::Uuid::new_v4()))
            .await?;

        debug!(
            event = "backup.create.start",
            file_name = %file_name,
            categories = entries.len() - 1,
            "backup.create.start"
        );

        let dest = temp_path.clone();
        let packed = self
            .run_codec(move |codec| codec.pack(&entries, &dest))
            .await;
        let outcome = match packed {
            Ok(()) => self.upload(&session, &file_name, &temp_path).await,
            Err(e) => Err(e),
        };
        remove_temp_file(&temp_path).await;
        outcome?;

        // The archive is already remote; bookkeeping failures are only logged.
        if let Err(e) = self
            .store
            .update_last_backup_time(Utc::now().timestamp_millis())
        {
            warn!(
                event = "backup.last_time.write_failed",
                file_name = %file_name,
                error = %e,
                "backup.last_time.write_failed"
            );
        }
        info!(
            event = "backup.upload.finish",
            provider = self.remote.provider(),
            file_name = %file_name,
            "backup.upload.finish"
        );
        Ok(file_name)
    }

    /// Backs up with the stored preferences when the auto-backup policy says it is due.
    pub async fn run_auto_backup_if_due(
        &self,
        content: &BackupArchiveContent,
    ) -> Result<Option<String>> {
        if !self.store.should_auto_backup()? {
            debug!(event = "backup.auto.skip", reason = "not_due", "backup.auto.skip");
            return Ok(None);
        }
        if !self.store.is_configured()? {
            debug!(event = "backup.auto.skip", reason = "not_configured", "backup.auto.skip");
            return Ok(None);
        }
        let prefs = self.store.get_preferences()?;
        let name = self.create_and_upload_backup(&prefs, content).await?;
        Ok(Some(name))
    }

    async fn upload(&self, session: &Session, file_name: &str, local: &Path) -> Result<()> {
        let dir = backup_directory(&session.base_url);
        match self.remote.create_directory(&dir, &session.creds).await {
            Ok(true) => {}
            Ok(false) => warn!(event = "backup.mkdir.failed", dir = %dir, "backup.mkdir.failed"),
            Err(e) => warn!(
                event = "backup.mkdir.failed",
                dir = %dir,
                error = %e,
                "backup.mkdir.failed"
            ),
        }

        let remote_path = backup_file_path(&session.base_url, file_name);
        self.remote
            .upload_file(&remote_path, &session.creds, local)
            .await
            .map_err(|e| with_stage("upload", e))
    }

    /// Resolves credentials and takes the single-flight guard for their identity.
    pub(crate) async fn session(&self) -> Result<Session> {
        let (base_url, creds) = self.store.credentials()?.ok_or(Error::NotConfigured)?;
        let identity = format!("{base_url}|{}", creds.username);
        let lock = {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(identity).or_default())
        };
        let guard = lock.lock_owned().await;
        Ok(Session {
            base_url,
            creds,
            _guard: guard,
        })
    }

    pub(crate) async fn temp_path(&self, file_name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(self.temp_dir.join(file_name))
    }

    /// Codec work is synchronous file I/O; it runs on the blocking pool.
    pub(crate) async fn run_codec<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T> + Send + 'static,
    {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || f(&codec))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("codec task failed: {e}"))))?
    }
}

/// Prefixes the failing stage while keeping the error kind.
pub(crate) fn with_stage(stage: &str, e: Error) -> Error {
    match e {
        Error::Connectivity { message } => Error::Connectivity {
            message: format!("{stage}: {message}"),
        },
        Error::Permission { message } => Error::Permission {
            message: format!("{stage}: {message}"),
        },
        Error::Transfer { message } => Error::Transfer {
            message: format!("{stage}: {message}"),
        },
        Error::Io(io) => Error::Transfer {
            message: format!("{stage}: {io}"),
        },
        other => other,
    }
}

pub(crate) async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            event = "backup.temp.cleanup_failed",
            path = %path.display(),
            error = %e,
            "backup.temp.cleanup_failed"
        ),
    }
}
