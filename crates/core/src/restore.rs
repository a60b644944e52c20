use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveCodec, ArchiveManifest, decode_content};
use crate::backup::{BackupService, Session, remove_temp_file, with_stage};
use crate::model::{BackupArchiveContent, RemoteBackupFile};
use crate::paths::{backup_directory, is_backup_file_name};
use crate::storage::{RemoteEntry, RemoteFileClient};
use crate::{Error, Result};

impl<R: RemoteFileClient, C: ArchiveCodec + 'static> BackupService<R, C> {
    /// Remote backup archives, newest first.
    pub async fn list_backups(&self) -> Result<Vec<RemoteBackupFile>> {
        let session = self.session().await?;
        let dir = backup_directory(&session.base_url);
        let entries = self
            .remote
            .list_files(&dir, &session.creds)
            .await
            .map_err(|e| with_stage("list backups", e))?;

        let mut files: Vec<RemoteBackupFile> = entries
            .into_iter()
            .filter(|e| is_backup_file_name(&e.name))
            .map(to_backup_file)
            .collect();
        files.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.name.cmp(&a.name))
        });

        debug!(
            event = "backup.list",
            dir = %dir,
            count = files.len(),
            "backup.list"
        );
        Ok(files)
    }

    /// Downloads and unpacks one archive. Categories the archive lacks come back empty.
    pub async fn download_and_restore_backup(
        &self,
        file: &RemoteBackupFile,
    ) -> Result<BackupArchiveContent> {
        let session = self.session().await?;
        let temp_path = self
            .temp_path(&format!("restore_{}.zip", uuid::Uuid::new_v4()))
            .await?;

        debug!(
            event = "restore.download.start",
            file_name = %file.name,
            size_bytes = file.size_bytes,
            "restore.download.start"
        );

        let outcome = self.fetch_and_decode(&session, file, &temp_path).await;
        remove_temp_file(&temp_path).await;

        let (manifest, content) = outcome.inspect_err(|e| {
            warn!(
                event = "restore.failed",
                file_name = %file.name,
                error = %e,
                "restore.failed"
            )
        })?;
        info!(
            event = "restore.finish",
            file_name = %file.name,
            has_manifest = manifest.is_some(),
            created_at = manifest.as_ref().map(|m| m.created_at.as_str()).unwrap_or(""),
            "restore.finish"
        );
        Ok(content)
    }

    async fn fetch_and_decode(
        &self,
        session: &Session,
        file: &RemoteBackupFile,
        temp_path: &Path,
    ) -> Result<(Option<ArchiveManifest>, BackupArchiveContent)> {
        let found = self
            .remote
            .download_file(&file.locator, &session.creds, temp_path)
            .await
            .map_err(|e| with_stage("download", e))?;
        if !found {
            return Err(Error::transfer(format!("download: {} not found", file.name)));
        }
        let archive = temp_path.to_path_buf();
        let entries = self.run_codec(move |codec| codec.unpack(&archive)).await?;
        decode_content(&entries)
    }

    pub async fn delete_backup(&self, file: &RemoteBackupFile) -> Result<()> {
        let session = self.session().await?;
        let deleted = self
            .remote
            .delete_file(&file.locator, &session.creds)
            .await
            .map_err(|e| with_stage("delete backup", e))?;
        if !deleted {
            return Err(Error::transfer(format!(
                "delete backup: server refused {}",
                file.name
            )));
        }
        info!(event = "backup.delete", file_name = %file.name, "backup.delete");
        Ok(())
    }
}

fn to_backup_file(entry: RemoteEntry) -> RemoteBackupFile {
    RemoteBackupFile {
        last_modified: DateTime::<Utc>::from_timestamp_millis(entry.modified_epoch_ms)
            .unwrap_or_default(),
        name: entry.name,
        size_bytes: entry.size,
        locator: entry.locator,
    }
}
