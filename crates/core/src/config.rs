use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{AutoBackupPolicy, BackupCategory, BackupPreferences, Credentials, RemoteConfig};
use crate::secrets::{REMOTE_PASSWORD_KEY, SecretsStore, write_atomic_private};
use crate::{Error, Result};

pub const CONFIG_SCHEMA_VERSION: u32 = 2;
/// The flat key/value layout written by releases before the versioned store existed.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

pub const CONFIG_FILE_NAME: &str = "backup_config.toml";
pub const LEGACY_FILE_NAME: &str = "webdav_config.toml";
/// Written once the legacy store has been imported; survives [`ConfigStore::clear_all`].
pub const LEGACY_IMPORTED_MARKER: &str = ".legacy_imported";

const LEGACY_KEY_URL: &str = "webdav_url";
const LEGACY_KEY_USERNAME: &str = "webdav_username";
const LEGACY_KEY_PASSWORD: &str = "webdav_password";
const LEGACY_KEY_AUTO_BACKUP: &str = "auto_backup_enabled";
const LEGACY_KEY_LAST_BACKUP: &str = "last_backup_time";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredConfig {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    migrated_from_legacy: bool,
    #[serde(default)]
    remote: RemoteSection,
    #[serde(default)]
    preferences: BTreeMap<String, bool>,
    #[serde(default)]
    auto_backup: AutoBackupSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RemoteSection {
    url: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AutoBackupSection {
    #[serde(default)]
    enabled: bool,
    last_backup_epoch_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Store already at the current version (or migrated before); nothing written.
    AlreadyCurrent,
    /// Nothing to import (no legacy store, or it was imported before a wipe); only the version
    /// marker was written.
    Stamped,
    Migrated { keys_copied: usize },
    /// Reported by the composition root; the store is left as it was.
    Failed { message: String },
}

/// Durable store for remote credentials, category flags and auto-backup bookkeeping.
///
/// Every call reads the file and every mutation rewrites it atomically; nothing is cached
/// between calls. The password lives in the encrypted [`SecretsStore`], never in the TOML.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    secrets: SecretsStore,
    legacy_marker: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn open(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir).inspect_err(|e| {
            warn!(
                event = "config.dir_create_failed",
                path = %config_dir.display(),
                error = %e,
                "config.dir_create_failed"
            )
        })?;
        let store = Self {
            path: config_dir.join(CONFIG_FILE_NAME),
            secrets: SecretsStore::in_dir(config_dir),
            legacy_marker: config_dir.join(LEGACY_IMPORTED_MARKER),
            write_lock: Mutex::new(()),
        };
        store.load()?;
        debug!(
            event = "config.open",
            path = %store.path.display(),
            "config.open"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save_remote_config(&self, url: &str, username: &str, password: &str) -> Result<()> {
        let _guard = self.lock();
        // A blank password means "keep the stored one".
        if !password.trim().is_empty() {
            self.secrets.set(REMOTE_PASSWORD_KEY, password)?;
        }
        let mut cfg = self.load()?;
        cfg.remote.url = Some(url.to_string());
        cfg.remote.username = Some(username.to_string());
        self.save(&cfg)
    }

    pub fn get_remote_config(&self) -> Result<Option<RemoteConfig>> {
        let cfg = self.load()?;
        match (cfg.remote.url, cfg.remote.username) {
            (Some(url), Some(username)) => Ok(Some(RemoteConfig { url, username })),
            _ => Ok(None),
        }
    }

    /// Stricter than [`Self::get_remote_config`]: a non-blank password must be stored too.
    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.credentials()?.is_some())
    }

    pub(crate) fn credentials(&self) -> Result<Option<(String, Credentials)>> {
        let cfg = self.load()?;
        let (Some(url), Some(username)) = (cfg.remote.url, cfg.remote.username) else {
            return Ok(None);
        };
        match self.password()? {
            Some(password) => Ok(Some((url, Credentials::new(username, password)))),
            None => Ok(None),
        }
    }

    fn password(&self) -> Result<Option<String>> {
        Ok(self
            .secrets
            .get(REMOTE_PASSWORD_KEY)?
            .filter(|p| !p.trim().is_empty()))
    }

    pub fn save_preferences(&self, prefs: &BackupPreferences) -> Result<()> {
        self.update(|cfg| {
            for c in BackupCategory::ALL {
                cfg.preferences.insert(c.key().to_string(), prefs.is_enabled(c));
            }
        })
    }

    /// Flags that were never written default to enabled.
    pub fn get_preferences(&self) -> Result<BackupPreferences> {
        let cfg = self.load()?;
        let mut prefs = BackupPreferences::default();
        for c in BackupCategory::ALL {
            if let Some(enabled) = cfg.preferences.get(c.key()) {
                prefs.set(c, *enabled);
            }
        }
        Ok(prefs)
    }

    pub fn set_auto_backup_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|cfg| cfg.auto_backup.enabled = enabled)
    }

    pub fn is_auto_backup_enabled(&self) -> Result<bool> {
        Ok(self.load()?.auto_backup.enabled)
    }

    pub fn update_last_backup_time(&self, epoch_ms: i64) -> Result<()> {
        self.update(|cfg| cfg.auto_backup.last_backup_epoch_ms = Some(epoch_ms))
    }

    pub fn get_last_backup_time(&self) -> Result<Option<i64>> {
        Ok(self.load()?.auto_backup.last_backup_epoch_ms)
    }

    pub fn auto_backup_policy(&self) -> Result<AutoBackupPolicy> {
        let cfg = self.load()?;
        Ok(AutoBackupPolicy {
            enabled: cfg.auto_backup.enabled,
            last_backup_epoch_millis: cfg.auto_backup.last_backup_epoch_ms,
        })
    }

    pub fn should_auto_backup(&self) -> Result<bool> {
        Ok(self.auto_backup_policy()?.should_run())
    }

    pub fn should_auto_backup_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<bool> {
        Ok(self.auto_backup_policy()?.should_run_at(now))
    }

    pub fn get_config_version(&self) -> Result<u32> {
        Ok(self.load()?.version)
    }

    pub fn is_migrated_from_legacy(&self) -> Result<bool> {
        Ok(self.load()?.migrated_from_legacy)
    }

    /// Wipes the whole store, version marker and password included.
    ///
    /// The legacy store is not touched, and a legacy store that was imported once is not
    /// imported again by a later [`Self::migrate_from_legacy`].
    pub fn clear_all(&self) -> Result<()> {
        let _guard = self.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.secrets.clear()?;
        info!(event = "config.cleared", path = %self.path.display(), "config.cleared");
        Ok(())
    }

    /// One-time import of the flat legacy store.
    ///
    /// Copies every known legacy key, then stamps the version and the migrated flag in the
    /// same atomic write. A store that is current (or already migrated) is left untouched.
    pub fn migrate_from_legacy(&self, legacy: &LegacyStore) -> Result<MigrationOutcome> {
        let _guard = self.lock();
        let mut cfg = self.load().map_err(|e| Error::Migration {
            message: format!("read current store: {e}"),
        })?;

        if cfg.version >= CONFIG_SCHEMA_VERSION || cfg.migrated_from_legacy {
            return Ok(MigrationOutcome::AlreadyCurrent);
        }

        let already_imported = self.legacy_marker.is_file();
        let table = if already_imported {
            debug!(
                event = "config.migrate.skip",
                reason = "imported_before",
                "config.migrate.skip"
            );
            None
        } else {
            legacy.read()?
        };
        let Some(table) = table else {
            cfg.version = CONFIG_SCHEMA_VERSION;
            self.save(&cfg).map_err(|e| Error::Migration {
                message: format!("stamp version: {e}"),
            })?;
            info!(
                event = "config.migrate.stamped",
                version = CONFIG_SCHEMA_VERSION,
                "config.migrate.stamped"
            );
            return Ok(MigrationOutcome::Stamped);
        };

        info!(
            event = "config.migrate.start",
            from = LEGACY_SCHEMA_VERSION,
            to = CONFIG_SCHEMA_VERSION,
            legacy_path = %legacy.path().display(),
            "config.migrate.start"
        );

        let mut keys_copied = 0usize;
        if let Some(v) = legacy_str(&table, LEGACY_KEY_URL)? {
            cfg.remote.url = Some(v);
            keys_copied += 1;
        }
        if let Some(v) = legacy_str(&table, LEGACY_KEY_USERNAME)? {
            cfg.remote.username = Some(v);
            keys_copied += 1;
        }
        let password = legacy_str(&table, LEGACY_KEY_PASSWORD)?;
        if password.is_some() {
            keys_copied += 1;
        }
        for c in BackupCategory::ALL {
            if let Some(v) = legacy_bool(&table, &legacy_category_key(c))? {
                cfg.preferences.insert(c.key().to_string(), v);
                keys_copied += 1;
            }
        }
        if let Some(v) = legacy_bool(&table, LEGACY_KEY_AUTO_BACKUP)? {
            cfg.auto_backup.enabled = v;
            keys_copied += 1;
        }
        if let Some(v) = legacy_int(&table, LEGACY_KEY_LAST_BACKUP)? {
            cfg.auto_backup.last_backup_epoch_ms = Some(v);
            keys_copied += 1;
        }

        if let Some(password) = password.filter(|p| !p.trim().is_empty()) {
            self.secrets
                .set(REMOTE_PASSWORD_KEY, &password)
                .map_err(|e| Error::Migration {
                    message: format!("store legacy password: {e}"),
                })?;
        }
        cfg.version = CONFIG_SCHEMA_VERSION;
        cfg.migrated_from_legacy = true;
        self.save(&cfg).map_err(|e| Error::Migration {
            message: format!("write migrated store: {e}"),
        })?;
        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(e) = write_atomic_private(&self.legacy_marker, stamp.as_bytes()) {
            warn!(
                event = "config.migrate.marker_failed",
                path = %self.legacy_marker.display(),
                error = %e,
                "config.migrate.marker_failed"
            );
        }

        info!(
            event = "config.migrate.finish",
            keys_copied,
            version = CONFIG_SCHEMA_VERSION,
            "config.migrate.finish"
        );
        Ok(MigrationOutcome::Migrated { keys_copied })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (); a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut StoredConfig)) -> Result<()> {
        let _guard = self.lock();
        let mut cfg = self.load()?;
        f(&mut cfg);
        self.save(&cfg)
    }

    fn load(&self) -> Result<StoredConfig> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredConfig::default());
            }
            Err(e) => {
                warn!(
                    event = "config.read_failed",
                    path = %self.path.display(),
                    error = %e,
                    "config.read_failed"
                );
                return Err(e.into());
            }
        };
        toml::from_str(&text).map_err(|e| Error::invalid(format!("config invalid: {e}")))
    }

    fn save(&self, cfg: &StoredConfig) -> Result<()> {
        let text = toml::to_string(cfg)
            .map_err(|e| Error::invalid(format!("config encode failed: {e}")))?;
        write_atomic_private(&self.path, text.as_bytes()).map_err(|e| {
            warn!(
                event = "config.write_failed",
                path = %self.path.display(),
                error = %e,
                "config.write_failed"
            );
            Error::Io(e)
        })
    }
}

/// Read-only view of the flat store used before schema versioning.
#[derive(Debug, Clone)]
pub struct LegacyStore {
    path: PathBuf,
}

impl LegacyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join(LEGACY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn read(&self) -> Result<Option<toml::Table>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Migration {
                    message: format!("legacy store read failed: {e}"),
                });
            }
        };
        let table = text.parse::<toml::Table>().map_err(|e| Error::Migration {
            message: format!("legacy store invalid: {e}"),
        })?;
        Ok(Some(table))
    }
}

pub fn legacy_category_key(category: BackupCategory) -> String {
    format!("backup_{}", category.key())
}

fn legacy_str(table: &toml::Table, key: &str) -> Result<Option<String>> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(legacy_type_error(key, "string", other)),
    }
}

fn legacy_bool(table: &toml::Table, key: &str) -> Result<Option<bool>> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
        Some(other) => Err(legacy_type_error(key, "boolean", other)),
    }
}

fn legacy_int(table: &toml::Table, key: &str) -> Result<Option<i64>> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(i)) => Ok(Some(*i)),
        Some(other) => Err(legacy_type_error(key, "integer", other)),
    }
}

fn legacy_type_error(key: &str, expected: &str, got: &toml::Value) -> Error {
    Error::Migration {
        message: format!(
            "legacy key {key} must be a {expected} (got {})",
            got.type_str()
        ),
    }
}
