pub mod app_db;
pub mod archive;
mod backup;
pub mod bootstrap;
pub mod config;
mod error;
pub mod logging;
pub mod model;
pub mod paths;
mod restore;
pub mod secrets;
pub mod snapshot;
pub mod storage;
pub mod tasks;

pub use archive::{ArchiveCodec, ArchiveManifest, ZipArchiveCodec};
pub use backup::BackupService;
pub use bootstrap::{BackupPaths, Bootstrapped};
pub use config::{ConfigStore, LegacyStore, MigrationOutcome};
pub use error::{Error, ErrorKind, Result};
pub use model::{
    AutoBackupPolicy, BackupArchiveContent, BackupCategory, BackupPreferences, Credentials,
    RemoteBackupFile, RemoteConfig,
};
pub use secrets::SecretsStore;
pub use snapshot::{LocalSnapshot, SnapshotManager};
pub use storage::{InMemoryRemote, RemoteEntry, RemoteFileClient, WebDavClient};
pub use tasks::BackgroundTasks;
