use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::model::Credentials;
use crate::{Error, Result};

pub mod webdav;

pub use webdav::WebDavClient;

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub modified_epoch_ms: i64,
    /// Absolute address accepted by `download_file` / `delete_file`.
    pub locator: String,
}

/// File operations against a remote store addressed by absolute URLs.
///
/// Implementations own their timeouts and retries; callers only see the final outcome.
pub trait RemoteFileClient: Send + Sync {
    fn provider(&self) -> &'static str;

    fn check_connection<'a>(
        &'a self,
        base_url: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool>;

    /// True when the directory was created or already exists.
    fn create_directory<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool>;

    fn list_files<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, Vec<RemoteEntry>>;

    fn upload_file<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
        local_file: &'a Path,
    ) -> RemoteFuture<'a, ()>;

    fn download_file<'a>(
        &'a self,
        locator: &'a str,
        creds: &'a Credentials,
        dest: &'a Path,
    ) -> RemoteFuture<'a, bool>;

    fn delete_file<'a>(&'a self, locator: &'a str, creds: &'a Credentials)
    -> RemoteFuture<'a, bool>;

    /// Writes then removes a throwaway file at `path`.
    fn test_write_permission<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, ()>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    modified_epoch_ms: i64,
}

#[derive(Debug, Default)]
struct InMemoryState {
    directories: Vec<String>,
    objects: BTreeMap<String, StoredObject>,
}

/// Remote store kept in process memory. Paths are used verbatim as object keys.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    pub calls: AtomicUsize,
    pub uploaded: AtomicUsize,
    inner: Mutex<InMemoryState>,
    failures: Mutex<FailurePlan>,
}

#[derive(Debug, Default, Clone)]
pub struct FailurePlan {
    pub unreachable: bool,
    pub mkdir_fails: bool,
    pub upload_fails: bool,
    pub probe_fails: bool,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failures(&self, plan: FailurePlan) {
        *self.failures.lock().await = plan;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn insert(&self, path: &str, bytes: Vec<u8>, modified_epoch_ms: i64) {
        self.inner.lock().await.objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                modified_epoch_ms,
            },
        );
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .objects
            .get(path)
            .map(|o| o.bytes.clone())
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    pub async fn has_directory(&self, path: &str) -> bool {
        self.inner
            .lock()
            .await
            .directories
            .iter()
            .any(|d| d == path)
    }

    async fn plan(&self) -> FailurePlan {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.failures.lock().await.clone()
    }
}

impl RemoteFileClient for InMemoryRemote {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn check_connection<'a>(
        &'a self,
        _base_url: &'a str,
        _creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move { Ok(!self.plan().await.unreachable) })
    }

    fn create_directory<'a>(
        &'a self,
        path: &'a str,
        _creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            if self.plan().await.mkdir_fails {
                return Ok(false);
            }
            let mut inner = self.inner.lock().await;
            if !inner.directories.iter().any(|d| d == path) {
                inner.directories.push(path.to_string());
            }
            Ok(true)
        })
    }

    fn list_files<'a>(
        &'a self,
        path: &'a str,
        _creds: &'a Credentials,
    ) -> RemoteFuture<'a, Vec<RemoteEntry>> {
        Box::pin(async move {
            if self.plan().await.unreachable {
                return Err(Error::Connectivity {
                    message: "test.mem unreachable".to_string(),
                });
            }
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let inner = self.inner.lock().await;
            Ok(inner
                .objects
                .iter()
                .filter_map(|(key, obj)| {
                    let name = key.strip_prefix(&prefix)?;
                    if name.is_empty() || name.contains('/') {
                        return None;
                    }
                    Some(RemoteEntry {
                        name: name.to_string(),
                        size: obj.bytes.len() as u64,
                        modified_epoch_ms: obj.modified_epoch_ms,
                        locator: key.clone(),
                    })
                })
                .collect())
        })
    }

    fn upload_file<'a>(
        &'a self,
        path: &'a str,
        _creds: &'a Credentials,
        local_file: &'a Path,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if self.plan().await.upload_fails {
                return Err(Error::transfer(format!("test.mem upload rejected: {path}")));
            }
            let bytes = tokio::fs::read(local_file).await?;
            let now = chrono::Utc::now().timestamp_millis();
            self.insert(path, bytes, now).await;
            self.uploaded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn download_file<'a>(
        &'a self,
        locator: &'a str,
        _creds: &'a Credentials,
        dest: &'a Path,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            self.plan().await;
            let Some(bytes) = self.get(locator).await else {
                return Ok(false);
            };
            tokio::fs::write(dest, bytes).await?;
            Ok(true)
        })
    }

    fn delete_file<'a>(
        &'a self,
        locator: &'a str,
        _creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            self.plan().await;
            Ok(self.inner.lock().await.objects.remove(locator).is_some())
        })
    }

    fn test_write_permission<'a>(
        &'a self,
        path: &'a str,
        _creds: &'a Credentials,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if self.plan().await.probe_fails {
                return Err(Error::Permission {
                    message: format!("test.mem write denied: {path}"),
                });
            }
            let mut inner = self.inner.lock().await;
            inner.objects.insert(
                path.to_string(),
                StoredObject {
                    bytes: b"probe".to_vec(),
                    modified_epoch_ms: 0,
                },
            );
            inner.objects.remove(path);
            Ok(())
        })
    }
}
