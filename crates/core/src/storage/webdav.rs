use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use super::{RemoteEntry, RemoteFileClient, RemoteFuture};
use crate::model::Credentials;
use crate::{Error, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/><d:getlastmodified/><d:getcontentlength/></d:prop></d:propfind>"#;
const PROBE_BYTES: &[u8] = b"saison write probe";
const DAV_NS: &str = "DAV:";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// WebDAV client speaking Basic auth over `reqwest`.
#[derive(Debug, Clone)]
pub struct WebDavClient {
    http: Client,
}

impl WebDavClient {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(connect: Duration, request: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()
            .map_err(|e| Error::Connectivity {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self { http })
    }

    fn request(&self, method: Method, url: &str, creds: &Credentials) -> Result<RequestBuilder> {
        let url = Url::parse(url)
            .map_err(|e| Error::invalid(format!("invalid remote url {url:?}: {e}")))?;
        Ok(self
            .http
            .request(method, url)
            .basic_auth(&creds.username, Some(creds.password())))
    }

    async fn propfind(&self, url: &str, creds: &Credentials, depth: &str) -> Result<Response> {
        self.request(propfind_method()?, url, creds)?
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| send_error("PROPFIND", url, e))
    }
}

impl RemoteFileClient for WebDavClient {
    fn provider(&self) -> &'static str {
        "webdav"
    }

    fn check_connection<'a>(
        &'a self,
        base_url: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            let res = self.propfind(&collection_url(base_url), creds, "0").await?;
            let status = res.status();
            debug!(
                event = "webdav.check_connection",
                status = status.as_u16(),
                "webdav.check_connection"
            );
            if is_auth_failure(status) {
                return Err(status_error("PROPFIND", base_url, status));
            }
            Ok(status.is_success())
        })
    }

    fn create_directory<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            let url = collection_url(path);
            let res = self.propfind(&url, creds, "0").await?;
            if res.status().is_success() {
                return Ok(true);
            }
            if is_auth_failure(res.status()) {
                return Err(status_error("PROPFIND", path, res.status()));
            }

            let res = self
                .request(mkcol_method()?, &url, creds)?
                .send()
                .await
                .map_err(|e| send_error("MKCOL", path, e))?;
            let status = res.status();
            // 405: the collection already exists.
            if matches!(status, StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED)
                || status.is_success()
            {
                return Ok(true);
            }
            if is_auth_failure(status) {
                return Err(status_error("MKCOL", path, status));
            }
            warn!(
                event = "webdav.mkcol_rejected",
                path,
                status = status.as_u16(),
                "webdav.mkcol_rejected"
            );
            Ok(false)
        })
    }

    fn list_files<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, Vec<RemoteEntry>> {
        Box::pin(async move {
            let url = collection_url(path);
            let res = self.propfind(&url, creds, "1").await?;
            let status = res.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                return Err(status_error("PROPFIND", path, status));
            }
            let xml = res
                .text()
                .await
                .map_err(|e| send_error("PROPFIND", path, e))?;
            let base = Url::parse(&url)
                .map_err(|e| Error::invalid(format!("invalid remote url {url:?}: {e}")))?;
            parse_multistatus(&xml, &base)
        })
    }

    fn upload_file<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
        local_file: &'a Path,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let file = tokio::fs::File::open(local_file).await?;
            let len = file.metadata().await?.len();
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            let res = self
                .request(Method::PUT, path, creds)?
                .header("Content-Length", len)
                .header("Content-Type", "application/zip")
                .body(body)
                .send()
                .await
                .map_err(|e| send_error("PUT", path, e))?;
            let status = res.status();
            if !status.is_success() {
                error!(
                    event = "webdav.upload_failed",
                    path,
                    status = status.as_u16(),
                    bytes = len,
                    "webdav.upload_failed"
                );
                return Err(status_error("PUT", path, status));
            }
            Ok(())
        })
    }

    fn download_file<'a>(
        &'a self,
        locator: &'a str,
        creds: &'a Credentials,
        dest: &'a Path,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            let res = self
                .request(Method::GET, locator, creds)?
                .send()
                .await
                .map_err(|e| send_error("GET", locator, e))?;
            let status = res.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            if !status.is_success() {
                return Err(status_error("GET", locator, status));
            }

            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = res.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|e| send_error("GET", locator, e))?;
                file.write_all(&bytes).await?;
            }
            file.flush().await?;
            Ok(true)
        })
    }

    fn delete_file<'a>(
        &'a self,
        locator: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, bool> {
        Box::pin(async move {
            let res = self
                .request(Method::DELETE, locator, creds)?
                .send()
                .await
                .map_err(|e| send_error("DELETE", locator, e))?;
            let status = res.status();
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(true);
            }
            if is_auth_failure(status) {
                return Err(status_error("DELETE", locator, status));
            }
            Ok(false)
        })
    }

    fn test_write_permission<'a>(
        &'a self,
        path: &'a str,
        creds: &'a Credentials,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let res = self
                .request(Method::PUT, path, creds)?
                .body(PROBE_BYTES)
                .send()
                .await
                .map_err(|e| send_error("PUT", path, e))?;
            if !res.status().is_success() {
                return Err(Error::Permission {
                    message: format!("probe write rejected: http {}", res.status()),
                });
            }

            let res = self
                .request(Method::DELETE, path, creds)?
                .send()
                .await
                .map_err(|e| send_error("DELETE", path, e))?;
            let status = res.status();
            if !(status.is_success() || status == StatusCode::NOT_FOUND) {
                return Err(Error::Permission {
                    message: format!("probe delete rejected: http {status}"),
                });
            }
            Ok(())
        })
    }
}

/// Extracts file entries from a `207 Multi-Status` body; collections are skipped.
pub fn parse_multistatus(xml: &str, base: &Url) -> Result<Vec<RemoteEntry>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::transfer(format!("invalid PROPFIND response: {e}")))?;

    let mut entries = Vec::new();
    for response in doc
        .descendants()
        .filter(|n| n.has_tag_name((DAV_NS, "response")))
    {
        let Some(href) = response
            .descendants()
            .find(|n| n.has_tag_name((DAV_NS, "href")))
            .and_then(|n| n.text())
            .map(str::trim)
        else {
            continue;
        };

        let is_collection = response
            .descendants()
            .any(|n| n.has_tag_name((DAV_NS, "collection")));
        if is_collection || href.ends_with('/') {
            continue;
        }

        let decoded = urlencoding::decode(href)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| href.to_string());
        let name = crate::paths::file_name_of(&decoded).to_string();
        if name.is_empty() {
            continue;
        }

        let size = response
            .descendants()
            .find(|n| n.has_tag_name((DAV_NS, "getcontentlength")))
            .and_then(|n| n.text())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let modified_epoch_ms = response
            .descendants()
            .find(|n| n.has_tag_name((DAV_NS, "getlastmodified")))
            .and_then(|n| n.text())
            .and_then(|s| DateTime::parse_from_rfc2822(s.trim()).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);

        let locator = base
            .join(href)
            .map(|u| u.to_string())
            .map_err(|e| Error::transfer(format!("invalid href {href:?}: {e}")))?;

        entries.push(RemoteEntry {
            name,
            size,
            modified_epoch_ms,
            locator,
        });
    }
    Ok(entries)
}

fn collection_url(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

fn propfind_method() -> Result<Method> {
    Method::from_bytes(b"PROPFIND").map_err(|e| Error::invalid(format!("PROPFIND method: {e}")))
}

fn mkcol_method() -> Result<Method> {
    Method::from_bytes(b"MKCOL").map_err(|e| Error::invalid(format!("MKCOL method: {e}")))
}

fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

fn status_error(op: &str, url: &str, status: StatusCode) -> Error {
    if is_auth_failure(status) {
        Error::Permission {
            message: format!("{op} {url}: http {status}"),
        }
    } else {
        Error::transfer(format!("{op} {url}: http {status}"))
    }
}

fn send_error(op: &str, url: &str, e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::Connectivity {
            message: format!("{op} {url}: {e}"),
        }
    } else {
        Error::transfer(format!("{op} {url}: {e}"))
    }
}
