use std::sync::Arc;

use saison_backup_core::{
    BackupService, ConfigStore, Credentials, Error, ErrorKind, RemoteFileClient, WebDavClient,
};
use tempfile::TempDir;
use wiremock::matchers::{basic_auth, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn creds() -> Credentials {
    Credentials::new("alice", "pw")
}

fn multistatus(entries: &[(&str, u64, &str)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="utf-8"?><d:multistatus xmlns:d="DAV:">
<d:response><d:href>/saison_backups/</d:href><d:propstat><d:prop>
<d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>"#,
    );
    for (name, size, modified) in entries {
        body.push_str(&format!(
            "<d:response><d:href>/saison_backups/{name}</d:href><d:propstat><d:prop>\
             <d:resourcetype/><d:getcontentlength>{size}</d:getcontentlength>\
             <d:getlastmodified>{modified}</d:getlastmodified></d:prop></d:propstat></d:response>"
        ));
    }
    body.push_str("</d:multistatus>");
    body
}

#[tokio::test]
async fn check_connection_sends_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/"))
        .and(header("Depth", "0"))
        .and(basic_auth("alice", "pw"))
        .respond_with(ResponseTemplate::new(207))
        .expect(1)
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    assert!(client.check_connection(&server.uri(), &creds()).await.unwrap());
}

#[tokio::test]
async fn check_connection_maps_unauthorized_to_permission() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let err = client
        .check_connection(&server.uri(), &creds())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn unreachable_server_is_connectivity_failure() {
    // Mock servers are pooled and keep listening after drop; use a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = WebDavClient::new().unwrap();
    let err = client.check_connection(&uri, &creds()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.kind().is_retryable());
}

#[tokio::test]
async fn create_directory_skips_mkcol_when_present() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/saison_backups/"))
        .respond_with(ResponseTemplate::new(207))
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let dir = format!("{}/saison_backups", server.uri());
    assert!(client.create_directory(&dir, &creds()).await.unwrap());
}

#[tokio::test]
async fn create_directory_accepts_created_and_method_not_allowed() {
    for mkcol_status in [201u16, 405] {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("MKCOL"))
            .and(path("/saison_backups/"))
            .respond_with(ResponseTemplate::new(mkcol_status))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebDavClient::new().unwrap();
        let dir = format!("{}/saison_backups", server.uri());
        assert!(client.create_directory(&dir, &creds()).await.unwrap());
    }
}

#[tokio::test]
async fn create_directory_reports_rejection_as_false() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let dir = format!("{}/missing/parent/saison_backups", server.uri());
    assert!(!client.create_directory(&dir, &creds()).await.unwrap());
}

#[tokio::test]
async fn list_files_parses_multistatus() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/saison_backups/"))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(&[
            (
                "saison_backup_20240101_080000.zip",
                2048,
                "Mon, 01 Jan 2024 08:00:05 GMT",
            ),
            (
                "saison_backup_20240102_080000.zip",
                4096,
                "Tue, 02 Jan 2024 08:00:05 GMT",
            ),
        ])))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let dir = format!("{}/saison_backups", server.uri());
    let entries = client.list_files(&dir, &creds()).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].name, "saison_backup_20240102_080000.zip");
    assert_eq!(entries[1].size, 4096);
    assert_eq!(
        entries[1].modified_epoch_ms - entries[0].modified_epoch_ms,
        24 * 60 * 60 * 1000
    );
    assert_eq!(
        entries[0].locator,
        format!("{}/saison_backups/saison_backup_20240101_080000.zip", server.uri())
    );
}

#[tokio::test]
async fn list_files_of_missing_directory_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let dir = format!("{}/saison_backups", server.uri());
    assert!(client.list_files(&dir, &creds()).await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_then_download_streams_bytes() {
    let temp = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let local = temp.path().join("up.zip");
    std::fs::write(&local, &payload).unwrap();

    let server = MockServer::start().await;
    let remote = format!("{}/saison_backups/saison_backup_20240101_080000.zip", server.uri());
    Mock::given(method("PUT"))
        .and(path("/saison_backups/saison_backup_20240101_080000.zip"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/saison_backups/saison_backup_20240101_080000.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    client.upload_file(&remote, &creds(), &local).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let put = received
        .iter()
        .find(|r| r.method.as_str() == "PUT")
        .unwrap();
    assert_eq!(put.body, payload);

    let dest = temp.path().join("down.zip");
    assert!(client.download_file(&remote, &creds(), &dest).await.unwrap());
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test]
async fn upload_rejection_is_transfer_failure() {
    let temp = TempDir::new().unwrap();
    let local = temp.path().join("up.zip");
    std::fs::write(&local, b"zip").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(507))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let remote = format!("{}/saison_backups/x.zip", server.uri());
    let err = client.upload_file(&remote, &creds(), &local).await.unwrap_err();
    assert!(matches!(err, Error::Transfer { .. }));
}

#[tokio::test]
async fn download_of_missing_object_is_false() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let remote = format!("{}/saison_backups/gone.zip", server.uri());
    let dest = temp.path().join("gone.zip");
    assert!(!client.download_file(&remote, &creds(), &dest).await.unwrap());
    assert!(!dest.exists());
}

#[tokio::test]
async fn delete_treats_not_found_as_done() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/saison_backups/gone.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/saison_backups/locked.zip"))
        .respond_with(ResponseTemplate::new(423))
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let gone = format!("{}/saison_backups/gone.zip", server.uri());
    let locked = format!("{}/saison_backups/locked.zip", server.uri());
    assert!(client.delete_file(&gone, &creds()).await.unwrap());
    assert!(!client.delete_file(&locked, &creds()).await.unwrap());
}

#[tokio::test]
async fn probe_rejection_is_permission_failure() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let client = WebDavClient::new().unwrap();
    let probe = format!("{}/saison_backups/.saison_test", server.uri());
    let err = client
        .test_write_permission(&probe, &creds())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn service_test_connection_over_webdav() {
    let temp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(207))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/saison_backups/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .and(path("/saison_backups/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/saison_backups/.saison_test"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/saison_backups/.saison_test"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(ConfigStore::open(&temp.path().join("config")).unwrap());
    let service = BackupService::new(store, WebDavClient::new().unwrap(), temp.path().join("tmp"));
    service
        .configure(&format!("{}/", server.uri()), "alice", "pw")
        .unwrap();
    service.test_connection().await.unwrap();
}
