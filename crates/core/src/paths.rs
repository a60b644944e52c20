use chrono::{DateTime, TimeZone};
use reqwest::Url;

use crate::{Error, Result};

pub const BACKUP_DIR_NAME: &str = "saison_backups";
pub const PROBE_FILE_NAME: &str = ".saison_test";
pub const BACKUP_FILE_PREFIX: &str = "saison_backup_";
pub const BACKUP_FILE_EXTENSION: &str = ".zip";

/// `yyyyMMdd_HHmmss`, shared by remote archives and local snapshots.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn backup_directory(base_url: &str) -> String {
    format!("{}/{BACKUP_DIR_NAME}", base_url.trim_end_matches('/'))
}

pub fn backup_file_path(base_url: &str, file_name: &str) -> String {
    format!("{}/{file_name}", backup_directory(base_url))
}

pub fn probe_file_path(base_url: &str) -> String {
    backup_file_path(base_url, PROBE_FILE_NAME)
}

pub fn file_name_of(url: &str) -> &str {
    match url.rfind('/') {
        Some(idx) => &url[idx + 1..],
        None => url,
    }
}

pub fn is_valid_url(url: &str) -> bool {
    if url.trim().is_empty() {
        return false;
    }
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

pub fn normalize_url(url: &str) -> Result<String> {
    let normalized = url.trim().trim_end_matches('/');
    if !is_valid_url(normalized) {
        return Err(Error::invalid(format!(
            "url must be an absolute http(s) url (got {url:?})"
        )));
    }
    Ok(normalized.to_string())
}

pub fn backup_file_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{BACKUP_FILE_PREFIX}{}{BACKUP_FILE_EXTENSION}",
        at.format(TIMESTAMP_FORMAT)
    )
}

pub fn is_backup_file_name(name: &str) -> bool {
    name.ends_with(BACKUP_FILE_EXTENSION) && name != PROBE_FILE_NAME
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn backup_directory_ignores_trailing_slash() {
        for base in [
            "https://dav.example.com",
            "https://dav.example.com/remote.php/webdav",
            "http://127.0.0.1:8080/dav",
        ] {
            let with_slash = format!("{base}/");
            assert_eq!(backup_directory(base), backup_directory(&with_slash));
            assert!(!backup_directory(base).ends_with('/'));
        }
        assert_eq!(
            backup_directory("https://dav.example.com/"),
            "https://dav.example.com/saison_backups"
        );
    }

    #[test]
    fn file_and_probe_paths_live_under_backup_directory() {
        let base = "https://dav.example.com/files/";
        assert_eq!(
            backup_file_path(base, "saison_backup_20240101_120000.zip"),
            "https://dav.example.com/files/saison_backups/saison_backup_20240101_120000.zip"
        );
        assert_eq!(
            probe_file_path(base),
            "https://dav.example.com/files/saison_backups/.saison_test"
        );
    }

    #[test]
    fn file_name_of_takes_last_segment() {
        assert_eq!(file_name_of("https://h/a/b/c.zip"), "c.zip");
        assert_eq!(file_name_of("c.zip"), "c.zip");
        assert_eq!(file_name_of("https://h/a/"), "");
    }

    #[test]
    fn url_validation_requires_http_scheme() {
        assert!(is_valid_url("https://dav.example.com"));
        assert!(is_valid_url("http://localhost:8080/dav"));
        assert!(!is_valid_url(""));
        assert!(!is_valid_url("   "));
        assert!(!is_valid_url("ftp://dav.example.com"));
        assert!(!is_valid_url("dav.example.com"));
        assert!(!is_valid_url("/relative/path"));
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "  https://dav.example.com/dav/  ",
            "https://dav.example.com//",
            "http://10.0.0.2:5005",
        ] {
            let once = normalize_url(raw).unwrap();
            let twice = normalize_url(&once).unwrap();
            assert_eq!(once, twice);
            assert!(!once.ends_with('/'));
        }
    }

    #[test]
    fn normalize_rejects_non_http() {
        for raw in ["", "dav.example.com", "ftp://x", "file:///tmp/a", "webdav://host"] {
            let err = normalize_url(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidConfiguration { .. }), "{raw}");
        }
    }

    #[test]
    fn backup_file_name_uses_second_resolution() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(backup_file_name(&at), "saison_backup_20240309_070501.zip");
        assert!(is_backup_file_name(&backup_file_name(&at)));
        assert!(!is_backup_file_name(PROBE_FILE_NAME));
    }
}
