use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::model::{BackupArchiveContent, BackupCategory, BackupPreferences};
use crate::{Error, Result};

pub const MANIFEST_ENTRY: &str = "backup_info.json";
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;
pub const ARCHIVE_APP_NAME: &str = "saison";
/// Upper bound on one decompressed entry. Archives come from a remote and are not trusted.
pub const MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

/// Packs named payloads into one archive file and back.
pub trait ArchiveCodec: Send + Sync {
    fn pack(&self, entries: &BTreeMap<String, Vec<u8>>, dest: &Path) -> Result<()>;
    fn unpack(&self, archive: &Path) -> Result<BTreeMap<String, Vec<u8>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiveCodec;

impl ArchiveCodec for ZipArchiveCodec {
    fn pack(&self, entries: &BTreeMap<String, Vec<u8>>, dest: &Path) -> Result<()> {
        let file = File::create(dest)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, bytes) in entries {
            validate_entry_name(name).map_err(Error::invalid)?;
            zip.start_file(name.as_str(), options).map_err(zip_write_error)?;
            zip.write_all(bytes)?;
        }
        let mut writer = zip.finish().map_err(zip_write_error)?;
        writer.flush()?;
        Ok(())
    }

    fn unpack(&self, archive: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(BufReader::new(file))
            .map_err(|e| Error::corrupt(format!("not a zip archive: {e}")))?;

        let mut out = BTreeMap::new();
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::corrupt(format!("entry {i} unreadable: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            validate_entry_name(&name).map_err(Error::corrupt)?;

            if entry.size() > MAX_ENTRY_BYTES {
                return Err(Error::corrupt(format!(
                    "entry {name} declares {} bytes (limit {MAX_ENTRY_BYTES})",
                    entry.size()
                )));
            }

            let mut bytes = Vec::new();
            entry
                .by_ref()
                .take(MAX_ENTRY_BYTES + 1)
                .read_to_end(&mut bytes)
                .map_err(|e| Error::corrupt(format!("entry {name} truncated: {e}")))?;
            if bytes.len() as u64 > MAX_ENTRY_BYTES {
                return Err(Error::corrupt(format!(
                    "entry {name} exceeds {MAX_ENTRY_BYTES} bytes"
                )));
            }
            if out.insert(name.clone(), bytes).is_some() {
                return Err(Error::corrupt(format!("duplicate entry {name}")));
            }
        }
        Ok(out)
    }
}

/// Archive entries are flat file names; anything path-like is rejected.
fn validate_entry_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(format!("illegal archive entry name {name:?}"));
    }
    Ok(())
}

fn zip_write_error(e: zip::result::ZipError) -> Error {
    match e {
        zip::result::ZipError::Io(io) => Error::Io(io),
        other => Error::Io(std::io::Error::other(other.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub created_at: String,
    pub app: String,
    pub categories: Vec<BackupCategory>,
}

/// Serialises every enabled category of `content` plus the manifest into archive entries.
pub fn encode_content(
    prefs: &BackupPreferences,
    content: &BackupArchiveContent,
    created_at: DateTime<Utc>,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let categories = prefs.enabled_categories();
    let mut entries = BTreeMap::new();
    for c in &categories {
        let bytes = if c.is_collection() {
            serde_json::to_vec_pretty(content.collection(*c))
        } else {
            serde_json::to_vec_pretty(&content.preferences)
        }
        .map_err(|e| Error::invalid(format!("encode {c} failed: {e}")))?;
        entries.insert(c.entry_name(), bytes);
    }

    let manifest = ArchiveManifest {
        format_version: ARCHIVE_FORMAT_VERSION,
        created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        app: ARCHIVE_APP_NAME.to_string(),
        categories,
    };
    let manifest = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::invalid(format!("encode manifest failed: {e}")))?;
    entries.insert(MANIFEST_ENTRY.to_string(), manifest);
    Ok(entries)
}

/// Rebuilds the archive content; categories missing from the archive come back empty.
pub fn decode_content(
    entries: &BTreeMap<String, Vec<u8>>,
) -> Result<(Option<ArchiveManifest>, BackupArchiveContent)> {
    let manifest = match entries.get(MANIFEST_ENTRY) {
        Some(bytes) => {
            let manifest: ArchiveManifest = serde_json::from_slice(bytes)
                .map_err(|e| Error::corrupt(format!("{MANIFEST_ENTRY} invalid: {e}")))?;
            if manifest.format_version > ARCHIVE_FORMAT_VERSION {
                return Err(Error::corrupt(format!(
                    "unsupported archive format version: {} (max {ARCHIVE_FORMAT_VERSION})",
                    manifest.format_version
                )));
            }
            Some(manifest)
        }
        None => None,
    };

    let mut content = BackupArchiveContent::new();
    for c in BackupCategory::ALL {
        let entry = entries.get(&c.entry_name());
        if c.is_collection() {
            let items: Vec<Value> = match entry {
                Some(bytes) => serde_json::from_slice(bytes)
                    .map_err(|e| Error::corrupt(format!("{} invalid: {e}", c.entry_name())))?,
                None => Vec::new(),
            };
            content.set_collection(c, items);
        } else if let Some(bytes) = entry {
            content.preferences = serde_json::from_slice(bytes)
                .map_err(|e| Error::corrupt(format!("{} invalid: {e}", c.entry_name())))?;
        }
    }
    Ok((manifest, content))
}
