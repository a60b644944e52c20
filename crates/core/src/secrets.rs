use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub const SECRETS_FILE_NAME: &str = "secrets.enc";
pub const VAULT_KEY_FILE_NAME: &str = "vault.key";

pub(crate) const REMOTE_PASSWORD_KEY: &str = "remote.password";

const SECRETS_FILE_VERSION: u8 = 1;
const SECRETS_PAYLOAD_VERSION: u32 = 1;
const SECRETS_AD: &[u8] = b"saison.secrets.v1";
const NONCE_LEN: usize = 24;

#[derive(Debug, Serialize, Deserialize)]
struct SecretsPayloadV1 {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Encrypted key/value file next to the config store.
///
/// Entries are sealed with XChaCha20-Poly1305 under a random vault key kept in a separate
/// owner-only file. The key is generated on the first write.
#[derive(Debug, Clone)]
pub struct SecretsStore {
    path: PathBuf,
    key_path: PathBuf,
}

impl SecretsStore {
    pub fn in_dir(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SECRETS_FILE_NAME),
            key_path: config_dir.join(VAULT_KEY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.load()?;
        let removed = entries.remove(key).is_some();
        if removed {
            self.save(&entries)?;
        }
        Ok(removed)
    }

    /// Drops every entry. The vault key stays so later writes reuse it.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let key = read_vault_key(&self.key_path)?;
        decrypt(&key, &bytes)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let key = match std::fs::metadata(&self.key_path) {
            Ok(_) => read_vault_key(&self.key_path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; 32];
                getrandom::getrandom(&mut key).map_err(|e| secrets_error(format!("random: {e}")))?;
                let b64 = base64::engine::general_purpose::STANDARD.encode(key);
                write_atomic_private(&self.key_path, format!("{b64}\n").as_bytes())?;
                debug!(
                    event = "secrets.vault_key.created",
                    path = %self.key_path.display(),
                    "secrets.vault_key.created"
                );
                key
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = encrypt(&key, entries)?;
        write_atomic_private(&self.path, &bytes)?;
        Ok(())
    }
}

fn read_vault_key(path: &Path) -> Result<[u8; 32]> {
    let text = std::fs::read_to_string(path)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim().as_bytes())
        .map_err(|e| secrets_error(format!("vault key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| secrets_error("vault key must be exactly 32 bytes"))
}

fn encrypt(key: &[u8; 32], entries: &BTreeMap<String, String>) -> Result<Vec<u8>> {
    let payload = SecretsPayloadV1 {
        version: SECRETS_PAYLOAD_VERSION,
        entries: entries.clone(),
    };
    let plaintext =
        serde_json::to_vec(&payload).map_err(|e| secrets_error(format!("encode: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce_bytes).map_err(|e| secrets_error(format!("random: {e}")))?;
    let cipher = XChaCha20Poly1305::new(key.into());
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: SECRETS_AD,
            },
        )
        .map_err(|_| secrets_error("encrypt failed"))?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(SECRETS_FILE_VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(key: &[u8; 32], bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    if bytes.len() < 1 + NONCE_LEN {
        return Err(secrets_error("secrets file too small"));
    }
    if bytes[0] != SECRETS_FILE_VERSION {
        return Err(secrets_error(format!(
            "unsupported secrets file version: {}",
            bytes[0]
        )));
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&bytes[1..1 + NONCE_LEN]),
            Payload {
                msg: &bytes[1 + NONCE_LEN..],
                aad: SECRETS_AD,
            },
        )
        .map_err(|_| secrets_error("decrypt failed (wrong vault key or tampered file)"))?;

    let payload: SecretsPayloadV1 =
        serde_json::from_slice(&plaintext).map_err(|e| secrets_error(format!("decode: {e}")))?;
    if payload.version != SECRETS_PAYLOAD_VERSION {
        return Err(secrets_error(format!(
            "unsupported secrets payload version: {}",
            payload.version
        )));
    }
    Ok(payload.entries)
}

fn secrets_error(message: impl Into<String>) -> Error {
    Error::Secrets {
        message: message.into(),
    }
}

/// Writes through an owner-only temp file, then renames over `path`.
pub(crate) fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        // A pre-existing temp file keeps its old mode; tighten it before any secret lands.
        f.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
