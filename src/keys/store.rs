use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::cert::{Cert, Fingerprint};
use crate::error::{Result, SealError};

/// Name of a keyring. Each keyring is an independent trusted key store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyringId(String);

impl KeyringId {
    pub const MAIN: &'static str = "main";

    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SealError::Store(format!(
                "keyring name '{}' contains invalid characters (use A-Z, a-z, 0-9, _, -)",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for KeyringId {
    fn default() -> Self {
        Self::main()
    }
}

impl fmt::Display for KeyringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful `import_or_merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Imported,
    Updated,
}

/// Port for the trusted local key store.
///
/// Only the key reconciler writes through `import_or_merge`, `remove` and
/// `set_default_signing`; everything else reads.
pub trait KeyStore: Send + Sync {
    fn get_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<Cert>>;

    /// All keys carrying a user id for `address` (case-insensitive).
    fn get_by_address(&self, address: &str) -> Result<Vec<Cert>>;

    /// Insert `cert`, or merge it into the stored copy with the same fingerprint.
    fn import_or_merge(&self, cert: &Cert) -> Result<ImportStatus>;

    fn default_signing_fingerprint(&self) -> Result<Option<Fingerprint>>;

    fn set_default_signing(&self, fp: &Fingerprint) -> Result<()>;

    fn list(&self) -> Result<Vec<Cert>>;

    fn remove(&self, fp: &Fingerprint) -> Result<bool>;
}

/// A keyring identity bound to its store.
#[derive(Clone)]
pub struct Keyring {
    pub id: KeyringId,
    pub store: Arc<dyn KeyStore>,
}

impl Keyring {
    pub fn new(id: KeyringId, store: Arc<dyn KeyStore>) -> Self {
        Self { id, store }
    }
}

/// Stored copies keep their secret half when a public copy is merged in.
fn merged_copy(stored: &Cert, incoming: &Cert) -> Result<Cert> {
    if incoming.is_private() && !stored.is_private() {
        incoming.merge(stored)
    } else {
        stored.merge(incoming)
    }
}

// ---------------------------------------------------------------------------
// On-disk store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyringMeta {
    default_signing: Option<Fingerprint>,
}

/// Manages `<config>/keyrings/<id>/` with one armored file per fingerprint.
pub struct FileKeyStore {
    base_dir: PathBuf,
    // serializes read-modify-write of files within this process
    write_lock: Mutex<()>,
}

impl FileKeyStore {
    /// Open a keyring under the default platform config directory.
    pub fn open(keyring: &KeyringId) -> Result<Self> {
        let dirs = ProjectDirs::from("dev", "sealpost", "sealpost")
            .ok_or_else(|| SealError::Store("could not determine config directory".into()))?;
        Ok(Self::open_at(dirs.config_dir(), keyring))
    }

    /// Open a keyring under a specific root directory (for testing).
    pub fn open_at(root: &Path, keyring: &KeyringId) -> Self {
        Self {
            base_dir: root.join("keyrings").join(keyring.as_str()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.base_dir.join("keys")
    }

    fn key_path(&self, fp: &Fingerprint) -> PathBuf {
        self.keys_dir().join(format!("{}.asc", fp))
    }

    fn meta_path(&self) -> PathBuf {
        self.base_dir.join("keyring.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.keys_dir())?;
        Ok(())
    }

    fn read_cert(&self, path: &Path) -> Result<Cert> {
        let content = std::fs::read_to_string(path)?;
        Cert::from_armored(&content).map_err(|e| {
            SealError::Store(format!("corrupt key file {}: {}", path.display(), e))
        })
    }

    fn write_cert(&self, cert: &Cert) -> Result<()> {
        self.ensure_dirs()?;
        let path = self.key_path(cert.fingerprint());
        if !cert.is_private() {
            std::fs::write(&path, cert.to_armored())?;
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::io::Write;
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            // a public copy may already exist with wider permissions
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            file.write_all(cert.to_armored().as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&path, cert.to_armored())?;
        }
        Ok(())
    }

    fn load_meta(&self) -> Result<KeyringMeta> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(KeyringMeta::default());
        }
        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| SealError::Store(format!("failed to parse keyring.toml: {}", e)))
    }

    fn save_meta(&self, meta: &KeyringMeta) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let content = toml::to_string_pretty(meta)
            .map_err(|e| SealError::Store(format!("failed to serialize keyring.toml: {}", e)))?;
        std::fs::write(self.meta_path(), content)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KeyStore for FileKeyStore {
    fn get_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<Cert>> {
        let path = self.key_path(fp);
        if !path.exists() {
            return Ok(None);
        }
        self.read_cert(&path).map(Some)
    }

    fn get_by_address(&self, address: &str) -> Result<Vec<Cert>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.has_address(address))
            .collect())
    }

    fn import_or_merge(&self, cert: &Cert) -> Result<ImportStatus> {
        let _guard = self.lock();
        match self.get_by_fingerprint(cert.fingerprint())? {
            Some(stored) => {
                self.write_cert(&merged_copy(&stored, cert)?)?;
                Ok(ImportStatus::Updated)
            }
            None => {
                self.write_cert(cert)?;
                Ok(ImportStatus::Imported)
            }
        }
    }

    fn default_signing_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.load_meta()?.default_signing)
    }

    fn set_default_signing(&self, fp: &Fingerprint) -> Result<()> {
        let _guard = self.lock();
        let mut meta = self.load_meta()?;
        meta.default_signing = Some(fp.clone());
        self.save_meta(&meta)
    }

    fn list(&self) -> Result<Vec<Cert>> {
        let keys_dir = self.keys_dir();
        if !keys_dir.exists() {
            return Ok(Vec::new());
        }
        let mut certs = Vec::new();
        for entry in std::fs::read_dir(&keys_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("asc") {
                certs.push(self.read_cert(&path)?);
            }
        }
        certs.sort_by(|a, b| a.fingerprint().cmp(b.fingerprint()));
        Ok(certs)
    }

    fn remove(&self, fp: &Fingerprint) -> Result<bool> {
        let _guard = self.lock();
        let path = self.key_path(fp);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        let mut meta = self.load_meta()?;
        if meta.default_signing.as_ref() == Some(fp) {
            meta.default_signing = None;
            self.save_meta(&meta)?;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile key store, used for scratch keyrings and tests.
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    certs: BTreeMap<Fingerprint, Cert>,
    default_signing: Option<Fingerprint>,
    writes: usize,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<Cert>> {
        Ok(self.lock().certs.get(fp).cloned())
    }

    fn get_by_address(&self, address: &str) -> Result<Vec<Cert>> {
        Ok(self
            .lock()
            .certs
            .values()
            .filter(|c| c.has_address(address))
            .cloned()
            .collect())
    }

    fn import_or_merge(&self, cert: &Cert) -> Result<ImportStatus> {
        let mut inner = self.lock();
        inner.writes += 1;
        let fp = cert.fingerprint().clone();
        match inner.certs.get(&fp) {
            Some(stored) => {
                let merged = merged_copy(stored, cert)?;
                inner.certs.insert(fp, merged);
                Ok(ImportStatus::Updated)
            }
            None => {
                inner.certs.insert(fp, cert.clone());
                Ok(ImportStatus::Imported)
            }
        }
    }

    fn default_signing_fingerprint(&self) -> Result<Option<Fingerprint>> {
        Ok(self.lock().default_signing.clone())
    }

    fn set_default_signing(&self, fp: &Fingerprint) -> Result<()> {
        let mut inner = self.lock();
        inner.writes += 1;
        inner.default_signing = Some(fp.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cert>> {
        Ok(self.lock().certs.values().cloned().collect())
    }

    fn remove(&self, fp: &Fingerprint) -> Result<bool> {
        let mut inner = self.lock();
        inner.writes += 1;
        if inner.default_signing.as_ref() == Some(fp) {
            inner.default_signing = None;
        }
        Ok(inner.certs.remove(fp).is_some())
    }
}
