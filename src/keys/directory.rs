use std::path::PathBuf;

use async_trait::async_trait;

use super::reconcile::{CandidateKey, KeySource};
use super::store::KeyringId;
use crate::error::{Result, SealError};

/// Remote key directory: given an address, zero or one candidate key.
/// Implementations make a single attempt and never retry.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn lookup(&self, address: &str, keyring: &KeyringId) -> Result<Option<CandidateKey>>;
}

/// Directory backed by a folder of `<address>.asc` files, e.g. a synced share.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DirectoryLookup for FsDirectory {
    async fn lookup(&self, address: &str, keyring: &KeyringId) -> Result<Option<CandidateKey>> {
        if address.contains(['/', '\\']) || address.starts_with('.') {
            return Err(SealError::InvalidAddress(address.to_string()));
        }
        let path = self.root.join(format!("{}.asc", address.to_ascii_lowercase()));
        tracing::debug!(%keyring, path = %path.display(), "directory lookup");

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SealError::LookupFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        CandidateKey::from_armored(&text, KeySource::Directory)
            .map(Some)
            .map_err(|e| SealError::LookupFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Lookup disabled: every address is unknown.
pub struct NoDirectory;

#[async_trait]
impl DirectoryLookup for NoDirectory {
    async fn lookup(&self, _address: &str, _keyring: &KeyringId) -> Result<Option<CandidateKey>> {
        Ok(None)
    }
}
