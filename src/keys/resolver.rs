use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::cert::{Fingerprint, Validity};
use super::directory::DirectoryLookup;
use super::reconcile::{KeyReconciler, Outcome};
use crate::error::{Result, SealError};
use crate::popup::PopupSlot;

const ADDRESS_PATTERN: &str = r"^[^@\s<>]+@[^@\s<>]+\.[^@\s<>.]+$";

/// One entry per requested address; an empty set means unresolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientKeyMap(BTreeMap<String, BTreeSet<Fingerprint>>);

impl RecipientKeyMap {
    pub fn get(&self, address: &str) -> Option<&BTreeSet<Fingerprint>> {
        self.0.get(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<Fingerprint>)> {
        self.0.iter()
    }

    /// Addresses with no usable key, sorted.
    pub fn unresolved(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, fps)| fps.is_empty())
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Flattened, deduplicated and sorted fingerprints.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.0
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Maps addresses to usable keys: local store first, then one directory lookup.
pub struct RecipientResolver {
    reconciler: Arc<KeyReconciler>,
    directory: Arc<dyn DirectoryLookup>,
    lookup_timeout: Duration,
}

impl RecipientResolver {
    pub fn new(
        reconciler: Arc<KeyReconciler>,
        directory: Arc<dyn DirectoryLookup>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            directory,
            lookup_timeout,
        }
    }

    /// Resolve every address in turn. Any import a lookup triggers completes
    /// before the next address is considered.
    pub async fn resolve(
        &self,
        addresses: &[String],
        slot: &mut PopupSlot,
    ) -> Result<RecipientKeyMap> {
        let address_re =
            Regex::new(ADDRESS_PATTERN).map_err(|e| SealError::InvalidAddress(e.to_string()))?;

        let mut map = BTreeMap::new();
        for raw in addresses {
            let address = raw.trim().to_ascii_lowercase();
            if !address_re.is_match(&address) {
                return Err(SealError::InvalidAddress(raw.clone()));
            }
            if map.contains_key(&address) {
                continue;
            }

            let mut keys = self.usable_keys(&address)?;
            if keys.is_empty() {
                keys = self.look_up(&address, slot).await?;
            }
            tracing::debug!(%address, keys = keys.len(), "recipient resolved");
            map.insert(address, keys);
        }
        Ok(RecipientKeyMap(map))
    }

    fn usable_keys(&self, address: &str) -> Result<BTreeSet<Fingerprint>> {
        Ok(self
            .reconciler
            .keyring()
            .store
            .get_by_address(address)?
            .into_iter()
            .filter(|cert| cert.validity() == Validity::Valid)
            .map(|cert| cert.fingerprint().clone())
            .collect())
    }

    /// Exactly one attempt. Failures leave the address unresolved.
    async fn look_up(&self, address: &str, slot: &mut PopupSlot) -> Result<BTreeSet<Fingerprint>> {
        let keyring = &self.reconciler.keyring().id;
        let found = tokio::time::timeout(
            self.lookup_timeout,
            self.directory.lookup(address, keyring),
        )
        .await;

        let candidate = match found {
            Ok(Ok(Some(candidate))) => candidate,
            Ok(Ok(None)) => {
                tracing::debug!(%address, "no directory entry");
                return Ok(BTreeSet::new());
            }
            Ok(Err(e)) => {
                tracing::warn!(%address, "directory lookup failed: {}", e);
                return Ok(BTreeSet::new());
            }
            Err(_) => {
                tracing::warn!(
                    %address,
                    timeout = ?self.lookup_timeout,
                    "directory lookup timed out"
                );
                return Ok(BTreeSet::new());
            }
        };

        if !candidate.cert().has_address(address) {
            tracing::warn!(
                %address,
                key = %candidate.fingerprint().key_id(),
                "directory returned a key for another address"
            );
            return Ok(BTreeSet::new());
        }

        match self.reconciler.import(candidate, slot).await {
            Ok(applied) if matches!(applied.outcome, Outcome::Imported | Outcome::Updated) => {
                self.usable_keys(address)
            }
            Ok(applied) => {
                tracing::debug!(%address, outcome = %applied.outcome, "directory key not accepted");
                Ok(BTreeSet::new())
            }
            Err(e) => {
                tracing::warn!(%address, "could not import directory key: {}", e);
                Ok(BTreeSet::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cert::{Cert, UserId};
    use crate::keys::directory::NoDirectory;
    use crate::keys::identity::UnlockedKey;
    use crate::keys::reconcile::{CandidateKey, KeySource};
    use crate::keys::store::{KeyStore, Keyring, KeyringId, MemoryKeyStore};
    use crate::popup::{Scripted, ScriptedSurface};
    use age::secrecy::SecretString;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn public_key(address: &str) -> Cert {
        UnlockedKey::generate(
            &UserId::new(address, None),
            &SecretString::from("pw".to_string()),
            10,
        )
        .unwrap()
        .0
        .public()
    }

    struct CountingDirectory {
        key: Option<Cert>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryLookup for CountingDirectory {
        async fn lookup(
            &self,
            _address: &str,
            _keyring: &KeyringId,
        ) -> Result<Option<CandidateKey>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.key {
                Some(cert) => CandidateKey::from_cert(cert.clone(), KeySource::Directory).map(Some),
                None => Err(SealError::LookupFailed {
                    address: "x".into(),
                    reason: "offline".into(),
                }),
            }
        }
    }

    fn resolver(
        store: Arc<MemoryKeyStore>,
        directory: Arc<dyn DirectoryLookup>,
    ) -> RecipientResolver {
        let reconciler = Arc::new(KeyReconciler::new(Keyring::new(KeyringId::main(), store)));
        RecipientResolver::new(reconciler, directory, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn local_keys_win_and_resolution_is_idempotent() {
        let store = Arc::new(MemoryKeyStore::new());
        let a = public_key("a@example.com");
        store.import_or_merge(&a).unwrap();
        let directory = Arc::new(CountingDirectory {
            key: None,
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(store, directory.clone());
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::default()));

        let addrs = vec!["A@Example.com".to_string(), "a@example.com".to_string()];
        let first = resolver.resolve(&addrs, &mut slot).await.unwrap();
        let second = resolver.resolve(&addrs, &mut slot).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first.fingerprints(), vec![a.fingerprint().clone()]);
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_lookup_is_tried_once_and_leaves_address_empty() {
        let directory = Arc::new(CountingDirectory {
            key: None,
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(Arc::new(MemoryKeyStore::new()), directory.clone());
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::default()));

        let map = resolver
            .resolve(&["b@example.com".to_string()], &mut slot)
            .await
            .unwrap();
        assert_eq!(map.unresolved(), vec!["b@example.com".to_string()]);
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn directory_key_is_imported_after_confirmation() {
        let store = Arc::new(MemoryKeyStore::new());
        let b = public_key("b@example.com");
        let directory = Arc::new(CountingDirectory {
            key: Some(b.clone()),
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(store.clone(), directory);
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::new([Scripted::Accept])));

        let map = resolver
            .resolve(&["b@example.com".to_string()], &mut slot)
            .await
            .unwrap();
        assert_eq!(map.fingerprints(), vec![b.fingerprint().clone()]);
        assert!(store.get_by_fingerprint(b.fingerprint()).unwrap().is_some());
    }

    #[tokio::test]
    async fn declined_directory_key_stays_unresolved() {
        let b = public_key("b@example.com");
        let directory = Arc::new(CountingDirectory {
            key: Some(b),
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(Arc::new(MemoryKeyStore::new()), directory);
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::new([Scripted::Decline])));

        let map = resolver
            .resolve(&["b@example.com".to_string()], &mut slot)
            .await
            .unwrap();
        assert_eq!(map.unresolved().len(), 1);
    }

    #[tokio::test]
    async fn key_for_other_address_is_ignored() {
        let directory = Arc::new(CountingDirectory {
            key: Some(public_key("mallory@example.com")),
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(Arc::new(MemoryKeyStore::new()), directory);
        let host = Arc::new(ScriptedSurface::new([Scripted::Accept]));
        let mut slot = PopupSlot::new(host.clone());

        let map = resolver
            .resolve(&["b@example.com".to_string()], &mut slot)
            .await
            .unwrap();
        assert_eq!(map.unresolved().len(), 1);
        assert!(host.requests().is_empty());
    }

    #[tokio::test]
    async fn malformed_address_fails() {
        let resolver = resolver(Arc::new(MemoryKeyStore::new()), Arc::new(NoDirectory));
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::default()));
        let err = resolver
            .resolve(&["not an address".to_string()], &mut slot)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ADDRESS");
    }

    #[test]
    fn fingerprints_are_sorted_and_unique() {
        let a = Fingerprint::parse(&"A".repeat(40)).unwrap();
        let b = Fingerprint::parse(&"B".repeat(40)).unwrap();
        let mut map = BTreeMap::new();
        map.insert("x@e.com".to_string(), BTreeSet::from([b.clone(), a.clone()]));
        map.insert("y@e.com".to_string(), BTreeSet::from([a.clone()]));
        map.insert("z@e.com".to_string(), BTreeSet::new());
        let map = RecipientKeyMap(map);
        assert_eq!(map.fingerprints(), vec![a, b]);
        assert_eq!(map.unresolved(), vec!["z@e.com".to_string()]);
    }
}
