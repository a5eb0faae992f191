//! Deciding how an incoming public key affects the trusted store.
//!
//! [`KeyReconciler::reconcile`] is pure: it compares a stored record with a
//! hypothetical merge and never writes. [`KeyReconciler::apply`] is the only
//! place in the crate that mutates a keyring on behalf of someone else's key,
//! and [`KeyReconciler::import`] serializes both steps per fingerprint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use super::cert::{Cert, Fingerprint, Validity};
use super::store::{ImportStatus, Keyring};
use crate::error::{Result, SealError};
use crate::popup::{
    ImportPrompt, PopupKind, PopupRequest, PopupResponse, PopupSlot, Settled, TrustChange,
};
use crate::view::{ViewEvent, ViewSink};

/// Where a candidate key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Import,
    Rotation,
    Directory,
}

/// An unverified public key on its way into the store.
#[derive(Debug, Clone)]
pub struct CandidateKey {
    cert: Cert,
    source: KeySource,
}

impl CandidateKey {
    /// Parse an armored key. Only public keys pass this boundary.
    pub fn from_armored(text: &str, source: KeySource) -> Result<Self> {
        let cert = Cert::from_armored(text).map_err(|e| match e {
            SealError::InvalidKey(msg) | SealError::InvalidMessage(msg) => {
                SealError::ImportError(msg)
            }
            other => other,
        })?;
        Self::from_cert(cert, source)
    }

    pub fn from_cert(cert: Cert, source: KeySource) -> Result<Self> {
        if cert.is_private() {
            return Err(SealError::PrivateKeyRejected);
        }
        Ok(Self { cert, source })
    }

    pub fn cert(&self) -> &Cert {
        &self.cert
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.cert.fingerprint()
    }

    pub fn source(&self) -> KeySource {
        self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    FreshImport,
    SilentUpdate,
    /// Validity differs before and after the merge.
    /// `invalidated` is set when the merged key would no longer be valid.
    ConfirmRequired {
        invalidated: bool,
    },
    Rejected,
    Updated,
}

/// Terminal outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Imported,
    Updated,
    Rejected,
    Invalidated,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Imported => "IMPORTED",
            Outcome::Updated => "UPDATED",
            Outcome::Rejected => "REJECTED",
            Outcome::Invalidated => "INVALIDATED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    pub outcome: Outcome,
    pub trust_changed: bool,
    /// Whether the store was written.
    pub mutated: bool,
}

impl ApplyResult {
    fn new(outcome: Outcome, trust_changed: bool, mutated: bool) -> Self {
        Self {
            outcome,
            trust_changed,
            mutated,
        }
    }
}

/// A decision together with everything needed to apply it.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub decision: Decision,
    pub candidate: CandidateKey,
    pub stored: Option<Cert>,
    /// The hypothetical merged key; absent for fresh imports and rejections.
    pub merged: Option<Cert>,
    pub before: Option<Validity>,
    pub after: Validity,
}

/// Serializes reconciliation per fingerprint and owns store writes.
pub struct KeyReconciler {
    keyring: Keyring,
    view: ViewSink,
    locks: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyReconciler {
    pub fn new(keyring: Keyring) -> Self {
        Self {
            keyring,
            view: ViewSink::detached(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_view(mut self, view: ViewSink) -> Self {
        self.view = view;
        self
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Compare `stored` against its merge with `candidate`. Never writes.
    pub fn reconcile(candidate: CandidateKey, stored: Option<Cert>) -> Reconciliation {
        Self::reconcile_at(candidate, stored, Utc::now())
    }

    pub fn reconcile_at(
        candidate: CandidateKey,
        stored: Option<Cert>,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let Some(stored) = stored else {
            let after = candidate.cert.validity_at(now);
            return Reconciliation {
                decision: Decision::FreshImport,
                candidate,
                stored: None,
                merged: None,
                before: None,
                after,
            };
        };

        let before = stored.validity_at(now);
        let merged = match stored.merge(&candidate.cert) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::debug!("candidate does not merge into stored key: {}", e);
                return Reconciliation {
                    decision: Decision::Rejected,
                    candidate,
                    stored: Some(stored),
                    merged: None,
                    before: Some(before),
                    after: before,
                };
            }
        };
        let after = merged.validity_at(now);

        let decision = if before != after {
            Decision::ConfirmRequired {
                invalidated: after != Validity::Valid,
            }
        } else if merged.last_modified() != stored.last_modified()
            || merged.user_ids() != stored.user_ids()
        {
            Decision::SilentUpdate
        } else {
            Decision::Updated
        };

        Reconciliation {
            decision,
            candidate,
            stored: Some(stored),
            merged: Some(merged),
            before: Some(before),
            after,
        }
    }

    /// Carry out a decision, asking the user through `slot` where required.
    pub async fn apply(
        &self,
        rec: &Reconciliation,
        slot: &mut PopupSlot,
    ) -> Result<ApplyResult> {
        let fp = rec.candidate.fingerprint();
        match rec.decision {
            Decision::FreshImport => {
                let replaces = self.replaced_keys(&rec.candidate)?;
                let mut popup = slot.open(PopupKind::ImportConfirm);
                let accepted = confirmed(
                    popup
                        .ask(self.prompt(rec, TrustChange::NewKey, replaces))
                        .await,
                );
                if !accepted {
                    tracing::debug!(key = %fp.key_id(), "import declined");
                    return Ok(ApplyResult::new(Outcome::Rejected, false, false));
                }
                // an import error drops the popup and closes its surface
                self.commit(&rec.candidate)?;
                Ok(ApplyResult::new(Outcome::Imported, true, true))
            }
            Decision::SilentUpdate => {
                self.commit(&rec.candidate)?;
                Ok(ApplyResult::new(Outcome::Updated, false, true))
            }
            Decision::Updated => Ok(ApplyResult::new(Outcome::Updated, false, false)),
            Decision::Rejected => {
                if rec.stored.is_some() {
                    self.view.error(&SealError::TrustConflict(fp.clone()));
                }
                Ok(ApplyResult::new(Outcome::Rejected, false, false))
            }
            Decision::ConfirmRequired { invalidated } => {
                let change = if invalidated {
                    TrustChange::Losing
                } else {
                    TrustChange::Gaining
                };
                let mut popup = slot.open(PopupKind::ImportConfirm);
                let accepted = confirmed(popup.ask(self.prompt(rec, change, vec![])).await);

                if invalidated {
                    // acknowledging a downgrade still keeps the old key
                    tracing::info!(
                        key = %fp.key_id(),
                        accepted,
                        "trust-downgrading update not applied"
                    );
                    return Ok(ApplyResult::new(Outcome::Invalidated, true, false));
                }
                if !accepted {
                    return Ok(ApplyResult::new(Outcome::Rejected, false, false));
                }
                self.commit(&rec.candidate)?;
                Ok(ApplyResult::new(Outcome::Updated, true, true))
            }
        }
    }

    /// Reconcile and apply `candidate` while holding its fingerprint lock.
    pub async fn import(
        &self,
        candidate: CandidateKey,
        slot: &mut PopupSlot,
    ) -> Result<ApplyResult> {
        let fp = candidate.fingerprint().clone();
        let _guard = self.lock_key(&fp).await;

        let result = async {
            let stored = self
                .keyring
                .store
                .get_by_fingerprint(&fp)
                .map_err(|e| SealError::ImportError(e.to_string()))?;
            let rec = Self::reconcile(candidate, stored);
            tracing::debug!(
                key = %fp.key_id(),
                source = ?rec.candidate.source(),
                decision = ?rec.decision,
                before = ?rec.before,
                after = %rec.after,
                "reconciled key"
            );
            self.apply(&rec, slot).await
        }
        .await;

        match &result {
            Ok(applied) => {
                if applied.mutated {
                    tracing::info!(
                        key = %fp.key_id(),
                        outcome = %applied.outcome,
                        keyring = %self.keyring.id,
                        "key store updated"
                    );
                }
                self.view.emit(ViewEvent::KeyUpdate {
                    fingerprint: fp,
                    outcome: applied.outcome,
                });
            }
            Err(e) => self.view.error(e),
        }
        result
    }

    /// Store one of the user's own keys. Private material is allowed here.
    pub async fn install_own_key(&self, cert: &Cert) -> Result<ImportStatus> {
        let _guard = self.lock_key(cert.fingerprint()).await;
        let status = self.keyring.store.import_or_merge(cert)?;
        tracing::info!(key = %cert.fingerprint().key_id(), ?status, "own key stored");
        Ok(status)
    }

    /// Drop a key from the keyring. Returns whether it was present.
    pub async fn remove_key(&self, fp: &Fingerprint) -> Result<bool> {
        let _guard = self.lock_key(fp).await;
        let removed = self.keyring.store.remove(fp)?;
        if removed {
            tracing::info!(key = %fp.key_id(), keyring = %self.keyring.id, "key removed");
        }
        Ok(removed)
    }

    /// Make one of the user's own keys the default signing key.
    pub async fn set_default_key(&self, fp: &Fingerprint) -> Result<()> {
        let _guard = self.lock_key(fp).await;
        match self.keyring.store.get_by_fingerprint(fp)? {
            Some(cert) if cert.is_private() => {}
            _ => return Err(SealError::NoDefaultKeyFound(Some(fp.clone()))),
        }
        self.keyring.store.set_default_signing(fp)?;
        tracing::info!(key = %fp.key_id(), keyring = %self.keyring.id, "default signing key set");
        Ok(())
    }

    fn commit(&self, candidate: &CandidateKey) -> Result<ImportStatus> {
        self.keyring
            .store
            .import_or_merge(candidate.cert())
            .map_err(|e| SealError::ImportError(e.to_string()))
    }

    /// Stored keys for the same addresses under a different fingerprint.
    fn replaced_keys(&self, candidate: &CandidateKey) -> Result<Vec<Fingerprint>> {
        let mut replaced = Vec::new();
        for uid in candidate.cert().user_ids() {
            let stored = self
                .keyring
                .store
                .get_by_address(&uid.address)
                .map_err(|e| SealError::ImportError(e.to_string()))?;
            for cert in stored {
                if cert.fingerprint() != candidate.fingerprint()
                    && !replaced.contains(cert.fingerprint())
                {
                    replaced.push(cert.fingerprint().clone());
                }
            }
        }
        replaced.sort();
        if !replaced.is_empty() {
            tracing::debug!(
                key = %candidate.fingerprint().key_id(),
                ?replaced,
                "possible key rotation"
            );
        }
        Ok(replaced)
    }

    fn prompt(
        &self,
        rec: &Reconciliation,
        change: TrustChange,
        replaces: Vec<Fingerprint>,
    ) -> PopupRequest {
        let shown = rec.merged.as_ref().unwrap_or(rec.candidate.cert());
        PopupRequest::ImportConfirm(ImportPrompt {
            fingerprint: rec.candidate.fingerprint().clone(),
            user_ids: shown.user_ids(),
            before: rec.before,
            after: rec.after,
            change,
            replaces,
            revocation_reason: shown.revocation_reason().map(str::to_string),
        })
    }

    async fn lock_key(&self, fp: &Fingerprint) -> KeyLock<'_> {
        let lock = self.locks().entry(fp.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        KeyLock {
            reconciler: self,
            fingerprint: fp.clone(),
            guard: Some(guard),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Holds one fingerprint's lock; forgets the lock once nobody else wants it.
struct KeyLock<'a> {
    reconciler: &'a KeyReconciler,
    fingerprint: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.reconciler.locks();
        if locks
            .get(&self.fingerprint)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.fingerprint);
        }
    }
}

fn confirmed(settled: Settled) -> bool {
    matches!(settled, Settled::Responded(PopupResponse::Confirm(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cert::UserId;
    use crate::keys::identity::UnlockedKey;
    use crate::keys::store::{KeyStore, KeyringId, MemoryKeyStore};
    use crate::popup::{Scripted, ScriptedSurface};
    use age::secrecy::SecretString;

    fn own(address: &str) -> (Cert, UnlockedKey) {
        UnlockedKey::generate(
            &UserId::new(address, None),
            &SecretString::from("pw".to_string()),
            10,
        )
        .unwrap()
    }

    fn candidate(cert: &Cert) -> CandidateKey {
        CandidateKey::from_cert(cert.public(), KeySource::Import).unwrap()
    }

    #[test]
    fn private_candidates_are_refused() {
        let (cert, _) = own("a@example.com");
        let err = CandidateKey::from_cert(cert.clone(), KeySource::Import).unwrap_err();
        assert_eq!(err, SealError::PrivateKeyRejected);
        let err =
            CandidateKey::from_armored(&cert.to_armored(), KeySource::Directory).unwrap_err();
        assert_eq!(err, SealError::PrivateKeyRejected);
    }

    #[test]
    fn garbage_is_an_import_error() {
        let err = CandidateKey::from_armored("not a key", KeySource::Import).unwrap_err();
        assert_eq!(err.code(), "IMPORT_ERROR");
    }

    #[test]
    fn decisions() {
        let (cert, key) = own("a@example.com");
        let public = cert.public();

        let fresh = KeyReconciler::reconcile(candidate(&cert), None);
        assert_eq!(fresh.decision, Decision::FreshImport);

        let same = KeyReconciler::reconcile(candidate(&cert), Some(public.clone()));
        assert_eq!(same.decision, Decision::Updated);

        let extra = key
            .add_user_id(&public, &UserId::new("alt@example.com", None))
            .unwrap();
        let silent = KeyReconciler::reconcile(candidate(&extra), Some(public.clone()));
        assert_eq!(silent.decision, Decision::SilentUpdate);

        let revoked = key.revoke(&public, "compromised").unwrap();
        let downgrade = KeyReconciler::reconcile(candidate(&revoked), Some(public.clone()));
        assert_eq!(
            downgrade.decision,
            Decision::ConfirmRequired { invalidated: true }
        );
        assert_eq!(downgrade.before, Some(Validity::Valid));
        assert_eq!(downgrade.after, Validity::Invalid);

        let (other, _) = own("a@example.com");
        let mismatch = KeyReconciler::reconcile(candidate(&other), Some(public));
        assert_eq!(mismatch.decision, Decision::Rejected);
    }

    fn reconciler() -> (KeyReconciler, Arc<MemoryKeyStore>) {
        let store = Arc::new(MemoryKeyStore::new());
        let keyring = Keyring::new(KeyringId::main(), store.clone());
        (KeyReconciler::new(keyring), store)
    }

    #[tokio::test]
    async fn fresh_import_needs_confirmation() {
        let (cert, _) = own("a@example.com");
        let (reconciler, store) = reconciler();

        let host = Arc::new(ScriptedSurface::new([Scripted::Decline, Scripted::Accept]));
        let mut slot = PopupSlot::new(host.clone());

        let declined = reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        assert_eq!(declined.outcome, Outcome::Rejected);
        assert_eq!(store.write_count(), 0);

        let accepted = reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        assert_eq!(accepted.outcome, Outcome::Imported);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(host.close_count(), 2);
    }

    #[tokio::test]
    async fn closed_prompt_rejects_import() {
        let (cert, _) = own("a@example.com");
        let (reconciler, store) = reconciler();
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::new([Scripted::Dismiss])));

        let result = reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        assert_eq!(result.outcome, Outcome::Rejected);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_update_commits_without_prompt() {
        let (cert, key) = own("a@example.com");
        let (reconciler, store) = reconciler();
        store.import_or_merge(&cert.public()).unwrap();

        let extra = key
            .add_user_id(&cert.public(), &UserId::new("alt@example.com", None))
            .unwrap();
        let host = Arc::new(ScriptedSurface::default());
        let mut slot = PopupSlot::new(host.clone());
        let result = reconciler.import(candidate(&extra), &mut slot).await.unwrap();

        assert_eq!(result, ApplyResult::new(Outcome::Updated, false, true));
        assert!(host.requests().is_empty());
        let stored = store.get_by_fingerprint(cert.fingerprint()).unwrap().unwrap();
        assert!(stored.has_address("alt@example.com"));
    }

    #[tokio::test]
    async fn unchanged_key_is_not_written() {
        let (cert, _) = own("a@example.com");
        let (reconciler, store) = reconciler();
        store.import_or_merge(&cert.public()).unwrap();
        let writes = store.write_count();

        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::default()));
        let result = reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        assert_eq!(result, ApplyResult::new(Outcome::Updated, false, false));
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn downgrade_keeps_old_key_either_way() {
        let (cert, key) = own("a@example.com");
        let revoked = key.revoke(&cert.public(), "lost").unwrap();

        for answer in [Scripted::Accept, Scripted::Decline, Scripted::Dismiss] {
            let (reconciler, store) = reconciler();
            store.import_or_merge(&cert.public()).unwrap();
            let host = Arc::new(ScriptedSurface::new([answer]));
            let mut slot = PopupSlot::new(host.clone());

            let result = reconciler.import(candidate(&revoked), &mut slot).await.unwrap();
            assert_eq!(result.outcome, Outcome::Invalidated);
            let stored = store.get_by_fingerprint(cert.fingerprint()).unwrap().unwrap();
            assert_eq!(stored.validity(), Validity::Valid);

            match &host.requests()[0] {
                PopupRequest::ImportConfirm(p) => {
                    assert_eq!(p.change, TrustChange::Losing);
                    assert_eq!(p.revocation_reason.as_deref(), Some("lost"));
                }
                other => panic!("unexpected prompt {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn rotation_lists_replaced_keys() {
        let (old, _) = own("a@example.com");
        let (new, _) = own("a@example.com");
        let (reconciler, store) = reconciler();
        store.import_or_merge(&old.public()).unwrap();

        let host = Arc::new(ScriptedSurface::new([Scripted::Accept]));
        let mut slot = PopupSlot::new(host.clone());
        let rotated = CandidateKey::from_cert(new.public(), KeySource::Rotation).unwrap();
        reconciler.import(rotated, &mut slot).await.unwrap();

        match &host.requests()[0] {
            PopupRequest::ImportConfirm(p) => {
                assert_eq!(p.replaces, vec![old.fingerprint().clone()]);
            }
            other => panic!("unexpected prompt {:?}", other),
        }
    }

    #[tokio::test]
    async fn locks_are_forgotten_after_use() {
        let (cert, _) = own("a@example.com");
        let (reconciler, _) = reconciler();
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::new([Scripted::Accept])));

        reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        reconciler.install_own_key(&cert).await.unwrap();
        reconciler.remove_key(cert.fingerprint()).await.unwrap();
        assert!(reconciler.locks().is_empty());
    }

    #[tokio::test]
    async fn held_lock_outlives_other_fingerprints() {
        let (a, _) = own("a@example.com");
        let (b, _) = own("b@example.com");
        let (reconciler, _) = reconciler();
        let held = reconciler.lock_key(a.fingerprint()).await;

        reconciler.install_own_key(&b).await.unwrap();
        assert_eq!(reconciler.locks().len(), 1);
        assert!(reconciler.locks().contains_key(a.fingerprint()));
        drop(held);
        assert!(reconciler.locks().is_empty());
    }

    #[tokio::test]
    async fn import_reports_key_update() {
        let (cert, _) = own("a@example.com");
        let store = Arc::new(MemoryKeyStore::new());
        let (view, mut rx) = ViewSink::channel();
        let reconciler =
            KeyReconciler::new(Keyring::new(KeyringId::main(), store)).with_view(view);
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::new([Scripted::Accept])));

        reconciler.import(candidate(&cert), &mut slot).await.unwrap();
        assert_eq!(
            crate::view::drain(&mut rx),
            vec![ViewEvent::KeyUpdate {
                fingerprint: cert.fingerprint().clone(),
                outcome: Outcome::Imported,
            }]
        );
    }
}
