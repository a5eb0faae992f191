//! Turning a stored private key into usable key material.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use age::secrecy::SecretString;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::settings::UnlockSettings;
use crate::error::{Result, SealError};
use crate::keys::cert::{Cert, Fingerprint};
use crate::keys::identity::{dup_secret, UnlockedKey};
use crate::keys::store::KeyringId;
use crate::popup::{PassphrasePrompt, PopupKind, PopupRequest, PopupResponse, PopupSlot, Settled};
use crate::view::ViewSink;

/// Why a key is being unlocked; shown to the user next to the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnlockReason {
    Decrypt,
    Sign,
    CreateDraft,
}

impl std::fmt::Display for UnlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UnlockReason::Decrypt => "decrypt",
            UnlockReason::Sign => "sign",
            UnlockReason::CreateDraft => "create draft",
        })
    }
}

/// Port for remembering passphrases between operations.
pub trait PassphraseCache: Send + Sync {
    fn get(&self, key: &Fingerprint) -> Option<SecretString>;
    fn put(&self, key: &Fingerprint, secret: SecretString, ttl: Duration);
    fn evict(&self, key: &Fingerprint);
}

/// Process-local passphrase cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryPassphraseCache {
    entries: Mutex<HashMap<Fingerprint, (SecretString, Instant)>>,
}

impl MemoryPassphraseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, (SecretString, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PassphraseCache for MemoryPassphraseCache {
    fn get(&self, key: &Fingerprint) -> Option<SecretString> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((secret, expires)) if *expires > Instant::now() => Some(dup_secret(secret)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &Fingerprint, secret: SecretString, ttl: Duration) {
        self.lock()
            .insert(key.clone(), (secret, Instant::now() + ttl));
    }

    fn evict(&self, key: &Fingerprint) {
        self.lock().remove(key);
    }
}

/// Hook that keeps remote copies of a keyring in step after an unlock.
#[async_trait]
pub trait KeySync: Send + Sync {
    async fn sync(&self, keyring: &KeyringId, key: &Fingerprint) -> anyhow::Result<()>;
}

pub struct UnlockRequest<'a> {
    pub cert: &'a Cert,
    pub reason: UnlockReason,
    pub cache_allowed: bool,
}

/// Anything able to hand out unlocked keys. Injected into the composer.
#[async_trait]
pub trait Unlocker: Send + Sync {
    async fn unlock(
        &self,
        request: UnlockRequest<'_>,
        slot: &mut PopupSlot,
    ) -> Result<Arc<UnlockedKey>>;
}

/// Cache-first, prompt-second unlocker.
pub struct UnlockBroker {
    cache: Arc<dyn PassphraseCache>,
    settings: UnlockSettings,
    sync: Option<(KeyringId, Arc<dyn KeySync>)>,
    view: ViewSink,
}

impl UnlockBroker {
    pub fn new(cache: Arc<dyn PassphraseCache>, settings: UnlockSettings) -> Self {
        Self {
            cache,
            settings,
            sync: None,
            view: ViewSink::detached(),
        }
    }

    pub fn with_sync(mut self, keyring: KeyringId, sync: Arc<dyn KeySync>) -> Self {
        self.sync = Some((keyring, sync));
        self
    }

    pub fn with_view(mut self, view: ViewSink) -> Self {
        self.view = view;
        self
    }

    async fn prompt(
        &self,
        request: &UnlockRequest<'_>,
        cache_allowed: bool,
        slot: &mut PopupSlot,
    ) -> Result<UnlockedKey> {
        let cert = request.cert;
        let fp = cert.fingerprint();
        let mut popup = slot.open(PopupKind::Passphrase);

        for retry in 0..self.settings.max_attempts.max(1) {
            let ask = PopupRequest::Passphrase(PassphrasePrompt {
                fingerprint: fp.clone(),
                user_id: cert.primary_user_id(),
                reason: request.reason,
                retry,
            });
            let secret = match popup.ask(ask).await {
                Settled::Responded(PopupResponse::Passphrase(secret)) => secret,
                _ => return Err(SealError::PwdDialogCancel),
            };

            match try_unlock(cert, dup_secret(&secret)).await {
                Ok(key) => {
                    if cache_allowed {
                        self.cache.put(fp, secret, self.settings.cache_ttl());
                    }
                    return Ok(key);
                }
                Err(SealError::BadPassphrase(_)) => {
                    tracing::debug!(key = %fp.key_id(), retry, "wrong passphrase");
                }
                Err(e) => return Err(e),
            }
        }
        Err(SealError::BadPassphrase(fp.clone()))
    }

    fn finish(&self, key: UnlockedKey) -> Arc<UnlockedKey> {
        if let Some((keyring, sync)) = &self.sync {
            let keyring = keyring.clone();
            let sync = sync.clone();
            let fp = key.fingerprint().clone();
            tokio::spawn(async move {
                if let Err(e) = sync.sync(&keyring, &fp).await {
                    tracing::warn!(key = %fp.key_id(), "keyring sync failed: {:#}", e);
                }
            });
        }
        Arc::new(key)
    }
}

#[async_trait]
impl Unlocker for UnlockBroker {
    async fn unlock(
        &self,
        request: UnlockRequest<'_>,
        slot: &mut PopupSlot,
    ) -> Result<Arc<UnlockedKey>> {
        let fp = request.cert.fingerprint();
        if !request.cert.is_private() {
            return Err(SealError::NoDefaultKeyFound(Some(fp.clone())));
        }
        let cache_allowed = request.cache_allowed && self.settings.cache;

        if cache_allowed {
            if let Some(secret) = self.cache.get(fp) {
                match try_unlock(request.cert, secret).await {
                    Ok(key) => {
                        tracing::debug!(
                            key = %fp.key_id(),
                            reason = %request.reason,
                            "unlocked from cache"
                        );
                        return Ok(self.finish(key));
                    }
                    Err(SealError::BadPassphrase(_)) => {
                        tracing::debug!(key = %fp.key_id(), "cached passphrase is stale");
                        self.cache.evict(fp);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let in_modal = slot.is_inside_modal();
        match self.prompt(&request, cache_allowed, slot).await {
            Ok(key) => {
                tracing::debug!(key = %fp.key_id(), reason = %request.reason, "unlocked");
                Ok(self.finish(key))
            }
            Err(e) => {
                // inside a modal the prompt was retracted; the enclosing surface reports
                if !in_modal {
                    self.view.error(&e);
                }
                Err(e)
            }
        }
    }
}

/// scrypt is slow on purpose; keep it off the async workers.
async fn try_unlock(cert: &Cert, secret: SecretString) -> Result<UnlockedKey> {
    let cert = cert.clone();
    tokio::task::spawn_blocking(move || UnlockedKey::unlock(&cert, &secret))
        .await
        .map_err(|e| SealError::DecryptFailed(format!("unlock task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cert::UserId;
    use crate::popup::{Scripted, ScriptedSurface};
    use crate::view::{drain, ViewEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> UnlockSettings {
        UnlockSettings {
            cache: true,
            cache_ttl_secs: 60,
            max_attempts: 2,
            scrypt_work_factor: 10,
        }
    }

    fn own_key(pw: &str) -> Cert {
        let (cert, _) = UnlockedKey::generate(
            &UserId::new("me@example.com", None),
            &SecretString::from(pw.to_string()),
            10,
        )
        .unwrap();
        cert
    }

    fn request(cert: &Cert) -> UnlockRequest<'_> {
        UnlockRequest {
            cert,
            reason: UnlockReason::Sign,
            cache_allowed: true,
        }
    }

    #[tokio::test]
    async fn prompts_then_uses_cache() {
        let cert = own_key("pw");
        let host = Arc::new(ScriptedSurface::new([Scripted::Passphrase("pw".into())]));
        let broker = UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings());
        let mut slot = PopupSlot::new(host.clone());

        let first = broker.unlock(request(&cert), &mut slot).await.unwrap();
        let second = broker.unlock(request(&cert), &mut slot).await.unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        // only the first unlock needed a prompt
        assert_eq!(host.requests().len(), 1);
        match &host.requests()[0] {
            PopupRequest::Passphrase(p) => assert_eq!(p.reason, UnlockReason::Sign),
            other => panic!("unexpected prompt {:?}", other),
        }
    }

    #[tokio::test]
    async fn cache_not_used_when_disallowed() {
        let cert = own_key("pw");
        let host = Arc::new(ScriptedSurface::new([
            Scripted::Passphrase("pw".into()),
            Scripted::Passphrase("pw".into()),
        ]));
        let broker = UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings());
        let mut slot = PopupSlot::new(host.clone());

        broker.unlock(request(&cert), &mut slot).await.unwrap();
        let no_cache = UnlockRequest {
            cache_allowed: false,
            ..request(&cert)
        };
        broker.unlock(no_cache, &mut slot).await.unwrap();
        assert_eq!(host.requests().len(), 2);
    }

    #[tokio::test]
    async fn retries_on_same_surface() {
        let cert = own_key("pw");
        let host = Arc::new(ScriptedSurface::new([
            Scripted::Passphrase("nope".into()),
            Scripted::Passphrase("pw".into()),
        ]));
        let broker = UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings());
        let mut slot = PopupSlot::new(host.clone());

        broker.unlock(request(&cert), &mut slot).await.unwrap();
        let retries: Vec<u32> = host
            .requests()
            .iter()
            .filter_map(|r| match r {
                PopupRequest::Passphrase(p) => Some(p.retry),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![0, 1]);
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test]
    async fn dismissal_is_a_silent_cancel() {
        let cert = own_key("pw");
        let host = Arc::new(ScriptedSurface::new([Scripted::Dismiss]));
        let (view, mut rx) = ViewSink::channel();
        let broker =
            UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings()).with_view(view);
        let mut slot = PopupSlot::new(host);

        let err = broker.unlock(request(&cert), &mut slot).await.unwrap_err();
        assert_eq!(err.code(), "PWD_DIALOG_CANCEL");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_reported_unless_inside_modal() {
        let cert = own_key("pw");
        let wrong = || {
            Arc::new(ScriptedSurface::new([
                Scripted::Passphrase("a".into()),
                Scripted::Passphrase("b".into()),
            ]))
        };
        let (view, mut rx) = ViewSink::channel();
        let broker =
            UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings()).with_view(view);

        let mut slot = PopupSlot::new(wrong());
        let err = broker.unlock(request(&cert), &mut slot).await.unwrap_err();
        assert_eq!(err.code(), "BAD_PASSPHRASE");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ViewEvent::ErrorMessage { code: "BAD_PASSPHRASE", .. }]
        ));

        let host = wrong();
        let mut modal = PopupSlot::new(host.clone()).inside_modal();
        assert!(broker.unlock(request(&cert), &mut modal).await.is_err());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test]
    async fn stale_cache_entry_is_evicted() {
        let cert = own_key("pw");
        let cache = Arc::new(MemoryPassphraseCache::new());
        cache.put(
            cert.fingerprint(),
            SecretString::from("old".to_string()),
            Duration::from_secs(60),
        );
        let host = Arc::new(ScriptedSurface::new([Scripted::Passphrase("pw".into())]));
        let broker = UnlockBroker::new(cache.clone(), settings());
        let mut slot = PopupSlot::new(host.clone());

        broker.unlock(request(&cert), &mut slot).await.unwrap();
        assert_eq!(host.requests().len(), 1);
        // the good passphrase replaced the stale one
        assert!(cache.get(cert.fingerprint()).is_some());
    }

    #[test]
    fn cache_entries_expire() {
        let cache = MemoryPassphraseCache::new();
        let fp = Fingerprint::parse(&"B".repeat(40)).unwrap();
        cache.put(&fp, SecretString::from("x".to_string()), Duration::ZERO);
        assert!(cache.get(&fp).is_none());
    }

    struct CountingSync(AtomicUsize);

    #[async_trait]
    impl KeySync for CountingSync {
        async fn sync(&self, _keyring: &KeyringId, _key: &Fingerprint) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("remote unavailable")
        }
    }

    #[tokio::test]
    async fn sync_failure_does_not_fail_unlock() {
        let cert = own_key("pw");
        let sync = Arc::new(CountingSync(AtomicUsize::new(0)));
        let host = Arc::new(ScriptedSurface::new([Scripted::Passphrase("pw".into())]));
        let broker = UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings())
            .with_sync(KeyringId::main(), sync.clone());
        let mut slot = PopupSlot::new(host);

        assert!(broker.unlock(request(&cert), &mut slot).await.is_ok());
        for _ in 0..50 {
            if sync.0.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sync.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn public_key_cannot_be_unlocked() {
        let cert = own_key("pw").public();
        let broker = UnlockBroker::new(Arc::new(MemoryPassphraseCache::new()), settings());
        let mut slot = PopupSlot::new(Arc::new(ScriptedSurface::default()));
        let err = broker.unlock(request(&cert), &mut slot).await.unwrap_err();
        assert_eq!(err.code(), "NO_DEFAULT_KEY_FOUND");
    }
}
