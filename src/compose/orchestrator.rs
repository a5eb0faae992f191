use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;

use super::payload::Attachment;
use super::session::{
    Action, ComposeRequest, ComposeSession, ComposeState, Composed, SealedAttachment,
};
use crate::config::settings::ComposeSettings;
use crate::crypto::CryptoEngine;
use crate::error::{Result, SealError};
use crate::keys::cert::{Cert, Fingerprint};
use crate::keys::identity::UnlockedKey;
use crate::keys::resolver::RecipientResolver;
use crate::keys::store::Keyring;
use crate::popup::{PopupSlot, SurfaceHost};
use crate::unlock::{UnlockRequest, Unlocker};
use crate::view::{ViewEvent, ViewSink};

/// Drives compose sessions from recipients to finished ciphertext.
pub struct ComposeOrchestrator {
    pub(crate) keyring: Keyring,
    resolver: Arc<RecipientResolver>,
    pub(crate) unlocker: Arc<dyn Unlocker>,
    pub(crate) engine: Arc<dyn CryptoEngine>,
    settings: ComposeSettings,
    pub(crate) view: ViewSink,
}

impl ComposeOrchestrator {
    pub fn new(
        keyring: Keyring,
        resolver: Arc<RecipientResolver>,
        unlocker: Arc<dyn Unlocker>,
        engine: Arc<dyn CryptoEngine>,
        settings: ComposeSettings,
    ) -> Self {
        Self {
            keyring,
            resolver,
            unlocker,
            engine,
            settings,
            view: ViewSink::detached(),
        }
    }

    pub fn with_view(mut self, view: ViewSink) -> Self {
        self.view = view;
        self
    }

    /// Run one compose session to a terminal state.
    ///
    /// Sending on `closed` means the compose surface went away; dropping the
    /// sender does not. Prompts are shown on `host`.
    pub async fn run(
        &self,
        request: ComposeRequest,
        host: Arc<dyn SurfaceHost>,
        closed: oneshot::Receiver<()>,
    ) -> ComposeSession {
        let mut session = ComposeSession::new(self.keyring.id.clone(), request);
        let mut slot = PopupSlot::new(host).with_observer(Arc::new(session.tracker()));

        let closed = async move {
            if closed.await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let result = {
            let drive = self.drive(&mut session, &mut slot);
            tokio::pin!(drive);
            tokio::pin!(closed);
            tokio::select! {
                biased;
                result = &mut drive => Some(result),
                _ = &mut closed => None,
            }
        };

        match result {
            Some(Ok(composed)) => {
                tracing::info!(
                    keyring = %session.keyring(),
                    recipients = composed.fingerprints.len(),
                    attachments = composed.attachments.len(),
                    "message composed"
                );
                session.succeed(composed);
            }
            Some(Err(err)) => {
                self.view.error(&err);
                session.fail(err);
            }
            None => {
                tracing::debug!("compose surface closed");
                session.surface_closed();
                if let Some(super::ComposeOutcome::Failed(err)) = session.outcome() {
                    self.view.error(err);
                }
            }
        }
        session
    }

    async fn drive(&self, session: &mut ComposeSession, slot: &mut PopupSlot) -> Result<Composed> {
        let request = session.request().clone();
        let wants_signature = request.sign || request.action == Action::SignOnly;

        session.enter(ComposeState::ResolvingRecipients);
        if request.action == Action::Encrypt {
            if request.fingerprint_override.is_some() {
                tracing::debug!(keys = session.fingerprints.len(), "recipient keys overridden");
            } else {
                let map = self.resolver.resolve(&request.recipients, slot).await?;
                let unresolved = map.unresolved();
                if !unresolved.is_empty() {
                    return Err(SealError::NoKeyForRecipient(unresolved));
                }
                session.fingerprints = map.fingerprints();
            }
        }

        let signer_cert = if wants_signature {
            Some(self.signing_cert(request.signing_key.as_ref())?)
        } else {
            None
        };

        if request.action == Action::Encrypt {
            if self.settings.auto_add_own_key {
                let own = match &signer_cert {
                    Some(cert) => Some(cert.fingerprint().clone()),
                    None => self.keyring.store.default_signing_fingerprint()?,
                };
                session.fingerprints.extend(own);
            }
            session.fingerprints.sort();
            session.fingerprints.dedup();
            if session.fingerprints.is_empty() {
                return Err(SealError::NoKeyForEncryption);
            }
        }

        let signer = match &signer_cert {
            Some(cert) => {
                session.enter(ComposeState::UnlockingSigningKey);
                let unlock = UnlockRequest {
                    cert,
                    reason: request.unlock_reason,
                    cache_allowed: true,
                };
                Some(self.unlocker.unlock(unlock, slot).await?)
            }
            None => None,
        };

        session.enter(ComposeState::BuildingPayload);
        let mut payload = request.payload.clone();
        if request.reopened_draft {
            payload.quote = None;
        }
        let inline = request.inline_attachments || request.action == Action::SignOnly;
        let body = payload.build(inline)?;

        session.enter(ComposeState::Encrypting);
        self.view.emit(ViewEvent::EncryptInProgress);

        match request.action {
            Action::SignOnly => {
                let key = signer.ok_or(SealError::NoDefaultKeyFound(None))?;
                let signer_fp = key.fingerprint().clone();
                let message = self.engine.sign(body, key).await?;
                Ok(Composed {
                    message,
                    fingerprints: Vec::new(),
                    signer: Some(signer_fp),
                    attachments: Vec::new(),
                })
            }
            Action::Encrypt => {
                let fingerprints = session.fingerprints.clone();
                let message = self
                    .engine
                    .encrypt(body, &fingerprints, signer.clone())
                    .await?;
                let attachments = if inline {
                    Vec::new()
                } else {
                    self.encrypt_attachments(session, payload.attachments, signer.clone())
                        .await?
                };
                Ok(Composed {
                    message,
                    fingerprints,
                    signer: signer.map(|k| k.fingerprint().clone()),
                    attachments,
                })
            }
        }
    }

    /// Encrypt every attachment on its own, at most `max_parallel_attachments`
    /// at a time. All of them finish before failures are reported together.
    async fn encrypt_attachments(
        &self,
        session: &mut ComposeSession,
        attachments: Vec<Attachment>,
        signer: Option<Arc<UnlockedKey>>,
    ) -> Result<Vec<SealedAttachment>> {
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel_attachments.max(1)));
        let mut tasks = JoinSet::new();
        let count = attachments.len();

        for (index, attachment) in attachments.into_iter().enumerate() {
            let engine = self.engine.clone();
            let fingerprints = session.fingerprints.clone();
            let signer = signer.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        engine
                            .encrypt(attachment.content, &fingerprints, signer)
                            .await
                    }
                    Err(e) => Err(SealError::EncryptFailed(e.to_string())),
                };
                (index, attachment.name, result)
            });
        }

        let mut sealed: Vec<(usize, SealedAttachment)> = Vec::with_capacity(count);
        let mut failures: Vec<(usize, String, String)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, name, Ok(armored))) => {
                    tracing::debug!(attachment = %name, "attachment encrypted");
                    sealed.push((index, SealedAttachment { name, armored }));
                }
                Ok((index, name, Err(err))) => {
                    tracing::warn!(attachment = %name, "attachment failed: {}", err);
                    failures.push((index, name, err.to_string()));
                }
                Err(e) => failures.push((usize::MAX, "<attachment>".into(), e.to_string())),
            }
            if !failures.is_empty() {
                session.pending_failure = Some(aggregate(&mut failures));
            }
        }

        if let Some(err) = session.pending_failure.take() {
            return Err(err);
        }
        sealed.sort_by_key(|(index, _)| *index);
        Ok(sealed.into_iter().map(|(_, a)| a).collect())
    }

    /// An explicit override, else the keyring default. Must hold a secret half.
    pub(crate) fn signing_cert(&self, override_fp: Option<&Fingerprint>) -> Result<Cert> {
        let fp = match override_fp {
            Some(fp) => fp.clone(),
            None => self
                .keyring
                .store
                .default_signing_fingerprint()?
                .ok_or(SealError::NoDefaultKeyFound(None))?,
        };
        match self.keyring.store.get_by_fingerprint(&fp)? {
            Some(cert) if cert.is_private() => Ok(cert),
            _ => Err(SealError::NoDefaultKeyFound(Some(fp))),
        }
    }
}

fn aggregate(failures: &mut [(usize, String, String)]) -> SealError {
    failures.sort_by_key(|(index, _, _)| *index);
    SealError::AttachmentsFailed(
        failures
            .iter()
            .map(|(_, name, reason)| (name.clone(), reason.clone()))
            .collect(),
    )
}
