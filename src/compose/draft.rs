//! Self-encrypted drafts and reading received messages.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::orchestrator::ComposeOrchestrator;
use super::payload::Payload;
use super::session::{ComposeRequest, ComposeSession};
use crate::crypto::Decrypted;
use crate::error::{Result, SealError};
use crate::keys::cert::{Cert, Fingerprint};
use crate::popup::{PopupSlot, SurfaceHost};
use crate::unlock::{UnlockReason, UnlockRequest};
use crate::view::ViewEvent;

/// A decrypted message together with its parsed payload, when it has one.
#[derive(Debug, Clone)]
pub struct OpenedMessage {
    pub decrypted: Decrypted,
    pub payload: Option<Payload>,
}

impl ComposeOrchestrator {
    /// Save `payload` as a draft encrypted only to the sender's own key.
    pub async fn save_draft(
        &self,
        payload: Payload,
        signing_key: Option<Fingerprint>,
        host: Arc<dyn SurfaceHost>,
        closed: oneshot::Receiver<()>,
    ) -> ComposeSession {
        let own = self
            .signing_cert(signing_key.as_ref())
            .map(|cert| vec![cert.fingerprint().clone()])
            .unwrap_or_default();

        let mut request = ComposeRequest::encrypt(Vec::new(), payload);
        request.fingerprint_override = Some(own);
        request.signing_key = signing_key;
        request.inline_attachments = true;
        request.unlock_reason = UnlockReason::CreateDraft;
        self.run(request, host, closed).await
    }

    /// Decrypt a saved draft and push its contents to the view.
    ///
    /// The draft must carry exactly one signature, valid and made by one of
    /// our own keys. Nothing reaches the view otherwise.
    pub async fn restore_draft(&self, armored: &str, slot: &mut PopupSlot) -> Result<Payload> {
        self.view.emit(ViewEvent::DecryptInProgress);
        let result = self.open_draft(armored, slot).await;
        match &result {
            Ok(payload) => self.show(payload),
            Err(err) => self.view.error(err),
        }
        result
    }

    async fn open_draft(&self, armored: &str, slot: &mut PopupSlot) -> Result<Payload> {
        let decrypted = self.decrypt_with_own_key(armored, slot).await?;

        if decrypted.signatures.len() != 1 {
            return Err(SealError::DraftCorrupted(format!(
                "expected one signature, found {}",
                decrypted.signatures.len()
            )));
        }
        let sig = &decrypted.signatures[0];
        if !sig.valid || self.own_key(&sig.signer)?.is_none() {
            return Err(SealError::DraftCorrupted(format!(
                "draft is not signed by a key of this keyring ({})",
                sig.signer.key_id()
            )));
        }

        Payload::parse(&decrypted.plaintext).map_err(|e| SealError::DraftCorrupted(e.to_string()))
    }

    /// Decrypt a received message and show it.
    pub async fn open_message(&self, armored: &str, slot: &mut PopupSlot) -> Result<OpenedMessage> {
        self.view.emit(ViewEvent::DecryptInProgress);
        let result = self.decrypt_with_own_key(armored, slot).await;
        match result {
            Ok(decrypted) => {
                let payload = Payload::parse(&decrypted.plaintext).ok();
                match &payload {
                    Some(payload) => self.show(payload),
                    None => self.view.emit(ViewEvent::SetText(
                        String::from_utf8_lossy(&decrypted.plaintext).into_owned(),
                    )),
                }
                Ok(OpenedMessage { decrypted, payload })
            }
            Err(err) => {
                self.view.error(&err);
                Err(err)
            }
        }
    }

    async fn decrypt_with_own_key(&self, armored: &str, slot: &mut PopupSlot) -> Result<Decrypted> {
        let recipients = self.engine.recipients(armored)?;
        let cert = self.decryption_cert(&recipients)?;
        let key = self
            .unlocker
            .unlock(
                UnlockRequest {
                    cert: &cert,
                    reason: UnlockReason::Decrypt,
                    cache_allowed: true,
                },
                slot,
            )
            .await?;
        self.engine.decrypt(armored, key).await
    }

    /// The default signing key when addressed, else the first own key that is.
    fn decryption_cert(&self, recipients: &[Fingerprint]) -> Result<Cert> {
        let store = &self.keyring.store;
        if let Some(default) = store.default_signing_fingerprint()? {
            if recipients.contains(&default) {
                if let Some(cert) = self.own_key(&default)? {
                    return Ok(cert);
                }
            }
        }
        for fp in recipients {
            if let Some(cert) = self.own_key(fp)? {
                return Ok(cert);
            }
        }
        Err(SealError::DecryptFailed(
            "message is not addressed to any key in this keyring".into(),
        ))
    }

    fn own_key(&self, fp: &Fingerprint) -> Result<Option<Cert>> {
        Ok(self
            .keyring
            .store
            .get_by_fingerprint(fp)?
            .filter(Cert::is_private))
    }

    fn show(&self, payload: &Payload) {
        self.view.emit(ViewEvent::SetText(payload.body.clone()));
        for attachment in &payload.attachments {
            self.view.emit(ViewEvent::SetAttachment {
                name: attachment.name.clone(),
                content: attachment.content.clone(),
            });
        }
    }
}
