use std::sync::Arc;

use async_trait::async_trait;

use super::envelope::{SealedMessage, SignedEnvelope};
use super::{armor, CryptoEngine, Decrypted};
use crate::error::{Result, SealError};
use crate::keys::cert::Fingerprint;
use crate::keys::identity::UnlockedKey;
use crate::keys::reconcile::{CandidateKey, KeySource};
use crate::keys::store::KeyStore;

/// age X25519 encryption with ed25519 signatures, keys taken from a store.
pub struct AgeEngine {
    store: Arc<dyn KeyStore>,
}

impl AgeEngine {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    fn recipient_keys(
        &self,
        fps: &[Fingerprint],
    ) -> Result<Vec<(Fingerprint, age::x25519::Recipient)>> {
        fps.iter()
            .map(|fp| {
                let cert = self
                    .store
                    .get_by_fingerprint(fp)?
                    .ok_or_else(|| SealError::EncryptFailed(format!("no key {} in keyring", fp)))?;
                Ok((fp.clone(), cert.age_recipient()?))
            })
            .collect()
    }
}

/// Run CPU-bound crypto off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SealError::EncryptFailed(format!("crypto task failed: {}", e)))?
}

#[async_trait]
impl CryptoEngine for AgeEngine {
    async fn encrypt(
        &self,
        data: Vec<u8>,
        recipients: &[Fingerprint],
        signer: Option<Arc<UnlockedKey>>,
    ) -> Result<String> {
        if recipients.is_empty() {
            return Err(SealError::NoKeyForEncryption);
        }
        let keys = self.recipient_keys(recipients)?;
        blocking(move || {
            let envelope = SignedEnvelope::seal(&data, signer.as_deref());
            let sealed = SealedMessage::seal(&envelope, &keys)?;
            Ok(armor::encode(armor::MESSAGE, &sealed.to_bytes()?))
        })
        .await
    }

    async fn decrypt(&self, ciphertext: &str, key: Arc<UnlockedKey>) -> Result<Decrypted> {
        let sealed = SealedMessage::from_bytes(&armor::decode(armor::MESSAGE, ciphertext)?)?;
        let envelope = blocking(move || sealed.open(&key)).await?;
        Ok(Decrypted {
            plaintext: envelope.payload()?,
            signatures: envelope.check(self.store.as_ref())?,
        })
    }

    async fn sign(&self, data: Vec<u8>, key: Arc<UnlockedKey>) -> Result<String> {
        blocking(move || {
            let envelope = SignedEnvelope::seal(&data, Some(&key));
            let bytes = envelope
                .to_bytes()
                .map_err(|e| SealError::SignFailed(e.to_string()))?;
            Ok(armor::encode(armor::SIGNED_MESSAGE, &bytes))
        })
        .await
    }

    async fn verify(&self, signed: &str) -> Result<Decrypted> {
        let envelope = SignedEnvelope::from_bytes(&armor::decode(armor::SIGNED_MESSAGE, signed)?)?;
        Ok(Decrypted {
            plaintext: envelope.payload()?,
            signatures: envelope.check(self.store.as_ref())?,
        })
    }

    fn parse_key(&self, armored: &str) -> Result<CandidateKey> {
        CandidateKey::from_armored(armored, KeySource::Import)
    }

    fn recipients(&self, ciphertext: &str) -> Result<Vec<Fingerprint>> {
        let sealed = SealedMessage::from_bytes(&armor::decode(armor::MESSAGE, ciphertext)?)?;
        Ok(sealed.recipients)
    }
}
