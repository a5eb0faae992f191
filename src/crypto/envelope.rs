//! Wire formats for signed and encrypted messages.
//!
//! A [`SignedEnvelope`] carries the payload and its detached ed25519
//! signatures. For encryption the serialized envelope is age-encrypted to
//! every recipient and wrapped in a [`SealedMessage`] that lists recipient
//! fingerprints so the reader knows which private key to unlock.

use std::io::{Read, Write};

use base64::Engine;
use chrono::{DateTime, SubsecRound, Utc};
use ed25519_dalek::{Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::SignatureCheck;
use crate::error::{Result, SealError};
use crate::keys::cert::{Fingerprint, Validity};
use crate::keys::identity::UnlockedKey;
use crate::keys::store::KeyStore;

const VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub version: u32,
    /// Base64 payload.
    pub payload: String,
    /// Hex SHA-256 of the decoded payload.
    pub sha256: String,
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub signer: Fingerprint,
    pub created: DateTime<Utc>,
    /// Base64 ed25519 signature over the signed message.
    pub signature: String,
}

impl SignedEnvelope {
    /// Wrap `payload`, signing it with `signer` when given.
    pub fn seal(payload: &[u8], signer: Option<&UnlockedKey>) -> Self {
        let sha256 = hex::encode(Sha256::digest(payload));
        let signatures = signer
            .map(|key| {
                let created = Utc::now().trunc_subsecs(0);
                let msg = signed_message(key.fingerprint(), created, &sha256);
                EnvelopeSignature {
                    signer: key.fingerprint().clone(),
                    created,
                    signature: base64::engine::general_purpose::STANDARD
                        .encode(key.signing_key().sign(&msg).to_bytes()),
                }
            })
            .into_iter()
            .collect();

        Self {
            version: VERSION,
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            sha256,
            signatures,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SealError::InvalidMessage(format!("failed to serialize envelope: {}", e)))
    }

    /// Deserialize and check payload integrity.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(data)
            .map_err(|e| SealError::InvalidMessage(format!("malformed envelope: {}", e)))?;
        if envelope.version != VERSION {
            return Err(SealError::InvalidMessage(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        let payload = envelope.payload()?;
        if hex::encode(Sha256::digest(&payload)) != envelope.sha256 {
            return Err(SealError::InvalidMessage(
                "integrity check failed: payload hash mismatch".into(),
            ));
        }
        Ok(envelope)
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.payload)
            .map_err(|_| SealError::InvalidMessage("invalid base64 payload".into()))
    }

    /// Check every signature against keys in `store`.
    /// Signers missing from the store, or whose key is no longer valid, check as invalid.
    pub fn check(&self, store: &dyn KeyStore) -> Result<Vec<SignatureCheck>> {
        let mut checks = Vec::with_capacity(self.signatures.len());
        for sig in &self.signatures {
            let valid = match store.get_by_fingerprint(&sig.signer)? {
                Some(cert) if cert.validity() != Validity::Invalid => {
                    let msg = signed_message(&sig.signer, sig.created, &self.sha256);
                    verify_one(&cert.verifying_key()?, &msg, &sig.signature)
                }
                Some(_) => false,
                None => {
                    tracing::debug!(signer = %sig.signer.key_id(), "signature from unknown key");
                    false
                }
            };
            checks.push(SignatureCheck {
                signer: sig.signer.clone(),
                valid,
            });
        }
        Ok(checks)
    }
}

fn signed_message(signer: &Fingerprint, created: DateTime<Utc>, sha256: &str) -> Vec<u8> {
    format!(
        "sealpost-message\n{}\n{}\n{}",
        signer,
        created.timestamp(),
        sha256
    )
    .into_bytes()
}

fn verify_one(key: &ed25519_dalek::VerifyingKey, msg: &[u8], sig_b64: &str) -> bool {
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(sig_b64) else {
        return false;
    };
    let Ok(array) = <[u8; 64]>::try_from(bytes) else {
        return false;
    };
    key.verify(msg, &Signature::from_bytes(&array)).is_ok()
}

/// An age-encrypted [`SignedEnvelope`] plus recipient hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessage {
    pub version: u32,
    pub recipients: Vec<Fingerprint>,
    /// Base64 age ciphertext.
    pub ciphertext: String,
}

impl SealedMessage {
    pub fn seal(
        envelope: &SignedEnvelope,
        recipients: &[(Fingerprint, age::x25519::Recipient)],
    ) -> Result<Self> {
        if recipients.is_empty() {
            return Err(SealError::NoKeyForEncryption);
        }
        let ciphertext = age_encrypt_multi(
            &envelope.to_bytes()?,
            recipients.iter().map(|(_, r)| r),
        )?;
        Ok(Self {
            version: VERSION,
            recipients: recipients.iter().map(|(fp, _)| fp.clone()).collect(),
            ciphertext: base64::engine::general_purpose::STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, key: &UnlockedKey) -> Result<SignedEnvelope> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| SealError::InvalidMessage("invalid base64 ciphertext".into()))?;
        let inner = age_decrypt(&ciphertext, key.age_identity())?;
        SignedEnvelope::from_bytes(&inner)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SealError::InvalidMessage(format!("failed to serialize message: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(data)
            .map_err(|e| SealError::InvalidMessage(format!("malformed message: {}", e)))?;
        if message.version != VERSION {
            return Err(SealError::InvalidMessage(format!(
                "unsupported message version {}",
                message.version
            )));
        }
        Ok(message)
    }
}

fn age_encrypt_multi<'a>(
    data: &[u8],
    recipients: impl Iterator<Item = &'a age::x25519::Recipient>,
) -> Result<Vec<u8>> {
    let encryptor =
        age::Encryptor::with_recipients(recipients.map(|r| r as &dyn age::Recipient))
            .map_err(|e| SealError::EncryptFailed(e.to_string()))?;

    let mut encrypted = vec![];
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    writer
        .write_all(data)
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    Ok(encrypted)
}

fn age_decrypt(ciphertext: &[u8], identity: &age::x25519::Identity) -> Result<Vec<u8>> {
    let decryptor = age::Decryptor::new(ciphertext)
        .map_err(|e| SealError::DecryptFailed(format!("failed to read age header: {}", e)))?;
    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| SealError::DecryptFailed(e.to_string()))?;
    let mut plaintext = vec![];
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| SealError::DecryptFailed(e.to_string()))?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cert::{Cert, UserId};
    use crate::keys::store::MemoryKeyStore;
    use age::secrecy::SecretString;

    fn own(address: &str) -> (Cert, UnlockedKey) {
        UnlockedKey::generate(
            &UserId::new(address, None),
            &SecretString::from("pw".to_string()),
            10,
        )
        .unwrap()
    }

    #[test]
    fn signature_checks_against_store() {
        let (cert, key) = own("me@example.com");
        let envelope = SignedEnvelope::seal(b"hello", Some(&key));
        let parsed = SignedEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.payload().unwrap(), b"hello");

        let store = MemoryKeyStore::new();
        let unknown = parsed.check(&store).unwrap();
        assert!(!unknown[0].valid);

        store.import_or_merge(&cert.public()).unwrap();
        let known = parsed.check(&store).unwrap();
        assert_eq!(known.len(), 1);
        assert!(known[0].valid);
        assert_eq!(&known[0].signer, cert.fingerprint());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (_, key) = own("me@example.com");
        let mut envelope = SignedEnvelope::seal(b"hello", Some(&key));
        envelope.payload = base64::engine::general_purpose::STANDARD.encode(b"hellO");
        assert!(SignedEnvelope::from_bytes(&envelope.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn only_listed_recipients_can_open() {
        let (a_cert, a_key) = own("a@example.com");
        let (_, b_key) = own("b@example.com");
        let envelope = SignedEnvelope::seal(b"secret", None);
        let sealed = SealedMessage::seal(
            &envelope,
            &[(a_cert.fingerprint().clone(), a_cert.age_recipient().unwrap())],
        )
        .unwrap();

        let reparsed = SealedMessage::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(reparsed.recipients, vec![a_cert.fingerprint().clone()]);
        assert_eq!(reparsed.open(&a_key).unwrap().payload().unwrap(), b"secret");
        assert_eq!(reparsed.open(&b_key).unwrap_err().code(), "DECRYPT_FAILED");
    }

    #[test]
    fn no_recipients_is_refused() {
        let envelope = SignedEnvelope::seal(b"x", None);
        assert_eq!(
            SealedMessage::seal(&envelope, &[]).unwrap_err(),
            SealError::NoKeyForEncryption
        );
    }
}
