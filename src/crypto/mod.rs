pub mod armor;
pub mod engine;
pub mod envelope;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::keys::cert::Fingerprint;
use crate::keys::identity::UnlockedKey;
use crate::keys::reconcile::CandidateKey;

pub use engine::AgeEngine;

/// Outcome of checking one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    pub signer: Fingerprint,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub signatures: Vec<SignatureCheck>,
}

impl Decrypted {
    pub fn valid_signers(&self) -> impl Iterator<Item = &Fingerprint> {
        self.signatures
            .iter()
            .filter(|s| s.valid)
            .map(|s| &s.signer)
    }
}

/// The cryptographic primitives the compose core relies on.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Encrypt `data` to every fingerprint, signing first when `signer` is set.
    /// Returns armored text.
    async fn encrypt(
        &self,
        data: Vec<u8>,
        recipients: &[Fingerprint],
        signer: Option<Arc<UnlockedKey>>,
    ) -> Result<String>;

    async fn decrypt(&self, ciphertext: &str, key: Arc<UnlockedKey>) -> Result<Decrypted>;

    /// Sign without encrypting. Returns armored text.
    async fn sign(&self, data: Vec<u8>, key: Arc<UnlockedKey>) -> Result<String>;

    async fn verify(&self, signed: &str) -> Result<Decrypted>;

    fn parse_key(&self, armored: &str) -> Result<CandidateKey>;

    /// Fingerprints an encrypted message was addressed to.
    fn recipients(&self, ciphertext: &str) -> Result<Vec<Fingerprint>>;
}
