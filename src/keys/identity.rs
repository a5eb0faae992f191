use std::io::{Read, Write};

use age::secrecy::{ExposeSecret, SecretString};
use base64::Engine;
use chrono::{DateTime, SubsecRound, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use super::cert::{Cert, Fingerprint, UserId};
use crate::error::{Result, SealError};

/// Default scrypt cost for passphrase-protected secrets.
pub const DEFAULT_WORK_FACTOR: u8 = 16;

/// Secret half of a key, as stored inside the passphrase-encrypted blob.
#[derive(Serialize, Deserialize)]
struct SecretMaterial {
    age: String,
    sign: String,
}

/// A private key after a successful passphrase unlock.
#[derive(Clone)]
pub struct UnlockedKey {
    fingerprint: Fingerprint,
    age_identity: age::x25519::Identity,
    signing_key: SigningKey,
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl UnlockedKey {
    /// Generate a new private key protected by `passphrase`.
    /// Returns the private certificate (safe to store) and the unlocked key.
    pub fn generate(
        user_id: &UserId,
        passphrase: &SecretString,
        work_factor: u8,
    ) -> Result<(Cert, Self)> {
        let age_identity = age::x25519::Identity::generate();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

        let material = SecretMaterial {
            age: age_identity.to_string().expose_secret().to_string(),
            sign: base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes()),
        };
        let material = serde_json::to_vec(&material)
            .map_err(|e| SealError::InvalidKey(format!("failed to encode secret: {}", e)))?;
        let locked = lock_secret(&material, passphrase, work_factor)?;

        let cert = Cert::assemble(
            &age_identity.to_public().to_string(),
            &signing_key,
            std::slice::from_ref(user_id),
            Utc::now().trunc_subsecs(0),
            Some(base64::engine::general_purpose::STANDARD.encode(locked)),
        )?;

        let unlocked = Self {
            fingerprint: cert.fingerprint().clone(),
            age_identity,
            signing_key,
        };
        Ok((cert, unlocked))
    }

    /// Decrypt the secret half of a private certificate.
    pub fn unlock(cert: &Cert, passphrase: &SecretString) -> Result<Self> {
        let secret = cert.secret().ok_or_else(|| {
            SealError::InvalidKey(format!("{} has no secret half", cert.fingerprint()))
        })?;
        let locked = base64::engine::general_purpose::STANDARD
            .decode(secret)
            .map_err(|_| SealError::InvalidKey("invalid base64 in secret material".into()))?;
        let material = unlock_secret(&locked, passphrase)
            .map_err(|_| SealError::BadPassphrase(cert.fingerprint().clone()))?;
        let material: SecretMaterial = serde_json::from_slice(&material)
            .map_err(|e| SealError::InvalidKey(format!("malformed secret material: {}", e)))?;

        let age_identity: age::x25519::Identity = material
            .age
            .parse()
            .map_err(|e: &str| SealError::InvalidKey(format!("invalid age secret key: {}", e)))?;
        let sign_bytes = base64::engine::general_purpose::STANDARD
            .decode(&material.sign)
            .map_err(|_| SealError::InvalidKey("invalid base64 in signing secret".into()))?;
        let sign_array: [u8; 32] = sign_bytes
            .try_into()
            .map_err(|_| SealError::InvalidKey("invalid signing secret length".into()))?;
        let signing_key = SigningKey::from_bytes(&sign_array);

        if signing_key.verifying_key() != cert.verifying_key()?
            || age_identity.to_public().to_string() != cert.age_recipient()?.to_string()
        {
            return Err(SealError::InvalidKey(format!(
                "secret material does not match {}",
                cert.fingerprint()
            )));
        }

        Ok(Self {
            fingerprint: cert.fingerprint().clone(),
            age_identity,
            signing_key,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub(crate) fn age_identity(&self) -> &age::x25519::Identity {
        &self.age_identity
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Revoke `cert`. The result is a rotation event to publish to others.
    pub fn revoke(&self, cert: &Cert, reason: &str) -> Result<Cert> {
        cert.with_revocation(&self.signing_key, reason, now())
    }

    pub fn set_expiry(&self, cert: &Cert, expires: DateTime<Utc>) -> Result<Cert> {
        cert.with_expiry(&self.signing_key, expires, now())
    }

    pub fn add_user_id(&self, cert: &Cert, user_id: &UserId) -> Result<Cert> {
        cert.with_user_id(&self.signing_key, user_id, now())
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Copy a passphrase without exposing it beyond this call.
pub fn dup_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

fn lock_secret(data: &[u8], passphrase: &SecretString, work_factor: u8) -> Result<Vec<u8>> {
    let mut recipient = age::scrypt::Recipient::new(dup_secret(passphrase));
    recipient.set_work_factor(work_factor);

    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
            .map_err(|e| SealError::EncryptFailed(e.to_string()))?;

    let mut locked = vec![];
    let mut writer = encryptor
        .wrap_output(&mut locked)
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    writer
        .write_all(data)
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| SealError::EncryptFailed(e.to_string()))?;
    Ok(locked)
}

fn unlock_secret(locked: &[u8], passphrase: &SecretString) -> anyhow::Result<Vec<u8>> {
    let identity = age::scrypt::Identity::new(dup_secret(passphrase));
    let decryptor = age::Decryptor::new(locked)?;
    let mut reader = decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?;
    let mut plaintext = vec![];
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cert::{KeyKind, Validity};

    const TEST_WORK_FACTOR: u8 = 10;

    fn pass(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn generate_and_unlock() {
        let uid = UserId::new("me@example.com", Some("Me"));
        let (cert, key) = UnlockedKey::generate(&uid, &pass("hunter2"), TEST_WORK_FACTOR).unwrap();
        assert_eq!(cert.kind(), KeyKind::Private);
        assert_eq!(cert.validity(), Validity::Valid);

        let reparsed = Cert::from_armored(&cert.to_armored()).unwrap();
        let unlocked = UnlockedKey::unlock(&reparsed, &pass("hunter2")).unwrap();
        assert_eq!(unlocked.fingerprint(), key.fingerprint());
    }

    #[test]
    fn wrong_passphrase_is_reported() {
        let uid = UserId::new("me@example.com", None);
        let (cert, _) = UnlockedKey::generate(&uid, &pass("right"), TEST_WORK_FACTOR).unwrap();
        let err = UnlockedKey::unlock(&cert, &pass("wrong")).unwrap_err();
        assert_eq!(err.code(), "BAD_PASSPHRASE");
    }

    #[test]
    fn public_half_cannot_be_unlocked() {
        let uid = UserId::new("me@example.com", None);
        let (cert, _) = UnlockedKey::generate(&uid, &pass("pw"), TEST_WORK_FACTOR).unwrap();
        assert!(UnlockedKey::unlock(&cert.public(), &pass("pw")).is_err());
    }

    #[test]
    fn revocation_produces_invalid_public_cert() {
        let uid = UserId::new("me@example.com", None);
        let (cert, key) = UnlockedKey::generate(&uid, &pass("pw"), TEST_WORK_FACTOR).unwrap();
        let revoked = key.revoke(&cert.public(), "lost laptop").unwrap();
        assert_eq!(revoked.kind(), KeyKind::Public);
        assert_eq!(revoked.validity(), Validity::Invalid);
        assert_eq!(revoked.fingerprint(), cert.fingerprint());
    }
}
