use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::armor;
use crate::error::{Result, SealError};

const PACKET_VERSION: u32 = 1;

/// 40 uppercase hex chars: first 20 bytes of SHA-256 over both public keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn parse(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if normalized.len() != 40 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SealError::InvalidKey(format!("'{}' is not a fingerprint", s)));
        }
        Ok(Self(normalized))
    }

    fn from_keys(age_pubkey: &str, sign_pubkey: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(age_pubkey.as_bytes());
        hasher.update(sign_pubkey);
        let hash = hasher.finalize();
        Self(hex::encode_upper(&hash[..20]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (last 16 hex chars), used in prompts and logs.
    pub fn key_id(&self) -> &str {
        &self.0[24..]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = SealError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = SealError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Invalid,
    Unknown,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Validity::Valid => "valid",
            Validity::Invalid => "invalid",
            Validity::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Public,
    Private,
}

/// A user identity bound to a key: `Display Name <address>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId {
    pub address: String,
    pub name: Option<String>,
}

impl UserId {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Self {
            address: address.trim().to_ascii_lowercase(),
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        }
    }

    /// Parse `Name <addr>` or a bare address.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match (s.rfind('<'), s.ends_with('>')) {
            (Some(open), true) => {
                let name = s[..open].trim();
                Self::new(&s[open + 1..s.len() - 1], Some(name))
            }
            _ => Self::new(s, None),
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Serialized form of a key. Every binding carries an ed25519 self-signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CertPacket {
    version: u32,
    kind: KeyKind,
    age: String,
    sign: String,
    created: DateTime<Utc>,
    sig: String,
    #[serde(default)]
    user_ids: Vec<UserIdBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<ExpiryBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revocation: Option<RevocationBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UserIdBinding {
    address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    created: DateTime<Utc>,
    sig: String,
}

impl UserIdBinding {
    fn user_id(&self) -> UserId {
        UserId {
            address: self.address.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExpiryBinding {
    expires: DateTime<Utc>,
    created: DateTime<Utc>,
    sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RevocationBinding {
    reason: String,
    created: DateTime<Utc>,
    sig: String,
}

/// A parsed, signature-checked key certificate (public or private).
#[derive(Debug, Clone, PartialEq)]
pub struct Cert {
    fingerprint: Fingerprint,
    packet: CertPacket,
}

impl Cert {
    /// Parse an armored public or private key and verify every self-signature.
    pub fn from_armored(text: &str) -> Result<Self> {
        let label = armor::label_of(text)
            .ok_or_else(|| SealError::InvalidKey("no armored key block found".into()))?;
        if label != armor::PUBLIC_KEY && label != armor::PRIVATE_KEY {
            return Err(SealError::InvalidKey(format!("unexpected armor '{}'", label)));
        }
        let bytes =
            armor::decode(label, text).map_err(|e| SealError::InvalidKey(e.to_string()))?;
        let packet: CertPacket = serde_json::from_slice(&bytes)
            .map_err(|e| SealError::InvalidKey(format!("malformed key packet: {}", e)))?;

        let expected = if label == armor::PRIVATE_KEY {
            KeyKind::Private
        } else {
            KeyKind::Public
        };
        if packet.kind != expected {
            return Err(SealError::InvalidKey(
                "armor label does not match key kind".into(),
            ));
        }
        Self::from_packet(packet)
    }

    fn from_packet(packet: CertPacket) -> Result<Self> {
        if packet.version != PACKET_VERSION {
            return Err(SealError::InvalidKey(format!(
                "unsupported key version {}",
                packet.version
            )));
        }
        match (packet.kind, &packet.secret) {
            (KeyKind::Private, None) => {
                return Err(SealError::InvalidKey("private key without secret material".into()))
            }
            (KeyKind::Public, Some(_)) => {
                return Err(SealError::InvalidKey("public key carries secret material".into()))
            }
            _ => {}
        }

        packet
            .age
            .parse::<age::x25519::Recipient>()
            .map_err(|e: &str| SealError::InvalidKey(format!("invalid age public key: {}", e)))?;
        let sign_bytes = decode_sign_key(&packet.sign)?;
        let verifying_key = VerifyingKey::from_bytes(&sign_bytes)
            .map_err(|_| SealError::InvalidKey("invalid ed25519 public key".into()))?;

        let fingerprint = Fingerprint::from_keys(&packet.age, &sign_bytes);
        let cert = Self {
            fingerprint,
            packet,
        };
        cert.verify_bindings(&verifying_key)?;
        Ok(cert)
    }

    fn verify_bindings(&self, key: &VerifyingKey) -> Result<()> {
        let p = &self.packet;
        check_sig(key, &self.binding(Binding::Key, p.created), &p.sig, "primary key")?;
        for uid in &p.user_ids {
            let msg = self.binding(Binding::UserId(&uid.user_id()), uid.created);
            check_sig(key, &msg, &uid.sig, &format!("user id '{}'", uid.address))?;
        }
        if let Some(expiry) = &p.expiry {
            let msg = self.binding(Binding::Expiry(expiry.expires), expiry.created);
            check_sig(key, &msg, &expiry.sig, "expiry")?;
        }
        if let Some(rev) = &p.revocation {
            let msg = self.binding(Binding::Revocation(&rev.reason), rev.created);
            check_sig(key, &msg, &rev.sig, "revocation")?;
        }
        Ok(())
    }

    fn binding(&self, binding: Binding<'_>, created: DateTime<Utc>) -> Vec<u8> {
        binding_message(&self.fingerprint, binding, created)
    }

    pub fn to_armored(&self) -> String {
        let label = match self.packet.kind {
            KeyKind::Public => armor::PUBLIC_KEY,
            KeyKind::Private => armor::PRIVATE_KEY,
        };
        // CertPacket only holds strings and timestamps
        let json = serde_json::to_vec(&self.packet).unwrap_or_default();
        armor::encode(label, &json)
    }

    /// The public half of this key.
    pub fn public(&self) -> Cert {
        let mut packet = self.packet.clone();
        packet.kind = KeyKind::Public;
        packet.secret = None;
        Cert {
            fingerprint: self.fingerprint.clone(),
            packet,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn kind(&self) -> KeyKind {
        self.packet.kind
    }

    pub fn is_private(&self) -> bool {
        self.packet.kind == KeyKind::Private
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.packet.user_ids.iter().map(UserIdBinding::user_id).collect()
    }

    pub fn primary_user_id(&self) -> Option<UserId> {
        self.packet.user_ids.first().map(UserIdBinding::user_id)
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.packet
            .user_ids
            .iter()
            .any(|u| u.address.eq_ignore_ascii_case(address.trim()))
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.packet.created
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.packet.expiry.as_ref().map(|e| e.expires)
    }

    pub fn revocation_reason(&self) -> Option<&str> {
        self.packet.revocation.as_ref().map(|r| r.reason.as_str())
    }

    pub fn validity_at(&self, now: DateTime<Utc>) -> Validity {
        if self.packet.revocation.is_some() {
            return Validity::Invalid;
        }
        if self.expires().is_some_and(|e| e <= now) {
            return Validity::Invalid;
        }
        if self.packet.user_ids.is_empty() {
            return Validity::Unknown;
        }
        Validity::Valid
    }

    pub fn validity(&self) -> Validity {
        self.validity_at(Utc::now())
    }

    /// Newest binding timestamp on the key.
    pub fn last_modified(&self) -> DateTime<Utc> {
        let p = &self.packet;
        p.user_ids
            .iter()
            .map(|u| u.created)
            .chain(p.expiry.as_ref().map(|e| e.created))
            .chain(p.revocation.as_ref().map(|r| r.created))
            .fold(p.created, |acc, t| acc.max(t))
    }

    /// Merge another copy of the same key into this one without touching either.
    ///
    /// User ids are unioned, the newest expiry binding wins and a revocation
    /// from either side sticks. The kind and secret of `self` are kept.
    pub fn merge(&self, other: &Cert) -> Result<Cert> {
        if self.fingerprint != other.fingerprint {
            return Err(SealError::InvalidKey(format!(
                "cannot merge {} into {}",
                other.fingerprint, self.fingerprint
            )));
        }
        let mut packet = self.packet.clone();

        for uid in &other.packet.user_ids {
            let known = packet.user_ids.iter().any(|u| {
                u.address.eq_ignore_ascii_case(&uid.address) && u.name == uid.name
            });
            if !known {
                packet.user_ids.push(uid.clone());
            }
        }

        packet.expiry = match (packet.expiry.take(), &other.packet.expiry) {
            (Some(ours), Some(theirs)) if theirs.created > ours.created => Some(theirs.clone()),
            (Some(ours), _) => Some(ours),
            (None, theirs) => theirs.clone(),
        };

        if packet.revocation.is_none() {
            packet.revocation = other.packet.revocation.clone();
        }

        Ok(Cert {
            fingerprint: self.fingerprint.clone(),
            packet,
        })
    }

    pub fn age_recipient(&self) -> Result<age::x25519::Recipient> {
        self.packet
            .age
            .parse()
            .map_err(|e: &str| SealError::InvalidKey(format!("invalid age public key: {}", e)))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes = decode_sign_key(&self.packet.sign)?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| SealError::InvalidKey("invalid ed25519 public key".into()))
    }

    pub(crate) fn secret(&self) -> Option<&str> {
        self.packet.secret.as_deref()
    }

    /// Build and self-sign a brand new key.
    pub(crate) fn assemble(
        age_recipient: &str,
        signing_key: &SigningKey,
        user_ids: &[UserId],
        created: DateTime<Utc>,
        secret: Option<String>,
    ) -> Result<Cert> {
        let sign = base64::engine::general_purpose::STANDARD
            .encode(signing_key.verifying_key().to_bytes());
        let fingerprint =
            Fingerprint::from_keys(age_recipient, &signing_key.verifying_key().to_bytes());
        let kind = if secret.is_some() {
            KeyKind::Private
        } else {
            KeyKind::Public
        };
        let sig = sign_message(
            signing_key,
            &binding_message(&fingerprint, Binding::Key, created),
        );

        let mut cert = Cert {
            fingerprint,
            packet: CertPacket {
                version: PACKET_VERSION,
                kind,
                age: age_recipient.to_string(),
                sign,
                created,
                sig,
                user_ids: Vec::new(),
                expiry: None,
                revocation: None,
                secret,
            },
        };
        for uid in user_ids {
            cert = cert.with_user_id(signing_key, uid, created)?;
        }
        Ok(cert)
    }

    pub(crate) fn with_user_id(
        &self,
        signing_key: &SigningKey,
        uid: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Cert> {
        self.check_signer(signing_key)?;
        let sig = sign_message(signing_key, &self.binding(Binding::UserId(uid), at));
        let mut cert = self.clone();
        cert.packet.user_ids.push(UserIdBinding {
            address: uid.address.clone(),
            name: uid.name.clone(),
            created: at,
            sig,
        });
        Ok(cert)
    }

    pub(crate) fn with_expiry(
        &self,
        signing_key: &SigningKey,
        expires: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Cert> {
        self.check_signer(signing_key)?;
        let sig = sign_message(signing_key, &self.binding(Binding::Expiry(expires), at));
        let mut cert = self.clone();
        cert.packet.expiry = Some(ExpiryBinding {
            expires,
            created: at,
            sig,
        });
        Ok(cert)
    }

    pub(crate) fn with_revocation(
        &self,
        signing_key: &SigningKey,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Cert> {
        self.check_signer(signing_key)?;
        let sig = sign_message(signing_key, &self.binding(Binding::Revocation(reason), at));
        let mut cert = self.clone();
        cert.packet.revocation = Some(RevocationBinding {
            reason: reason.to_string(),
            created: at,
            sig,
        });
        Ok(cert)
    }

    fn check_signer(&self, signing_key: &SigningKey) -> Result<()> {
        if self.verifying_key()? != signing_key.verifying_key() {
            return Err(SealError::InvalidKey(format!(
                "signing key does not belong to {}",
                self.fingerprint
            )));
        }
        Ok(())
    }
}

enum Binding<'a> {
    Key,
    UserId(&'a UserId),
    Expiry(DateTime<Utc>),
    Revocation(&'a str),
}

fn binding_message(fp: &Fingerprint, binding: Binding<'_>, created: DateTime<Utc>) -> Vec<u8> {
    let (tag, payload) = match binding {
        Binding::Key => ("key", String::new()),
        Binding::UserId(uid) => ("uid", uid.to_string()),
        Binding::Expiry(expires) => ("expiry", expires.timestamp().to_string()),
        Binding::Revocation(reason) => ("revocation", reason.to_string()),
    };
    format!(
        "sealpost-binding\n{}\n{}\n{}\n{}",
        fp,
        tag,
        payload,
        created.timestamp()
    )
    .into_bytes()
}

fn sign_message(key: &SigningKey, msg: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.sign(msg).to_bytes())
}

fn check_sig(key: &VerifyingKey, msg: &[u8], sig_b64: &str, what: &str) -> Result<()> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(sig_b64)
        .map_err(|_| SealError::InvalidKey(format!("invalid signature encoding on {}", what)))?;
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| SealError::InvalidKey(format!("invalid signature length on {}", what)))?;
    key.verify(msg, &Signature::from_bytes(&array))
        .map_err(|_| SealError::InvalidKey(format!("bad self-signature on {}", what)))
}

fn decode_sign_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| SealError::InvalidKey("invalid base64 in signing key".into()))?;
    bytes
        .try_into()
        .map_err(|_| SealError::InvalidKey("invalid ed25519 public key length".into()))
}
