use serde::Serialize;

use crate::keys::cert::Fingerprint;

/// Coarse error families. Callers branch on the class, users read the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Validation,
    TrustConflict,
    NoKey,
    UserCanceled,
    BuildFailure,
    ImportError,
    LookupFailure,
    Crypto,
    Internal,
}

/// All domain errors raised by the reconciliation and compose core.
///
/// Every variant has a stable machine-readable code (see [`SealError::code`])
/// that survives message rewording.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(
        "refusing to import a private key\n\n  \
         Only public keys can be imported from other people.\n  \
         Export the public half with: sealpost keys export"
    )]
    PrivateKeyRejected,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid recipient address '{0}'")]
    InvalidAddress(String),

    #[error("key {0} conflicts with the stored key of the same fingerprint")]
    TrustConflict(Fingerprint),

    #[error(
        "no key found for recipient(s): {}\n\n  \
         Import their public key with: sealpost keys import <file>",
        .0.join(", ")
    )]
    NoKeyForRecipient(Vec<String>),

    #[error(
        "no signing key found{}\n\n  \
         Create one with: sealpost keys init\n  \
         Or choose one with: sealpost keys default <fingerprint>",
        .0.as_ref().map(|fp| format!(" for {fp}")).unwrap_or_default()
    )]
    NoDefaultKeyFound(Option<Fingerprint>),

    #[error("no keys to encrypt to")]
    NoKeyForEncryption,

    #[error("passphrase prompt dismissed")]
    PwdDialogCancel,

    #[error("compose canceled")]
    EditorDialogCancel,

    #[error("wrong passphrase for key {0}")]
    BadPassphrase(Fingerprint),

    #[error("could not build message: {0}")]
    MimeBuildFailed(String),

    #[error("key import failed: {0}")]
    ImportError(String),

    #[error("key lookup for '{address}' failed: {reason}")]
    LookupFailed { address: String, reason: String },

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("draft is corrupted: {0}")]
    DraftCorrupted(String),

    #[error(
        "{} attachment(s) failed to encrypt: {}",
        .0.len(),
        .0.iter().map(|(name, reason)| format!("{name} ({reason})")).collect::<Vec<_>>().join(", ")
    )]
    AttachmentsFailed(Vec<(String, String)>),

    #[error("key store error: {0}")]
    Store(String),
}

impl SealError {
    /// Stable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            SealError::InvalidKey(_) => "KEY_INVALID",
            SealError::PrivateKeyRejected => "PRIVATE_KEY_REJECTED",
            SealError::InvalidMessage(_) => "MSG_INVALID",
            SealError::InvalidAddress(_) => "INVALID_ADDRESS",
            SealError::TrustConflict(_) => "TRUST_CONFLICT",
            SealError::NoKeyForRecipient(_) => "NO_KEY_FOR_RECIPIENT",
            SealError::NoDefaultKeyFound(_) => "NO_DEFAULT_KEY_FOUND",
            SealError::NoKeyForEncryption => "NO_KEY_FOR_ENCRYPTION",
            SealError::PwdDialogCancel => "PWD_DIALOG_CANCEL",
            SealError::EditorDialogCancel => "EDITOR_DIALOG_CANCEL",
            SealError::BadPassphrase(_) => "BAD_PASSPHRASE",
            SealError::MimeBuildFailed(_) => "MIME_BUILD_FAILED",
            SealError::ImportError(_) => "IMPORT_ERROR",
            SealError::LookupFailed { .. } => "LOOKUP_FAILED",
            SealError::EncryptFailed(_) => "ENCRYPT_FAILED",
            SealError::DecryptFailed(_) => "DECRYPT_FAILED",
            SealError::SignFailed(_) => "SIGN_FAILED",
            SealError::DraftCorrupted(_) => "DRAFT_CORRUPTED",
            SealError::AttachmentsFailed(_) => "ATTACHMENTS_FAILED",
            SealError::Store(_) => "STORE_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SealError::InvalidKey(_)
            | SealError::PrivateKeyRejected
            | SealError::InvalidMessage(_)
            | SealError::InvalidAddress(_)
            | SealError::BadPassphrase(_)
            | SealError::DraftCorrupted(_) => ErrorClass::Validation,
            SealError::TrustConflict(_) => ErrorClass::TrustConflict,
            SealError::NoKeyForRecipient(_)
            | SealError::NoDefaultKeyFound(_)
            | SealError::NoKeyForEncryption => ErrorClass::NoKey,
            SealError::PwdDialogCancel | SealError::EditorDialogCancel => ErrorClass::UserCanceled,
            SealError::MimeBuildFailed(_) => ErrorClass::BuildFailure,
            SealError::ImportError(_) => ErrorClass::ImportError,
            SealError::LookupFailed { .. } => ErrorClass::LookupFailure,
            SealError::EncryptFailed(_)
            | SealError::DecryptFailed(_)
            | SealError::SignFailed(_)
            | SealError::AttachmentsFailed(_) => ErrorClass::Crypto,
            SealError::Store(_) => ErrorClass::Internal,
        }
    }

    /// User cancellation is a silent terminal state, never reported as an error.
    pub fn is_cancel(&self) -> bool {
        self.class() == ErrorClass::UserCanceled
    }
}

impl From<std::io::Error> for SealError {
    fn from(err: std::io::Error) -> Self {
        SealError::Store(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SealError>;
