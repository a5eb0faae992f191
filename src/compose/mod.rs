//! Compose orchestration: recipients, signing key, payload, ciphertext.

pub mod draft;
pub mod orchestrator;
pub mod payload;
pub mod session;

pub use draft::OpenedMessage;
pub use orchestrator::ComposeOrchestrator;
pub use payload::{Attachment, Payload};
pub use session::{
    Action, ComposeOutcome, ComposeRequest, ComposeSession, ComposeState, Composed,
    SealedAttachment,
};
