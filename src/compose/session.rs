use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::payload::Payload;
use crate::error::SealError;
use crate::keys::cert::Fingerprint;
use crate::keys::store::KeyringId;
use crate::popup::{PopupKind, PopupObserver};
use crate::unlock::UnlockReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComposeState {
    Idle,
    ResolvingRecipients,
    ConfirmingKeyTrust,
    UnlockingSigningKey,
    BuildingPayload,
    Encrypting,
    Succeeded,
    Failed,
    Canceled,
}

impl ComposeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ComposeState::Succeeded | ComposeState::Failed | ComposeState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Encrypt,
    SignOnly,
}

/// Everything the user asked for in one compose operation.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub action: Action,
    pub recipients: Vec<String>,
    /// Encrypt to exactly these keys and skip recipient resolution.
    pub fingerprint_override: Option<Vec<Fingerprint>>,
    pub sign: bool,
    /// Sign with this key instead of the keyring default.
    pub signing_key: Option<Fingerprint>,
    pub payload: Payload,
    /// The body already contains the quote of a re-opened draft.
    pub reopened_draft: bool,
    /// Attachments travel inside the payload instead of as separate files.
    pub inline_attachments: bool,
    pub unlock_reason: UnlockReason,
}

impl ComposeRequest {
    pub fn encrypt(recipients: Vec<String>, payload: Payload) -> Self {
        Self {
            action: Action::Encrypt,
            recipients,
            fingerprint_override: None,
            sign: true,
            signing_key: None,
            payload,
            reopened_draft: false,
            inline_attachments: false,
            unlock_reason: UnlockReason::Sign,
        }
    }

    pub fn sign_only(payload: Payload) -> Self {
        Self {
            action: Action::SignOnly,
            inline_attachments: true,
            ..Self::encrypt(Vec::new(), payload)
        }
    }
}

/// One encrypted attachment, written next to the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedAttachment {
    pub name: String,
    pub armored: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    pub message: String,
    /// Recipient keys the message was encrypted to, sorted.
    pub fingerprints: Vec<Fingerprint>,
    pub signer: Option<Fingerprint>,
    pub attachments: Vec<SealedAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComposeOutcome {
    Succeeded(Composed),
    Failed(SealError),
    Canceled,
}

impl ComposeOutcome {
    pub fn into_result(self) -> Result<Composed, SealError> {
        match self {
            ComposeOutcome::Succeeded(composed) => Ok(composed),
            ComposeOutcome::Failed(err) => Err(err),
            ComposeOutcome::Canceled => Err(SealError::EditorDialogCancel),
        }
    }
}

#[derive(Debug)]
struct StateLog {
    current: ComposeState,
    history: Vec<ComposeState>,
}

/// Shared state trail. Popups opened during resolution move it to
/// `ConfirmingKeyTrust` and back.
#[derive(Debug, Clone)]
pub(crate) struct StateTracker(Arc<Mutex<StateLog>>);

impl StateTracker {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(StateLog {
            current: ComposeState::Idle,
            history: vec![ComposeState::Idle],
        })))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateLog> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set(&self, state: ComposeState) {
        let mut log = self.lock();
        if log.current.is_terminal() || log.current == state {
            return;
        }
        tracing::debug!(from = ?log.current, to = ?state, "compose state");
        log.current = state;
        log.history.push(state);
    }

    fn current(&self) -> ComposeState {
        self.lock().current
    }

    fn history(&self) -> Vec<ComposeState> {
        self.lock().history.clone()
    }
}

impl PopupObserver for StateTracker {
    fn opened(&self, kind: PopupKind) {
        if kind == PopupKind::ImportConfirm && self.current() == ComposeState::ResolvingRecipients {
            self.set(ComposeState::ConfirmingKeyTrust);
        }
    }

    fn closed(&self, kind: PopupKind) {
        if kind == PopupKind::ImportConfirm && self.current() == ComposeState::ConfirmingKeyTrust {
            self.set(ComposeState::ResolvingRecipients);
        }
    }
}

/// Live state of one compose operation.
#[derive(Debug)]
pub struct ComposeSession {
    keyring: KeyringId,
    request: ComposeRequest,
    /// Keys the message will be encrypted to.
    pub(crate) fingerprints: Vec<Fingerprint>,
    /// A failure already known but not yet reported, e.g. one attachment
    /// failing while others are still running.
    pub(crate) pending_failure: Option<SealError>,
    tracker: StateTracker,
    outcome: Option<ComposeOutcome>,
}

impl ComposeSession {
    pub fn new(keyring: KeyringId, request: ComposeRequest) -> Self {
        let fingerprints = request.fingerprint_override.clone().unwrap_or_default();
        Self {
            keyring,
            request,
            fingerprints,
            pending_failure: None,
            tracker: StateTracker::new(),
            outcome: None,
        }
    }

    pub fn keyring(&self) -> &KeyringId {
        &self.keyring
    }

    pub fn request(&self) -> &ComposeRequest {
        &self.request
    }

    pub fn state(&self) -> ComposeState {
        self.tracker.current()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> Vec<ComposeState> {
        self.tracker.history()
    }

    pub fn outcome(&self) -> Option<&ComposeOutcome> {
        self.outcome.as_ref()
    }

    pub fn into_outcome(self) -> Option<ComposeOutcome> {
        self.outcome
    }

    pub(crate) fn tracker(&self) -> StateTracker {
        self.tracker.clone()
    }

    pub(crate) fn enter(&self, state: ComposeState) {
        self.tracker.set(state);
    }

    pub(crate) fn succeed(&mut self, composed: Composed) {
        self.finish(ComposeState::Succeeded, ComposeOutcome::Succeeded(composed));
    }

    pub(crate) fn fail(&mut self, err: SealError) {
        if err.is_cancel() {
            self.cancel();
            return;
        }
        self.finish(ComposeState::Failed, ComposeOutcome::Failed(err));
    }

    pub(crate) fn cancel(&mut self) {
        self.finish(ComposeState::Canceled, ComposeOutcome::Canceled);
    }

    /// The compose surface went away before a terminal state.
    pub(crate) fn surface_closed(&mut self) {
        match self.pending_failure.take() {
            Some(err) => self.fail(err),
            None => self.cancel(),
        }
    }

    fn finish(&mut self, state: ComposeState, outcome: ComposeOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.tracker.set(state);
        self.outcome = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ComposeSession {
        ComposeSession::new(
            KeyringId::main(),
            ComposeRequest::encrypt(vec!["a@example.com".into()], Payload::text("hi")),
        )
    }

    #[test]
    fn terminal_state_is_final() {
        let mut s = session();
        s.enter(ComposeState::ResolvingRecipients);
        s.fail(SealError::NoKeyForEncryption);
        s.cancel();
        s.enter(ComposeState::Encrypting);
        assert_eq!(s.state(), ComposeState::Failed);
        assert_eq!(
            s.outcome(),
            Some(&ComposeOutcome::Failed(SealError::NoKeyForEncryption))
        );
    }

    #[test]
    fn pending_failure_wins_over_close() {
        let mut s = session();
        s.pending_failure = Some(SealError::AttachmentsFailed(vec![("a".into(), "b".into())]));
        s.surface_closed();
        assert_eq!(s.state(), ComposeState::Failed);
    }

    #[test]
    fn close_without_failure_cancels() {
        let mut s = session();
        s.enter(ComposeState::UnlockingSigningKey);
        s.surface_closed();
        assert_eq!(s.outcome(), Some(&ComposeOutcome::Canceled));
    }

    #[test]
    fn cancel_errors_cancel() {
        let mut s = session();
        s.fail(SealError::PwdDialogCancel);
        assert_eq!(s.state(), ComposeState::Canceled);
    }

    #[test]
    fn trust_popup_moves_state() {
        let s = session();
        s.enter(ComposeState::ResolvingRecipients);
        let tracker = s.tracker();
        tracker.opened(PopupKind::ImportConfirm);
        assert_eq!(s.state(), ComposeState::ConfirmingKeyTrust);
        tracker.closed(PopupKind::ImportConfirm);
        assert_eq!(
            s.history(),
            vec![
                ComposeState::Idle,
                ComposeState::ResolvingRecipients,
                ComposeState::ConfirmingKeyTrust,
                ComposeState::ResolvingRecipients,
            ]
        );
    }

    #[test]
    fn override_fills_fingerprint_buffer() {
        let fp = Fingerprint::parse(&"D".repeat(40)).unwrap();
        let mut request = ComposeRequest::encrypt(vec![], Payload::text("draft"));
        request.fingerprint_override = Some(vec![fp.clone()]);
        let s = ComposeSession::new(KeyringId::main(), request);
        assert_eq!(s.fingerprints, vec![fp]);
    }
}
