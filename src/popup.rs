//! Modal prompts (import confirmation, passphrase entry).
//!
//! The core talks to the surface host through typed requests and a oneshot
//! reply channel. A host that drops the reply sender without answering has
//! closed the surface; the pending prompt settles as [`Settled::Closed`].
//! Because the receiver is consumed on first resolution, every prompt settles
//! exactly once.
//!
//! A [`PopupSlot`] belongs to one operation. Opening a prompt borrows the slot
//! mutably, so a second prompt for the same owner cannot exist while the
//! first is alive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use age::secrecy::SecretString;
use tokio::sync::oneshot;

use crate::keys::cert::{Fingerprint, UserId, Validity};
use crate::unlock::UnlockReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PopupId(uuid::Uuid);

impl std::fmt::Display for PopupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupKind {
    ImportConfirm,
    Passphrase,
}

/// Direction of the trust change being confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustChange {
    NewKey,
    Gaining,
    Losing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportPrompt {
    pub fingerprint: Fingerprint,
    pub user_ids: Vec<UserId>,
    pub before: Option<Validity>,
    pub after: Validity,
    pub change: TrustChange,
    /// Stored keys for the same addresses that this key would sit next to.
    pub replaces: Vec<Fingerprint>,
    pub revocation_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassphrasePrompt {
    pub fingerprint: Fingerprint,
    pub user_id: Option<UserId>,
    pub reason: UnlockReason,
    /// Zero on the first ask, incremented after every wrong passphrase.
    pub retry: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopupRequest {
    ImportConfirm(ImportPrompt),
    Passphrase(PassphrasePrompt),
}

impl PopupRequest {
    pub fn kind(&self) -> PopupKind {
        match self {
            PopupRequest::ImportConfirm(_) => PopupKind::ImportConfirm,
            PopupRequest::Passphrase(_) => PopupKind::Passphrase,
        }
    }
}

pub enum PopupResponse {
    Confirm(bool),
    Passphrase(SecretString),
}

impl std::fmt::Debug for PopupResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PopupResponse::Confirm(yes) => f.debug_tuple("Confirm").field(yes).finish(),
            PopupResponse::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
        }
    }
}

#[derive(Debug)]
pub enum Settled {
    Responded(PopupResponse),
    Closed,
}

/// Port for whatever renders prompts (terminal, window, test script).
pub trait SurfaceHost: Send + Sync {
    /// Show or refresh surface `id`. Dropping `reply` unanswered means closed.
    fn open(&self, id: PopupId, request: PopupRequest, reply: oneshot::Sender<PopupResponse>);

    /// Retract surface `id`. Must be a no-op when it is already gone.
    fn close(&self, id: PopupId);
}

/// Notified when the owner's prompt appears and disappears.
pub trait PopupObserver: Send + Sync {
    fn opened(&self, kind: PopupKind);
    fn closed(&self, kind: PopupKind);
}

/// The single prompt slot of one operation.
pub struct PopupSlot {
    host: Arc<dyn SurfaceHost>,
    observer: Option<Arc<dyn PopupObserver>>,
    in_modal: bool,
}

impl PopupSlot {
    pub fn new(host: Arc<dyn SurfaceHost>) -> Self {
        Self {
            host,
            observer: None,
            in_modal: false,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PopupObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Mark the owner as already running inside a modal surface.
    pub fn inside_modal(mut self) -> Self {
        self.in_modal = true;
        self
    }

    pub fn is_inside_modal(&self) -> bool {
        self.in_modal
    }

    pub fn open(&mut self, kind: PopupKind) -> PopupSession<'_> {
        let id = PopupId(uuid::Uuid::new_v4());
        tracing::debug!(popup = %id, ?kind, "popup opened");
        if let Some(observer) = &self.observer {
            observer.opened(kind);
        }
        PopupSession {
            id,
            kind,
            slot: self,
        }
    }
}

/// A live prompt. Dropping it retracts the surface.
pub struct PopupSession<'a> {
    id: PopupId,
    kind: PopupKind,
    slot: &'a mut PopupSlot,
}

impl PopupSession<'_> {
    pub fn id(&self) -> PopupId {
        self.id
    }

    /// Show `request` on this surface and wait for the user.
    /// Asking again reuses the same surface.
    pub async fn ask(&mut self, request: PopupRequest) -> Settled {
        debug_assert_eq!(request.kind(), self.kind);
        let (tx, rx) = oneshot::channel();
        self.slot.host.open(self.id, request, tx);
        match rx.await {
            Ok(response) => Settled::Responded(response),
            Err(_) => {
                tracing::debug!(popup = %self.id, "popup closed without a decision");
                Settled::Closed
            }
        }
    }
}

impl Drop for PopupSession<'_> {
    fn drop(&mut self) {
        self.slot.host.close(self.id);
        if let Some(observer) = &self.slot.observer {
            observer.closed(self.kind);
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted host
// ---------------------------------------------------------------------------

/// One scripted user action.
#[derive(Debug, Clone)]
pub enum Scripted {
    Accept,
    Decline,
    Passphrase(String),
    /// Close the surface without answering.
    Dismiss,
}

/// A surface host that answers prompts from a fixed script and records them.
/// Once the script runs out every prompt is dismissed.
#[derive(Default)]
pub struct ScriptedSurface {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<PopupRequest>>,
    closes: Mutex<Vec<PopupId>>,
}

impl ScriptedSurface {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Every request shown so far, in order.
    pub fn requests(&self) -> Vec<PopupRequest> {
        lock(&self.requests).clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.closes).len()
    }
}

impl SurfaceHost for ScriptedSurface {
    fn open(&self, _id: PopupId, request: PopupRequest, reply: oneshot::Sender<PopupResponse>) {
        let kind = request.kind();
        lock(&self.requests).push(request);
        let step = lock(&self.script).pop_front().unwrap_or(Scripted::Dismiss);
        let response = match (step, kind) {
            (Scripted::Accept, PopupKind::ImportConfirm) => PopupResponse::Confirm(true),
            (Scripted::Decline, PopupKind::ImportConfirm) => PopupResponse::Confirm(false),
            (Scripted::Passphrase(p), PopupKind::Passphrase) => {
                PopupResponse::Passphrase(SecretString::from(p))
            }
            // dropping `reply` closes the surface
            _ => return,
        };
        let _ = reply.send(response);
    }

    fn close(&self, id: PopupId) {
        lock(&self.closes).push(id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
