use tokio::sync::mpsc;

use crate::error::SealError;
use crate::keys::cert::Fingerprint;
use crate::keys::reconcile::Outcome;

/// One-way status events for the presentation layer.
/// The core never reads anything back from the view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    DecryptInProgress,
    EncryptInProgress,
    ErrorMessage { code: &'static str, message: String },
    SetText(String),
    SetAttachment { name: String, content: Vec<u8> },
    KeyUpdate { fingerprint: Fingerprint, outcome: Outcome },
}

/// Sending half of the view channel. Cheap to clone; a detached sink drops events.
#[derive(Clone, Default)]
pub struct ViewSink {
    tx: Option<mpsc::UnboundedSender<ViewEvent>>,
}

impl ViewSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ViewEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ViewEvent) {
        if let Some(tx) = &self.tx {
            // a closed view is not an error for the core
            let _ = tx.send(event);
        }
    }

    /// Report a failure. Cancellations are silent.
    pub fn error(&self, err: &SealError) {
        if err.is_cancel() {
            return;
        }
        self.emit(ViewEvent::ErrorMessage {
            code: err.code(),
            message: err.to_string(),
        });
    }
}

/// Drain everything currently queued on a view receiver.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ViewEvent>) -> Vec<ViewEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
