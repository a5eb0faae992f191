use age::secrecy::SecretString;
use is_terminal::IsTerminal;
use tokio::sync::oneshot;

use crate::popup::{PopupId, PopupRequest, PopupResponse, SurfaceHost};
use crate::ui::display;

pub const PASSPHRASE_ENV: &str = "SEALPOST_PASSPHRASE";

/// Prompts on the controlling terminal.
///
/// Without a TTY, confirmations are answered by `--yes` and passphrases by
/// `SEALPOST_PASSPHRASE`; anything else closes the prompt.
pub struct TerminalSurface {
    assume_yes: bool,
    passphrase: Option<String>,
    interactive: bool,
}

impl TerminalSurface {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            passphrase: std::env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty()),
            interactive: std::io::stdin().is_terminal() && std::io::stderr().is_terminal(),
        }
    }

    pub fn assumes_yes(&self) -> bool {
        self.assume_yes
    }

    fn confirm(&self) -> Option<bool> {
        if self.assume_yes {
            return Some(true);
        }
        if !self.interactive {
            display::warning("confirmation needed; pass --yes to accept in non-interactive mode");
            return None;
        }
        dialoguer::Confirm::new()
            .with_prompt("Accept this key?")
            .default(false)
            .interact_opt()
            .ok()
            .flatten()
    }

    fn passphrase(&self, prompt: &str) -> Option<SecretString> {
        if let Some(p) = &self.passphrase {
            return Some(SecretString::from(p.clone()));
        }
        if !self.interactive {
            display::warning(&format!(
                "passphrase needed; set {} in non-interactive mode",
                PASSPHRASE_ENV
            ));
            return None;
        }
        dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
            .ok()
            .map(SecretString::from)
    }
}

impl SurfaceHost for TerminalSurface {
    fn open(&self, id: PopupId, request: PopupRequest, reply: oneshot::Sender<PopupResponse>) {
        tracing::debug!(popup = %id, kind = ?request.kind(), "prompt");
        let response = match request {
            PopupRequest::ImportConfirm(prompt) => {
                display::import_prompt(&prompt);
                self.confirm().map(PopupResponse::Confirm)
            }
            PopupRequest::Passphrase(prompt) => {
                if prompt.retry > 0 {
                    display::warning("wrong passphrase");
                }
                let who = prompt
                    .user_id
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| prompt.fingerprint.key_id().to_string());
                self.passphrase(&format!("Passphrase to {} as {}", prompt.reason, who))
                    .map(PopupResponse::Passphrase)
            }
        };
        // no response: `reply` is dropped and the prompt counts as closed
        if let Some(response) = response {
            let _ = reply.send(response);
        }
    }

    fn close(&self, id: PopupId) {
        tracing::debug!(popup = %id, "prompt closed");
    }
}
