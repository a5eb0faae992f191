pub mod compose;
pub mod context;
pub mod decrypt;
pub mod draft;
pub mod input;
pub mod keys;
pub mod surface;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::ui::display;
use crate::view::ViewEvent;

#[derive(Parser)]
#[command(name = "sealpost", about = "Signed and encrypted messages with a reconciled keyring")]
#[command(version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Show debug output (never prints secrets)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Minimal output (for scripting)
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Path to sealpost.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding keyrings (defaults to the platform config dir)
    #[arg(long, global = true, env = "SEALPOST_HOME")]
    pub home: Option<PathBuf>,

    /// Keyring to use instead of the configured one
    #[arg(long, global = true)]
    pub keyring: Option<String>,

    /// Accept key confirmations without asking
    #[arg(long, short, global = true)]
    pub yes: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage your own keys and the keys of others
    Keys(keys::KeysArgs),

    /// Write a signed and encrypted (or sign-only) message
    Compose(compose::ComposeArgs),

    /// Save or re-open a self-encrypted draft
    Draft(draft::DraftArgs),

    /// Decrypt a message addressed to one of your keys
    Decrypt(decrypt::DecryptArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Render view events that carry something for the user.
/// Errors are reported through the command's return value instead.
pub(crate) fn render_events(events: Vec<ViewEvent>, quiet: bool) {
    for event in events {
        match event {
            ViewEvent::KeyUpdate {
                fingerprint,
                outcome,
            } if !quiet => display::outcome(fingerprint.as_str(), outcome),
            ViewEvent::DecryptInProgress => tracing::debug!("decrypting"),
            ViewEvent::EncryptInProgress => tracing::debug!("encrypting"),
            _ => {}
        }
    }
}
