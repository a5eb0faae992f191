use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use super::context::App;
use super::input::{read_text, write_output, write_secret};
use crate::ui::display;

#[derive(Args)]
pub struct DecryptArgs {
    /// Path to an armored message
    pub file: PathBuf,

    /// Write the plaintext here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Overwrite existing files without prompting
    #[arg(long, short)]
    pub force: bool,
}

pub async fn run(args: DecryptArgs, app: &mut App, quiet: bool) -> Result<()> {
    let armored = read_text(&args.file)?;
    let mut slot = app.slot();
    let opened = app.orchestrator.open_message(&armored, &mut slot).await;
    drop(slot);
    super::render_events(app.take_events(), quiet);
    let opened = match opened {
        Ok(opened) => opened,
        Err(e) if e.is_cancel() => {
            tracing::debug!("decrypt canceled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let text = match &opened.payload {
        Some(payload) => payload.body.clone(),
        None => String::from_utf8_lossy(&opened.decrypted.plaintext).into_owned(),
    };
    match &args.output {
        Some(path) => write_secret(path, text.as_bytes(), args.force)?,
        None => write_output(None, text.as_bytes(), args.force)?,
    }

    if quiet {
        return Ok(());
    }
    if let Some(subject) = opened.payload.as_ref().and_then(|p| p.subject.as_ref()) {
        display::info("subject:", subject);
    }
    if opened.decrypted.signatures.is_empty() {
        display::warning("message is not signed");
    }
    for sig in &opened.decrypted.signatures {
        if sig.valid {
            display::ok(&format!("good signature from {}", sig.signer));
        } else {
            display::warning(&format!("bad or unknown signature from {}", sig.signer));
        }
    }
    if let Some(payload) = &opened.payload {
        for attachment in &payload.attachments {
            display::info(
                "attachment:",
                &format!("{} ({} bytes)", attachment.name, attachment.content.len()),
            );
        }
    }
    Ok(())
}
