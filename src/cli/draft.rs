use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tokio::sync::oneshot;

use super::compose::finished;
use super::context::App;
use super::input::{read_attachments, read_body, read_text, write_output, write_secret};
use crate::compose::Payload;
use crate::keys::cert::Fingerprint;
use crate::ui::display;

#[derive(Args)]
pub struct DraftArgs {
    #[command(subcommand)]
    pub command: DraftCommand,
}

#[derive(Subcommand)]
pub enum DraftCommand {
    /// Encrypt a draft to your own key, attachments included
    Save {
        #[arg(long, short)]
        subject: Option<String>,

        /// Read the body from this file instead of stdin
        #[arg(long)]
        body_file: Option<PathBuf>,

        #[arg(long, short)]
        attach: Vec<PathBuf>,

        /// Own key to encrypt and sign with (defaults to the default key)
        #[arg(long)]
        signer: Option<String>,

        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long, short)]
        force: bool,
    },

    /// Decrypt a draft saved with `draft save`
    Open {
        file: PathBuf,

        /// Write the draft's attachments into this directory
        #[arg(long)]
        attachments_dir: Option<PathBuf>,

        #[arg(long, short)]
        force: bool,
    },
}

pub async fn run(args: DraftArgs, app: &mut App, quiet: bool) -> Result<()> {
    match args.command {
        DraftCommand::Save {
            subject,
            body_file,
            attach,
            signer,
            output,
            force,
        } => {
            let payload = Payload {
                subject,
                body: read_body(body_file.as_deref())?,
                quote: None,
                attachments: read_attachments(&attach)?,
            };
            let signer = signer.as_deref().map(Fingerprint::parse).transpose()?;

            let (_close, closed) = oneshot::channel();
            let session = app
                .orchestrator
                .save_draft(payload, signer, app.host.clone(), closed)
                .await;
            super::render_events(app.take_events(), quiet);

            let Some(composed) = finished(session.into_outcome())? else {
                return Ok(());
            };
            write_output(output.as_deref(), composed.message.as_bytes(), force)?;
            if !quiet {
                display::ok("draft saved");
            }
            Ok(())
        }
        DraftCommand::Open {
            file,
            attachments_dir,
            force,
        } => {
            let armored = read_text(&file)?;
            let mut slot = app.slot();
            let restored = app.orchestrator.restore_draft(&armored, &mut slot).await;
            drop(slot);
            super::render_events(app.take_events(), quiet);
            let payload = match restored {
                Ok(payload) => payload,
                Err(e) if e.is_cancel() => {
                    tracing::debug!("draft restore canceled");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(subject) = &payload.subject {
                println!("Subject: {}", subject);
                println!();
            }
            print!("{}", payload.body);

            if payload.attachments.is_empty() {
                return Ok(());
            }
            let dir = attachments_dir.unwrap_or_else(|| PathBuf::from("."));
            for attachment in &payload.attachments {
                // names come from the decrypted draft; keep them inside `dir`
                let name = Path::new(&attachment.name)
                    .file_name()
                    .with_context(|| format!("unusable attachment name '{}'", attachment.name))?;
                let path = dir.join(name);
                write_secret(&path, &attachment.content, force)?;
                if !quiet {
                    display::info("attachment:", &path.display().to_string());
                }
            }
            Ok(())
        }
    }
}
