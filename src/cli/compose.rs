use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Args;
use tokio::sync::oneshot;

use super::context::App;
use super::input::{read_attachments, read_body, read_text, write_output};
use crate::compose::{ComposeOutcome, ComposeRequest, Composed, Payload};
use crate::keys::cert::Fingerprint;
use crate::ui::display;

#[derive(Args)]
pub struct ComposeArgs {
    /// Recipient address (repeatable)
    #[arg(long, short = 't', required_unless_present = "sign_only")]
    pub to: Vec<String>,

    #[arg(long, short)]
    pub subject: Option<String>,

    /// Read the body from this file instead of stdin
    #[arg(long)]
    pub body_file: Option<PathBuf>,

    /// Quote this file below the body
    #[arg(long)]
    pub quote: Option<PathBuf>,

    /// Attach a file (repeatable); encrypted separately next to the message
    #[arg(long, short)]
    pub attach: Vec<PathBuf>,

    /// Sign without encrypting; attachments are inlined
    #[arg(long, conflicts_with_all = ["to", "no_sign"])]
    pub sign_only: bool,

    /// Encrypt without signing
    #[arg(long)]
    pub no_sign: bool,

    /// Sign with this key instead of the default
    #[arg(long)]
    pub signer: Option<String>,

    /// Write the message here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Directory for encrypted attachments (defaults to the output's directory)
    #[arg(long)]
    pub attachments_dir: Option<PathBuf>,

    /// Overwrite existing files
    #[arg(long, short)]
    pub force: bool,
}

pub async fn run(args: ComposeArgs, app: &mut App, quiet: bool) -> Result<()> {
    let payload = Payload {
        subject: args.subject.clone(),
        body: read_body(args.body_file.as_deref())?,
        quote: args.quote.as_deref().map(read_text).transpose()?,
        attachments: read_attachments(&args.attach)?,
    };

    let mut request = if args.sign_only {
        ComposeRequest::sign_only(payload)
    } else {
        ComposeRequest::encrypt(args.to.clone(), payload)
    };
    request.sign = !args.no_sign;
    request.signing_key = args.signer.as_deref().map(Fingerprint::parse).transpose()?;

    // the terminal surface never closes on its own
    let (_close, closed) = oneshot::channel();
    let session = app
        .orchestrator
        .run(request, app.host.clone(), closed)
        .await;
    tracing::debug!(states = ?session.history(), "compose finished");
    super::render_events(app.take_events(), quiet);

    match finished(session.into_outcome())? {
        Some(composed) => write_composed(&composed, &args, quiet),
        None => Ok(()),
    }
}

/// Turn a terminal outcome into a command result.
///
/// Cancellation is not an error: it yields `None` and nothing is written.
pub(crate) fn finished(outcome: Option<ComposeOutcome>) -> Result<Option<Composed>> {
    match outcome {
        Some(ComposeOutcome::Succeeded(composed)) => Ok(Some(composed)),
        Some(ComposeOutcome::Failed(err)) if err.is_cancel() => Ok(canceled()),
        Some(ComposeOutcome::Failed(err)) => Err(err.into()),
        Some(ComposeOutcome::Canceled) => Ok(canceled()),
        None => bail!("compose did not finish"),
    }
}

fn canceled() -> Option<Composed> {
    tracing::debug!("canceled by user");
    None
}

fn write_composed(composed: &Composed, args: &ComposeArgs, quiet: bool) -> Result<()> {
    write_output(args.output.as_deref(), composed.message.as_bytes(), args.force)?;

    let dir = args
        .attachments_dir
        .clone()
        .or_else(|| {
            args.output
                .as_deref()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| PathBuf::from("."));
    for attachment in &composed.attachments {
        let path = dir.join(format!("{}.sealpost", attachment.name));
        write_output(Some(&path), attachment.armored.as_bytes(), args.force)?;
        if !quiet {
            display::info("attachment:", &path.display().to_string());
        }
    }

    if !quiet {
        match &composed.signer {
            Some(signer) => display::info("signed by:", signer.as_str()),
            None => display::info("signed by:", "(unsigned)"),
        }
        for fp in &composed.fingerprints {
            display::info("encrypted to:", fp.as_str());
        }
        display::ok("message ready");
    }
    Ok(())
}
