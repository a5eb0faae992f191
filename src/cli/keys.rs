use std::path::PathBuf;

use age::secrecy::SecretString;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use is_terminal::IsTerminal;

use super::context::App;
use super::input::read_text;
use super::surface::PASSPHRASE_ENV;
use crate::keys::cert::{Cert, Fingerprint, UserId};
use crate::keys::identity::UnlockedKey;
use crate::keys::reconcile::{CandidateKey, KeySource};
use crate::ui::display;
use crate::unlock::{UnlockReason, UnlockRequest, Unlocker};

#[derive(Parser)]
pub struct KeysArgs {
    #[command(subcommand)]
    pub command: KeysCommand,
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Generate a passphrase-protected key for an address
    Init {
        /// Your address (e.g. alice@example.com)
        address: String,

        /// Display name bound next to the address
        #[arg(long)]
        name: Option<String>,
    },

    /// Print a public key (your default key unless a fingerprint is given)
    Export {
        fingerprint: Option<String>,
    },

    /// Import someone's public key (asks before changing trust)
    Import {
        /// Path to an armored public key
        file: PathBuf,

        /// Treat the key as a rotation of a key you already have
        #[arg(long)]
        rotation: bool,
    },

    /// Show all keys in the keyring
    List,

    /// Remove a key from the keyring
    Remove {
        fingerprint: String,
    },

    /// Revoke one of your keys and print the revoked public key
    Revoke {
        fingerprint: String,

        #[arg(long, default_value = "key is no longer used")]
        reason: String,
    },

    /// Choose the default signing key
    Default {
        fingerprint: String,
    },
}

pub async fn run(args: KeysArgs, app: &mut App, quiet: bool) -> Result<()> {
    match args.command {
        KeysCommand::Init { address, name } => cmd_init(app, &address, name.as_deref()).await,
        KeysCommand::Export { fingerprint } => cmd_export(app, fingerprint.as_deref()),
        KeysCommand::Import { file, rotation } => cmd_import(app, &file, rotation, quiet).await,
        KeysCommand::List => cmd_list(app),
        KeysCommand::Remove { fingerprint } => cmd_remove(app, &fingerprint).await,
        KeysCommand::Revoke {
            fingerprint,
            reason,
        } => cmd_revoke(app, &fingerprint, &reason).await,
        KeysCommand::Default { fingerprint } => cmd_default(app, &fingerprint).await,
    }
}

async fn cmd_init(app: &App, address: &str, name: Option<&str>) -> Result<()> {
    if !address.contains('@') || address.chars().any(char::is_whitespace) {
        bail!("'{}' is not an address", address);
    }
    let user_id = UserId::new(address, name);
    let passphrase = new_passphrase()?;
    let work_factor = app.settings.unlock.scrypt_work_factor;

    let (cert, _) = tokio::task::spawn_blocking(move || {
        UnlockedKey::generate(&user_id, &passphrase, work_factor)
    })
    .await
    .context("key generation task failed")??;

    app.reconciler.install_own_key(&cert).await?;
    if app.keyring.store.default_signing_fingerprint()?.is_none() {
        app.reconciler.set_default_key(cert.fingerprint()).await?;
    }

    display::ok("key generated");
    display::info("fingerprint:", cert.fingerprint().as_str());
    display::info("keyring:", app.keyring.id.as_str());
    eprintln!();
    eprintln!("Share your public key with: sealpost keys export");
    println!("{}", cert.fingerprint());
    Ok(())
}

fn cmd_export(app: &App, fingerprint: Option<&str>) -> Result<()> {
    let store = &app.keyring.store;
    let fp = match fingerprint {
        Some(fp) => Fingerprint::parse(fp)?,
        None => store
            .default_signing_fingerprint()?
            .context("no default key. Create one with: sealpost keys init <address>")?,
    };
    let cert = find(app, &fp)?;
    print!("{}", cert.public().to_armored());
    Ok(())
}

async fn cmd_import(
    app: &mut App,
    file: &std::path::Path,
    rotation: bool,
    quiet: bool,
) -> Result<()> {
    let text = read_text(file)?;
    let source = if rotation {
        KeySource::Rotation
    } else {
        KeySource::Import
    };
    let candidate = CandidateKey::from_armored(&text, source)?;

    let mut slot = app.slot();
    let applied = app.reconciler.import(candidate, &mut slot).await?;
    drop(slot);
    super::render_events(app.take_events(), quiet);
    tracing::debug!(?applied, "import finished");
    Ok(())
}

fn cmd_list(app: &App) -> Result<()> {
    let store = &app.keyring.store;
    let certs = store.list()?;
    if certs.is_empty() {
        eprintln!("No keys. Create one with: sealpost keys init <address>");
        return Ok(());
    }
    let default = store.default_signing_fingerprint()?;
    for cert in &certs {
        println!(
            "{}",
            display::key_line(cert, default.as_ref() == Some(cert.fingerprint()))
        );
    }
    Ok(())
}

async fn cmd_remove(app: &App, fingerprint: &str) -> Result<()> {
    let fp = Fingerprint::parse(fingerprint)?;
    let cert = find(app, &fp)?;
    if cert.is_private() && !confirm_remove_private(app)? {
        bail!("aborted: private key {} kept", fp);
    }
    if !app.reconciler.remove_key(&fp).await? {
        bail!("key {} was removed concurrently", fp);
    }
    display::ok(&format!("removed key {}", fp));
    Ok(())
}

async fn cmd_revoke(app: &App, fingerprint: &str, reason: &str) -> Result<()> {
    let fp = Fingerprint::parse(fingerprint)?;
    let cert = find(app, &fp)?;
    if !cert.is_private() {
        bail!("{} is not one of your keys", fp);
    }

    let mut slot = app.slot();
    let key = app
        .unlocker
        .unlock(
            UnlockRequest {
                cert: &cert,
                reason: UnlockReason::Sign,
                cache_allowed: false,
            },
            &mut slot,
        )
        .await?;
    let revoked = key.revoke(&cert.public(), reason)?;
    app.reconciler.install_own_key(&revoked).await?;

    display::ok(&format!("revoked key {}", fp));
    eprintln!("Publish the revoked key below so others stop using it:");
    print!("{}", revoked.to_armored());
    Ok(())
}

async fn cmd_default(app: &App, fingerprint: &str) -> Result<()> {
    let fp = Fingerprint::parse(fingerprint)?;
    if !find(app, &fp)?.is_private() {
        bail!("{} is not one of your keys", fp);
    }
    app.reconciler.set_default_key(&fp).await?;
    display::ok(&format!("default signing key set to {}", fp));
    Ok(())
}

fn find(app: &App, fp: &Fingerprint) -> Result<Cert> {
    app.keyring
        .store
        .get_by_fingerprint(fp)?
        .with_context(|| format!("no key {} in keyring '{}'", fp, app.keyring.id))
}

fn confirm_remove_private(app: &App) -> Result<bool> {
    if app.host.assumes_yes() {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("refusing to remove a private key without --yes in non-interactive mode");
    }
    Ok(dialoguer::Confirm::new()
        .with_prompt("This is a private key. Remove it?")
        .default(false)
        .interact()?)
}

/// Passphrase for a new key: from the environment, else asked twice on the TTY.
fn new_passphrase() -> Result<SecretString> {
    if let Ok(p) = std::env::var(PASSPHRASE_ENV) {
        if !p.is_empty() {
            return Ok(SecretString::from(p));
        }
    }
    if !std::io::stdin().is_terminal() {
        bail!("set {} to create a key in non-interactive mode", PASSPHRASE_ENV);
    }
    let p = dialoguer::Password::new()
        .with_prompt("Passphrase for the new key")
        .with_confirmation("Repeat passphrase", "passphrases do not match")
        .interact()?;
    Ok(SecretString::from(p))
}
