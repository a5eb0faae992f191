use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use super::surface::TerminalSurface;
use super::Cli;
use crate::compose::ComposeOrchestrator;
use crate::config::Settings;
use crate::crypto::AgeEngine;
use crate::keys::directory::{DirectoryLookup, FsDirectory, NoDirectory};
use crate::keys::reconcile::KeyReconciler;
use crate::keys::resolver::RecipientResolver;
use crate::keys::store::{FileKeyStore, KeyStore, Keyring};
use crate::popup::PopupSlot;
use crate::unlock::{MemoryPassphraseCache, UnlockBroker};
use crate::view::{drain, ViewEvent, ViewSink};

/// Everything a command needs, wired from the config file and global flags.
pub struct App {
    pub settings: Settings,
    pub keyring: Keyring,
    pub reconciler: Arc<KeyReconciler>,
    pub unlocker: Arc<UnlockBroker>,
    pub orchestrator: ComposeOrchestrator,
    pub host: Arc<TerminalSurface>,
    view: mpsc::UnboundedReceiver<ViewEvent>,
}

impl App {
    pub fn load(cli: &Cli) -> Result<Self> {
        let settings = Settings::load(cli.config.as_deref())?;
        let keyring_id = match &cli.keyring {
            Some(name) => crate::keys::store::KeyringId::new(name)?,
            None => settings.keyring_id()?,
        };

        let store: Arc<dyn KeyStore> = match &cli.home {
            Some(home) => Arc::new(FileKeyStore::open_at(home, &keyring_id)),
            None => Arc::new(FileKeyStore::open(&keyring_id)?),
        };
        let keyring = Keyring::new(keyring_id, store.clone());
        tracing::debug!(keyring = %keyring.id, "keyring opened");

        let (view, rx) = ViewSink::channel();
        let reconciler = Arc::new(KeyReconciler::new(keyring.clone()).with_view(view.clone()));

        let directory: Arc<dyn DirectoryLookup> = match &settings.directory.path {
            Some(path) => Arc::new(FsDirectory::new(path)),
            None => Arc::new(NoDirectory),
        };
        let resolver = Arc::new(RecipientResolver::new(
            reconciler.clone(),
            directory,
            settings.directory.timeout(),
        ));

        let unlocker = Arc::new(UnlockBroker::new(
            Arc::new(MemoryPassphraseCache::new()),
            settings.unlock.clone(),
        ));
        let orchestrator = ComposeOrchestrator::new(
            keyring.clone(),
            resolver,
            unlocker.clone(),
            Arc::new(AgeEngine::new(store)),
            settings.compose.clone(),
        )
        .with_view(view);

        Ok(Self {
            settings,
            keyring,
            reconciler,
            unlocker,
            orchestrator,
            host: Arc::new(TerminalSurface::new(cli.yes)),
            view: rx,
        })
    }

    /// A fresh prompt slot for one operation.
    pub fn slot(&self) -> PopupSlot {
        PopupSlot::new(self.host.clone())
    }

    pub fn take_events(&mut self) -> Vec<ViewEvent> {
        drain(&mut self.view)
    }
}
