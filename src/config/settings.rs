use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::keys::identity::DEFAULT_WORK_FACTOR;
use crate::keys::store::KeyringId;

pub const FILE_NAME: &str = "sealpost.toml";

/// User configuration from `sealpost.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub keyring: KeyringSettings,
    pub compose: ComposeSettings,
    pub unlock: UnlockSettings,
    pub directory: DirectorySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyringSettings {
    pub id: String,
}

impl Default for KeyringSettings {
    fn default() -> Self {
        Self {
            id: KeyringId::MAIN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposeSettings {
    /// Encrypt every message to the sender's own key as well.
    pub auto_add_own_key: bool,
    pub max_parallel_attachments: usize,
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            auto_add_own_key: true,
            max_parallel_attachments: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnlockSettings {
    pub cache: bool,
    pub cache_ttl_secs: u64,
    /// Passphrase attempts on a single prompt before giving up.
    pub max_attempts: u32,
    pub scrypt_work_factor: u8,
}

impl Default for UnlockSettings {
    fn default() -> Self {
        Self {
            cache: true,
            cache_ttl_secs: 600,
            max_attempts: 3,
            scrypt_work_factor: DEFAULT_WORK_FACTOR,
        }
    }
}

impl UnlockSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Folder of `<address>.asc` files. Lookups are disabled when unset.
    pub path: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            path: None,
            timeout_secs: 10,
        }
    }
}

impl DirectorySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    /// Load from `config_path`, else the platform config dir.
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => match default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if config_path.is_some() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("invalid config in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        KeyringId::new(&self.keyring.id)?;
        if self.compose.max_parallel_attachments == 0 {
            anyhow::bail!("compose.max_parallel_attachments must be at least 1");
        }
        if self.unlock.max_attempts == 0 {
            anyhow::bail!("unlock.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn keyring_id(&self) -> Result<KeyringId> {
        Ok(KeyringId::new(&self.keyring.id)?)
    }
}

fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "sealpost", "sealpost")
        .map(|dirs| dirs.config_dir().join(FILE_NAME))
}
