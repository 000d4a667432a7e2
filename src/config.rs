//! Persistent configuration document and the snapshot store built on it.
//!
//! The document is a JSON file shared with the presentation layer. The core
//! only reads the `automation` section; `ui` and `system` are carried through
//! untouched so that saving never drops fields the frontend owns.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::ResolutionMode;

/// Directory name under the platform config dir.
pub const APP_DIR_NAME: &str = "dynres";

/// File name of the persistent document.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default grace period before reverting, in milliseconds.
pub const DEFAULT_REVERT_DELAY_MS: u64 = 15_000;

/// Errors reading or writing the persistent document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Frontend theme preference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Dark,
    Light,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub theme: Theme,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemConfig {
    pub autostart: bool,
    pub start_minimized: bool,
}

/// A process-name to display-mode rule. List position is match priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionProfile {
    pub process_name: String,
    pub width: u32,
    pub height: u32,
    pub frequency: u32,
}

impl ResolutionProfile {
    pub fn new(process_name: impl Into<String>, mode: ResolutionMode) -> Self {
        Self {
            process_name: process_name.into(),
            width: mode.width,
            height: mode.height,
            frequency: mode.frequency,
        }
    }

    pub fn mode(&self) -> ResolutionMode {
        ResolutionMode::new(self.width, self.height, self.frequency)
    }
}

/// A process whose focused window confines the cursor.
///
/// Padding is in device pixels and shrinks the window rectangle on each side.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MouseLockEntry {
    pub process_name: String,
    pub padding_x: u32,
    pub padding_y: u32,
}

impl MouseLockEntry {
    pub fn new(process_name: impl Into<String>, padding_x: u32, padding_y: u32) -> Self {
        Self {
            process_name: process_name.into(),
            padding_x,
            padding_y,
        }
    }
}

/// Accepts both `{processName, paddingX, paddingY}` and a bare process name.
impl<'de> Deserialize<'de> for MouseLockEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Padded {
            process_name: String,
            #[serde(default)]
            padding_x: u32,
            #[serde(default)]
            padding_y: u32,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(String),
            Padded(Padded),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bare(process_name) => Self::new(process_name, 0, 0),
            Repr::Padded(p) => Self::new(p.process_name, p.padding_x, p.padding_y),
        })
    }
}

/// The automation rules consumed by the controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AutomationConfig {
    /// Grace period in milliseconds before a revert is applied.
    pub revert_delay: u64,

    /// Mode used when no profile matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<ResolutionMode>,

    pub mouse_lock: Vec<MouseLockEntry>,

    /// Ordered profiles; the first entry matching the focused process wins.
    pub profiles: Vec<ResolutionProfile>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            revert_delay: DEFAULT_REVERT_DELAY_MS,
            default_profile: None,
            mouse_lock: Vec::new(),
            profiles: Vec::new(),
        }
    }
}

impl AutomationConfig {
    pub fn revert_delay(&self) -> Duration {
        Duration::from_millis(self.revert_delay)
    }

    /// Insert a profile, replacing the mode of an existing entry with the
    /// same process name in place.
    pub fn upsert_profile(&mut self, process_name: &str, mode: ResolutionMode) {
        if let Some(existing) = self
            .profiles
            .iter_mut()
            .find(|p| p.process_name == process_name)
        {
            *existing = ResolutionProfile::new(process_name, mode);
        } else {
            self.profiles.push(ResolutionProfile::new(process_name, mode));
        }
    }

    /// Remove the profile for a process. Returns whether one was removed.
    pub fn remove_profile(&mut self, process_name: &str) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|p| p.process_name != process_name);
        self.profiles.len() != before
    }

    /// Insert a mouse-lock entry, replacing an existing one for the same process.
    pub fn upsert_mouse_lock(&mut self, entry: MouseLockEntry) {
        if let Some(existing) = self
            .mouse_lock
            .iter_mut()
            .find(|e| e.process_name == entry.process_name)
        {
            *existing = entry;
        } else {
            self.mouse_lock.push(entry);
        }
    }

    pub fn remove_mouse_lock(&mut self, process_name: &str) -> bool {
        let before = self.mouse_lock.len();
        self.mouse_lock.retain(|e| e.process_name != process_name);
        self.mouse_lock.len() != before
    }

    /// First mouse-lock entry for the given process.
    pub fn mouse_lock_for(&self, process_name: &str) -> Option<&MouseLockEntry> {
        self.mouse_lock
            .iter()
            .find(|e| e.process_name == process_name)
    }
}

/// The whole persistent document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub ui: UiConfig,
    pub system: SystemConfig,
    pub automation: AutomationConfig,
}

impl AppConfig {
    /// Load the document from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the document, or return defaults if it is missing or unusable.
    ///
    /// Defaults mean no profiles, no default mode and no mouse locks, so the
    /// engine keeps running in pass-through mode.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}. Falling back to defaults.", e);
                Self::default()
            }
        }
    }

    /// Write the document as pretty JSON, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

/// Default location of the persistent document.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Cached, atomically replaced view of the persistent document.
///
/// Readers take an `Arc` snapshot, so one evaluation never observes a
/// half-applied edit.
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<Arc<AppConfig>>,
}

impl ConfigStore {
    /// Open the store at `path`, loading the current document.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = AppConfig::load_or_default(&path);
        info!(
            "Loaded config from {} ({} profiles, {} mouse locks)",
            path.display(),
            config.automation.profiles.len(),
            config.automation.mouse_lock.len()
        );
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.tx.borrow().clone()
    }

    /// Owned copy of the current document.
    pub fn get(&self) -> AppConfig {
        self.snapshot().as_ref().clone()
    }

    /// Subscribe to snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.tx.subscribe()
    }

    /// Replace the snapshot and persist it. Last write wins.
    ///
    /// Subscribers see the new snapshot even if the disk write fails.
    pub fn save(&self, config: AppConfig) -> Result<(), ConfigError> {
        let config = Arc::new(config);
        self.tx.send_replace(Arc::clone(&config));
        config.save(&self.path)?;
        debug!("Config saved to {}", self.path.display());
        Ok(())
    }
}
