//! Persisted prewarm settings.
//!
//! Settings live in a TOML file (`.prewarm/config.toml` by default). Loading
//! fills any missing key from defaults; every write goes through the same
//! validation and is persisted by a debounced background writer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = ".prewarm/config.toml";

pub const MIN_DELAY_MS: u64 = 100;
pub const MAX_DELAY_MS: u64 = 5000;

/// How long the store waits for further updates before writing to disk.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Which strategy a prewarm attempt uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrewarmMode {
    /// Quiet generation over the untouched transcript.
    Quiet,
    /// Append a transient user turn, then issue a quiet generation.
    #[default]
    UserMessage,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown prewarm mode '{0}' (expected 'quiet' or 'user_message')")]
pub struct ModeParseError(String);

impl FromStr for PrewarmMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "quiet" => Ok(Self::Quiet),
            "user_message" | "user" => Ok(Self::UserMessage),
            _ => Err(ModeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for PrewarmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quiet => f.write_str("quiet"),
            Self::UserMessage => f.write_str("user_message"),
        }
    }
}

/// User-facing prewarm configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmSettings {
    /// Gate for all prewarm activity.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: PrewarmMode,
    /// Time between the dispatch-ready signal and the cancel.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Body of the throwaway user turn in `user_message` mode.
    #[serde(default = "default_transient_text")]
    pub transient_text: String,
    /// Accept prewarm requests from a cooperating companion process.
    #[serde(default)]
    pub companion_integration: bool,
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_transient_text() -> String {
    ".".to_string()
}

impl Default for PrewarmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: PrewarmMode::default(),
            delay_ms: default_delay_ms(),
            transient_text: default_transient_text(),
            companion_integration: false,
        }
    }
}

impl PrewarmSettings {
    /// Apply field-level validation: clamp the delay and replace blank
    /// transient text with the default.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.set_delay_ms(self.delay_ms);
        let text = std::mem::take(&mut self.transient_text);
        self.set_transient_text(text);
        self
    }

    pub fn set_delay_ms(&mut self, delay_ms: u64) {
        self.delay_ms = delay_ms.clamp(MIN_DELAY_MS, MAX_DELAY_MS);
    }

    pub fn set_transient_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.transient_text = if text.trim().is_empty() {
            default_transient_text()
        } else {
            text
        };
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Render as TOML, the same form the store writes to disk.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("failed to serialize prewarm settings")
    }
}

/// Load settings from `path`, falling back to defaults if the file is missing.
pub fn load(path: &Path) -> Result<PrewarmSettings> {
    if !path.exists() {
        return Ok(PrewarmSettings::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let settings: PrewarmSettings =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(settings.validated())
}

fn write(path: &Path, settings: &PrewarmSettings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = settings.to_toml()?;
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

// ── Store ───────────────────────────────────────────────────────────────

/// Shared, validated settings with debounced write-through persistence.
///
/// Cloning is cheap; all clones observe and mutate the same settings.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tx: watch::Sender<PrewarmSettings>,
    path: Option<PathBuf>,
    /// Serializes file writes between the debounce task and `flush`.
    write_lock: Arc<Mutex<()>>,
}

impl SettingsStore {
    /// A store that never touches disk.
    pub fn in_memory(settings: PrewarmSettings) -> Self {
        let (tx, _rx) = watch::channel(settings.validated());
        Self {
            inner: Arc::new(StoreInner {
                tx,
                path: None,
                write_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Load settings from `path` and start the debounced writer.
    ///
    /// The writer exits once every clone of the store is dropped, writing
    /// out any change still inside the debounce window first.
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self> {
        let path = path.into();
        let settings = load(&path)?;
        let (tx, rx) = watch::channel(settings);
        let write_lock = Arc::new(Mutex::new(()));
        tokio::spawn(debounced_writer(
            path.clone(),
            Arc::clone(&write_lock),
            rx,
            debounce,
        ));
        Ok(Self {
            inner: Arc::new(StoreInner {
                tx,
                path: Some(path),
                write_lock,
            }),
        })
    }

    /// Current settings.
    pub fn snapshot(&self) -> PrewarmSettings {
        self.inner.tx.borrow().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Mutate the settings, validate the result and schedule a write.
    pub fn update(&self, f: impl FnOnce(&mut PrewarmSettings)) -> PrewarmSettings {
        self.inner.tx.send_modify(|settings| {
            f(settings);
            *settings = settings.clone().validated();
        });
        self.snapshot()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update(|s| s.enabled = enabled);
    }

    pub fn set_mode(&self, mode: PrewarmMode) {
        self.update(|s| s.mode = mode);
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.update(|s| s.set_delay_ms(delay_ms));
    }

    pub fn set_transient_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|s| s.set_transient_text(text));
    }

    pub fn set_companion_integration(&self, enabled: bool) {
        self.update(|s| s.companion_integration = enabled);
    }

    /// Write the current settings to disk immediately.
    pub async fn flush(&self) -> Result<()> {
        self.inner.persist().await
    }
}

impl StoreInner {
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let settings = self.tx.borrow().clone();
        persist(path, &self.write_lock, &settings).await
    }
}

async fn persist(path: &Path, write_lock: &Mutex<()>, settings: &PrewarmSettings) -> Result<()> {
    let _guard = write_lock.lock().await;
    write(path, settings)?;
    debug!(path = %path.display(), "persisted prewarm settings");
    Ok(())
}

/// Wait for a change, then keep waiting until `debounce` passes with no
/// further change, then write once. A pending change is written out when
/// the store closes mid-window.
async fn debounced_writer(
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
    mut rx: watch::Receiver<PrewarmSettings>,
    debounce: Duration,
) {
    while rx.changed().await.is_ok() {
        let closed = loop {
            match tokio::time::timeout(debounce, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break true,
                Err(_) => break false,
            }
        };
        let settings = rx.borrow_and_update().clone();
        if let Err(e) = persist(&path, &write_lock, &settings).await {
            warn!("failed to persist prewarm settings: {e:#}");
        }
        if closed {
            debug!("settings store closed, writer exiting");
            return;
        }
    }
}
