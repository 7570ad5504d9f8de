use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::config::{self, DEFAULT_DEBOUNCE, PrewarmMode, PrewarmSettings, SettingsStore};

/// Field updates requested on the command line. `None` leaves a field as is.
#[derive(Debug, Default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub mode: Option<PrewarmMode>,
    pub delay_ms: Option<u64>,
    pub transient_text: Option<String>,
    pub companion: Option<bool>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.mode.is_none()
            && self.delay_ms.is_none()
            && self.transient_text.is_none()
            && self.companion.is_none()
    }
}

/// Print the effective settings at `path`.
pub fn show<W: Write>(path: &Path, writer: &mut W) -> Result<()> {
    let settings = config::load(path)?;
    write_settings(&settings, writer)
}

/// Apply `update` through the store's validation, write it out and print
/// the result.
pub async fn set<W: Write>(path: &Path, update: ConfigUpdate, writer: &mut W) -> Result<()> {
    if update.is_empty() {
        anyhow::bail!("nothing to set; pass at least one setting flag");
    }
    let store = SettingsStore::open(path, DEFAULT_DEBOUNCE)?;
    if let Some(enabled) = update.enabled {
        store.set_enabled(enabled);
    }
    if let Some(mode) = update.mode {
        store.set_mode(mode);
    }
    if let Some(delay_ms) = update.delay_ms {
        store.set_delay_ms(delay_ms);
    }
    if let Some(text) = update.transient_text {
        store.set_transient_text(text);
    }
    if let Some(companion) = update.companion {
        store.set_companion_integration(companion);
    }
    store.flush().await?;
    write_settings(&store.snapshot(), writer)
}

fn write_settings<W: Write>(settings: &PrewarmSettings, writer: &mut W) -> Result<()> {
    write!(writer, "{}", settings.to_toml()?)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn show_prints_defaults_without_a_file() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        show(&dir.path().join("config.toml"), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("enabled = false"));
        assert!(out.contains("delay_ms = 1000"));
    }

    #[tokio::test]
    async fn set_validates_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".prewarm").join("config.toml");
        let mut out = Vec::new();
        set(
            &path,
            ConfigUpdate {
                enabled: Some(true),
                delay_ms: Some(9000),
                transient_text: Some(String::new()),
                ..ConfigUpdate::default()
            },
            &mut out,
        )
        .await
        .unwrap();

        let on_disk = config::load(&path).unwrap();
        assert!(on_disk.enabled);
        assert_eq!(on_disk.delay_ms, config::MAX_DELAY_MS);
        assert_eq!(on_disk.transient_text, ".");
        assert!(String::from_utf8(out).unwrap().contains("delay_ms = 5000"));
    }

    #[tokio::test]
    async fn set_keeps_untouched_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mode = \"quiet\"\ntransient_text = \"warm\"\n").unwrap();
        set(
            &path,
            ConfigUpdate {
                companion: Some(true),
                ..ConfigUpdate::default()
            },
            &mut Vec::<u8>::new(),
        )
        .await
        .unwrap();

        let on_disk = config::load(&path).unwrap();
        assert_eq!(on_disk.mode, PrewarmMode::Quiet);
        assert_eq!(on_disk.transient_text, "warm");
        assert!(on_disk.companion_integration);
    }

    #[tokio::test]
    async fn set_without_fields_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = set(
            &dir.path().join("config.toml"),
            ConfigUpdate::default(),
            &mut Vec::<u8>::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("nothing to set"));
    }
}
