use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_spacing() -> u32 {
    16
}

fn default_background() -> [u8; 4] {
    [255, 255, 255, 255]
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_deadline_secs() -> u64 {
    300
}

fn default_bind_addr() -> String {
    "127.0.0.1:8710".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub gemini_text_model: Option<String>,
    pub render_base_url: Option<String>,
    pub render_api_key: Option<String>,
    /// Pixels between avatars on the composite canvas.
    #[serde(default = "default_spacing")]
    pub composite_spacing: u32,
    /// RGBA fill for the composite canvas.
    #[serde(default = "default_background")]
    pub composite_background: [u8; 4],
    #[serde(default = "default_poll_interval_ms")]
    pub render_poll_interval_ms: u64,
    #[serde(default = "default_poll_deadline_secs")]
    pub render_poll_deadline_secs: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            gemini_api_key: None,
            gemini_text_model: None,
            render_base_url: None,
            render_api_key: None,
            composite_spacing: default_spacing(),
            composite_background: default_background(),
            render_poll_interval_ms: default_poll_interval_ms(),
            render_poll_deadline_secs: default_poll_deadline_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings_from_dir(data_dir: &Path) -> Settings {
    let path = settings_path(data_dir);
    if let Ok(bytes) = fs::read(&path) {
        if let Ok(s) = serde_json::from_slice::<Settings>(&bytes) {
            return s;
        }
    }
    Settings::default()
}

pub fn save_settings_to_dir(data_dir: &Path, s: &Settings) -> Result<()> {
    let path = settings_path(data_dir);
    let json = serde_json::to_vec_pretty(s)?;
    fs::write(path, json).context("write settings")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_dir(dir.path());
        assert_eq!(s.composite_spacing, 16);
        assert!(s.gemini_api_key.is_none());
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.render_base_url = Some("http://localhost:9901".into());
        s.composite_spacing = 24;
        save_settings_to_dir(dir.path(), &s).unwrap();
        let loaded = load_settings_from_dir(dir.path());
        assert_eq!(loaded.render_base_url.as_deref(), Some("http://localhost:9901"));
        assert_eq!(loaded.composite_spacing, 24);
    }
}
