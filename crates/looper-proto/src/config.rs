use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub looping: LoopingConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON file per persisted collection, plus the log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_recent_cap")]
    pub recent_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// 0–100
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    /// Passed to mpv verbatim after the built-in arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Initial values for the loop form and completion behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopingConfig {
    #[serde(default = "default_target_loops")]
    pub default_target_loops: u32,
    #[serde(default)]
    pub default_start_secs: f64,
    #[serde(default = "default_end_secs")]
    pub default_end_secs: f64,
    #[serde(default = "default_playback_rate")]
    pub default_playback_rate: f64,
    #[serde(default = "default_loop_notice_secs")]
    pub completion_notice_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,
    #[serde(default = "default_playlist_notice_secs")]
    pub completion_notice_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metadata_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_oembed_endpoint")]
    pub endpoint: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            recent_cap: default_recent_cap(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for LoopingConfig {
    fn default() -> Self {
        Self {
            default_target_loops: default_target_loops(),
            default_start_secs: 0.0,
            default_end_secs: default_end_secs(),
            default_playback_rate: default_playback_rate(),
            completion_notice_secs: default_loop_notice_secs(),
        }
    }
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            completion_notice_secs: default_playlist_notice_secs(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: default_metadata_enabled(),
            timeout_ms: default_metadata_timeout_ms(),
            endpoint: default_oembed_endpoint(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    platform::data_dir()
}

fn default_recent_cap() -> usize {
    100
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_volume() -> u8 {
    75
}

fn default_target_loops() -> u32 {
    5
}

fn default_end_secs() -> f64 {
    10.0
}

fn default_playback_rate() -> f64 {
    1.0
}

fn default_loop_notice_secs() -> u64 {
    3
}

fn default_countdown_secs() -> u32 {
    5
}

fn default_playlist_notice_secs() -> u64 {
    5
}

fn default_metadata_enabled() -> bool {
    true
}

fn default_metadata_timeout_ms() -> u64 {
    5000
}

fn default_oembed_endpoint() -> String {
    "https://www.youtube.com/oembed".to_string()
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn log_path(&self) -> PathBuf {
        self.storage.data_dir.join("looper.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.mpv.default_volume, 75);
        assert_eq!(config.looping.default_target_loops, 5);
        assert_eq!(config.looping.default_end_secs, 10.0);
        assert_eq!(config.playlist.countdown_secs, 5);
        assert!(config.metadata.endpoint.starts_with("https://"));
        assert!(config.storage.data_dir.ends_with("looper"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[http]\nport = 9000\n\n[looping]\ndefault_target_loops = 2\n").unwrap();
        assert_eq!(config.http.port, 9000);
        assert!(config.http.enabled);
        assert_eq!(config.looping.default_target_loops, 2);
        assert_eq!(config.looping.default_playback_rate, 1.0);
        assert_eq!(config.metadata.timeout_ms, 5000);
    }
}
