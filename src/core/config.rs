use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Whether new sessions request scene illustrations.
    #[serde(default = "default_true")]
    pub illustrations: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaybackConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_skip_seconds")]
    pub skip_seconds: f64,
    /// Below this position "previous" jumps to the prior queue entry,
    /// at or above it the current story restarts.
    #[serde(default = "default_previous_threshold")]
    pub previous_track_threshold_seconds: f64,
    #[serde(default = "default_speed")]
    pub default_speed: f32,
    #[serde(default = "default_min_speed")]
    pub min_speed: f32,
    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
    #[serde(default = "default_true")]
    pub auto_advance: bool,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/api/v1".to_string()
}
fn default_timeout() -> u64 {
    120
}
fn default_language() -> String {
    "en".to_string()
}
fn default_voice() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}
fn default_tick_interval() -> u64 {
    100
}
fn default_skip_seconds() -> f64 {
    15.0
}
fn default_previous_threshold() -> f64 {
    3.0
}
fn default_speed() -> f32 {
    1.0
}
fn default_min_speed() -> f32 {
    0.5
}
fn default_max_speed() -> f32 {
    2.0
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            voice: default_voice(),
            illustrations: true,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            skip_seconds: default_skip_seconds(),
            previous_track_threshold_seconds: default_previous_threshold(),
            default_speed: default_speed(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            auto_advance: true,
        }
    }
}

impl BackendConfig {
    pub fn url(&self) -> Result<url::Url> {
        let url = url::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid backend base_url: {}", self.base_url))?;
        if url.cannot_be_a_base() {
            anyhow::bail!("Backend base_url cannot be used as a base: {}", self.base_url);
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn clamp_speed(&self, speed: f32) -> f32 {
        if !speed.is_finite() {
            return self.default_speed;
        }
        speed.clamp(self.min_speed, self.max_speed)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", CONFIG_FILE);
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.backend.url()?;
        let p = &self.playback;
        if p.min_speed <= 0.0 || p.min_speed > p.max_speed {
            anyhow::bail!(
                "Invalid playback speed range: {}..{}",
                p.min_speed,
                p.max_speed
            );
        }
        if p.previous_track_threshold_seconds < 0.0 {
            anyhow::bail!("previous_track_threshold_seconds must not be negative");
        }
        Ok(())
    }
}
