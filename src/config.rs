//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables, `__` between sections: `APP_VOICE__URL`,
//!    `APP_AUDIO__FRAME_SIZE`, `APP_PLANNING__BASE_URL`
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Runtime updates through `PUT /api/v1/config` take effect for the next voice
//! session; a live session keeps the settings it started with.

use crate::audio::buffer::OverflowPolicy;
use crate::voice::player::PlaybackMode;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: control API bind address
/// - **voice**: agent endpoint and session tuning
/// - **audio**: capture format
/// - **planning**: detection / load-plan / chat collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
    pub planning: PlanningConfig,
}

/// Control API bind address.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only local operators (default)
/// - `host = "0.0.0.0"`: reachable from the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Voice stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Agent endpoint, `ws://` or `wss://` (rustls, webpki roots) URL.
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Captured frames buffered while the connection is slow (64 × 4096 samples ≈ 6 s).
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Pong delay used when a ping does not specify one.
    pub default_ping_delay_ms: u64,
    pub playback_mode: PlaybackMode,
    /// Agent clips waiting to be decoded.
    pub playback_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Preferred capture rate; the device may dictate another.
    pub sample_rate: u32,
    /// Samples per outbound chunk.
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub grid_width: u32,
    pub grid_height: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            voice: VoiceConfig {
                url: "ws://127.0.0.1:8000/voice-stream".to_string(),
                connect_timeout_ms: 10_000,
                outbound_queue_capacity: 64,
                overflow_policy: OverflowPolicy::DropOldest,
                default_ping_delay_ms: 1000,
                playback_mode: PlaybackMode::Overlap,
                playback_queue_capacity: 32,
            },
            audio: AudioConfig {
                sample_rate: 44_100,
                frame_size: 4096,
            },
            planning: PlanningConfig {
                base_url: "http://127.0.0.1:8000".to_string(),
                timeout_secs: 30,
                grid_width: 20,
                grid_height: 15,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_VOICE__URL=ws://agent.local:8000/voice-stream`
    /// - `APP_VOICE__PLAYBACK_MODE=serialize`
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the server or a session unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let url = self.voice.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Voice URL must be a ws:// or wss:// URL, got {}", url));
        }
        if self.voice.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Voice connect timeout must be greater than 0"));
        }
        if self.voice.outbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Outbound queue capacity must be greater than 0"));
        }
        if self.voice.playback_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Playback queue capacity must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }
        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if !(self.planning.base_url.starts_with("http://") || self.planning.base_url.starts_with("https://")) {
            return Err(anyhow::anyhow!("Planning base URL must be an http(s) URL"));
        }
        if self.planning.grid_width == 0 || self.planning.grid_height == 0 {
            return Err(anyhow::anyhow!("Planning grid dimensions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"voice": {"playback_mode": "serialize"}}`.
    ///
    /// Fields not present keep their value. The result is validated; on any error the
    /// configuration is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Config update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Render as TOML, the format of `config.toml`.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.voice.default_ping_delay_ms, 1000);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.voice.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voice.url = "http://not-a-socket".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voice.url = "wss://agent.example.com/voice-stream".to_string();
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "voice": {"playback_mode": "serialize"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.voice.playback_mode, PlaybackMode::Serialize);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.voice.url, "ws://127.0.0.1:8000/voice-stream");
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"audio": {"frame_size": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"voice": {"overflow_policy": "drop_everything"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[voice]"));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }
}
