//! Configuration loading and parsing.
//!
//! Defines the server config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use audio_pipeline::player::PlayerConfig;
use audio_pipeline::transcode::StreamOptions;
use serde::Deserialize;

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Media library root directory.
    pub media_dir: Option<String>,
    /// Directory for persistent data such as favorites.
    pub storage_dir: Option<String>,
    /// On-demand stream pacing.
    pub streaming: Option<StreamingConfig>,
    /// Live player tuning.
    pub player: Option<PlayerSettings>,
}

/// `[streaming]` table.
#[derive(Debug, Default, Deserialize)]
pub struct StreamingConfig {
    /// Encoded bytes to send ahead of the play position (default: 512 KiB).
    pub stream_ahead_bytes: Option<usize>,
    /// Audio time to send ahead of the play position (default: 10000).
    pub stream_ahead_time_ms: Option<u64>,
    /// Limit throughput to playback speed (default: true).
    pub throttle: Option<bool>,
    /// Avoid randomness in encoded output, for automated testing.
    pub deterministic: Option<bool>,
}

/// `[player]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlayerSettings {
    /// Frames buffered per listener before frames are dropped.
    pub output_buffer_frames: Option<usize>,
    /// Queued commands before callers block.
    pub command_capacity: Option<usize>,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Parse an optional bind address from config.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<Option<SocketAddr>> {
    let Some(bind) = cfg.bind.as_deref() else {
        return Ok(None);
    };
    let addr = bind.parse().with_context(|| format!("parse bind {bind}"))?;
    Ok(Some(addr))
}

/// Extract the media directory from config.
pub fn media_dir_from_config(cfg: &ServerConfig) -> Result<PathBuf> {
    non_empty_path(cfg.media_dir.as_deref())
        .ok_or_else(|| anyhow::anyhow!("media_dir is required; use --media-dir"))
}

/// Extract the storage directory from config.
pub fn storage_dir_from_config(cfg: &ServerConfig) -> Result<PathBuf> {
    non_empty_path(cfg.storage_dir.as_deref())
        .ok_or_else(|| anyhow::anyhow!("storage_dir is required; use --storage-dir"))
}

fn non_empty_path(path: Option<&str>) -> Option<PathBuf> {
    path.map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Resolve stream pacing, falling back to the pipeline defaults.
pub fn stream_options_from_config(cfg: &ServerConfig) -> StreamOptions {
    let defaults = StreamOptions::default();
    let Some(streaming) = cfg.streaming.as_ref() else {
        return defaults;
    };
    StreamOptions {
        stream_ahead_bytes: streaming
            .stream_ahead_bytes
            .unwrap_or(defaults.stream_ahead_bytes),
        stream_ahead_time: streaming
            .stream_ahead_time_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.stream_ahead_time),
        throttle: streaming.throttle.unwrap_or(defaults.throttle),
        deterministic: streaming.deterministic.unwrap_or(defaults.deterministic),
    }
}

/// Resolve player tuning, falling back to the pipeline defaults.
pub fn player_config_from_config(cfg: &ServerConfig) -> PlayerConfig {
    let defaults = PlayerConfig::default();
    let Some(player) = cfg.player.as_ref() else {
        return defaults;
    };
    PlayerConfig {
        output_buffer_frames: player
            .output_buffer_frames
            .unwrap_or(defaults.output_buffer_frames),
        command_capacity: player.command_capacity.unwrap_or(defaults.command_capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_from_config_parses_when_present() {
        let cfg = ServerConfig {
            bind: Some("127.0.0.1:9000".to_string()),
            ..Default::default()
        };
        let addr = bind_from_config(&cfg).unwrap().unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn bind_from_config_rejects_garbage() {
        let cfg = ServerConfig {
            bind: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(bind_from_config(&cfg).is_err());
        assert!(bind_from_config(&ServerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn directories_are_required() {
        let cfg = ServerConfig {
            media_dir: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(media_dir_from_config(&cfg).is_err());
        assert!(storage_dir_from_config(&cfg).is_err());
    }

    #[test]
    fn streaming_table_overrides_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            media_dir = "/srv/music"

            [streaming]
            stream_ahead_time_ms = 2500
            throttle = false
            "#,
        )
        .unwrap();
        let options = stream_options_from_config(&cfg);
        assert_eq!(options.stream_ahead_time, Duration::from_millis(2_500));
        assert!(!options.throttle);
        assert_eq!(
            options.stream_ahead_bytes,
            StreamOptions::default().stream_ahead_bytes
        );
        assert!(!options.deterministic);
        assert_eq!(media_dir_from_config(&cfg).unwrap(), PathBuf::from("/srv/music"));
    }

    #[test]
    fn player_table_overrides_defaults() {
        let cfg: ServerConfig = toml::from_str("[player]\noutput_buffer_frames = 4\n").unwrap();
        let player = player_config_from_config(&cfg);
        assert_eq!(player.output_buffer_frames, 4);
        assert_eq!(player.command_capacity, 256);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/media-server.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
