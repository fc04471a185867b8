use common::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Visit tracking and stream supervision settings
    pub engine: EngineConfig,

    /// Clip recording settings
    pub recording: RecordingConfig,

    /// Alert delivery settings
    pub notifier: NotifierConfig,

    /// Detection service settings
    pub detector: DetectorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Camera streams to monitor
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Visits longer than this raise an alert (strictly greater)
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub alert_threshold: Duration,

    /// Gap without detections after which a visit is considered over
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub debounce: Duration,

    /// Minimum spacing between detection calls while no visit is active
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub detection_interval: Duration,

    /// Consecutive failed reads before the stream is reconnected
    pub max_consecutive_errors: u32,

    /// Upper bound of the backoff after a failed reconnect
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub reconnect_delay_max: Duration,

    /// How long a stream may take to deliver its first frame at startup
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub open_timeout: Duration,

    /// What to do when a stream cannot be opened at startup
    pub startup_policy: StartupPolicy,

    /// Flush an in-progress visit when its stream ends, disconnects or the engine stops
    pub flush_on_disconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    /// Skip unopenable streams; fail only if nothing started
    Isolate,
    /// Any unopenable stream fails engine startup
    AbortAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Write a clip for every visit
    pub enabled: bool,

    /// Root directory; clips land in `<output_dir>/<stream_id>/<timestamp>.<extension>`
    pub output_dir: PathBuf,

    /// Container extension
    pub extension: String,

    /// ffmpeg video codec
    pub codec: String,

    /// Output frame rate, independent of capture rate
    pub output_fps: u32,

    /// Frames buffered per visit before they are streamed to the encoder
    pub chunk_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Webhook address; alerts are only logged when unset
    pub webhook_url: Option<String>,

    /// Clips at or above this size are not attached
    pub max_attachment_bytes: u64,

    /// Request timeout
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Inference endpoint receiving raw frames
    pub endpoint: String,

    /// Label counted as the tracked animal
    pub target_label: String,

    /// Minimum confidence for a detection to count
    pub min_confidence: f32,

    /// Request timeout
    #[serde(with = "crate::serde_helpers::duration_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stable stream identifier, used in clip paths and logs
    pub id: String,

    /// Source address (RTSP/HTTP URL, file path, or local device index)
    pub source: String,

    /// Decoded frame width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Decoded frame height
    #[serde(default = "default_height")]
    pub height: u32,

    /// Optional capture rate cap
    #[serde(default)]
    pub capture_fps: Option<u32>,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            width: default_width(),
            height: default_height(),
            capture_fps: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            recording: RecordingConfig::default(),
            notifier: NotifierConfig::default(),
            detector: DetectorConfig::default(),
            logging: LoggingConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alert_threshold: Duration::from_secs(45),
            debounce: Duration::from_secs(4),
            detection_interval: Duration::from_secs(1),
            max_consecutive_errors: 5,
            reconnect_delay_max: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            startup_policy: StartupPolicy::Isolate,
            flush_on_disconnect: true,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("cat_clips"),
            extension: "mp4".to_string(),
            codec: "libx264".to_string(),
            output_fps: 10,
            chunk_frames: 150,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_attachment_bytes: 8 * 1024 * 1024, // 8MiB
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/detect".to_string(),
            target_label: "cat".to_string(),
            min_confidence: 0.5,
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(invalid("At least one stream must be configured"));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.id.trim().is_empty() {
                return Err(invalid("Stream id cannot be empty"));
            }
            if !seen.insert(stream.id.as_str()) {
                return Err(invalid(format!("Duplicate stream id: {}", stream.id)));
            }
            if stream.source.trim().is_empty() {
                return Err(invalid(format!("Stream {} has no source", stream.id)));
            }
            if stream.width == 0 || stream.height == 0 {
                return Err(invalid(format!(
                    "Stream {} frame size must be greater than 0",
                    stream.id
                )));
            }
        }

        if self.engine.debounce.is_zero() {
            return Err(invalid("Debounce must be greater than 0"));
        }

        if self.engine.detection_interval.is_zero() {
            return Err(invalid("Detection interval must be greater than 0"));
        }

        if self.engine.max_consecutive_errors == 0 {
            return Err(invalid("Max consecutive errors must be greater than 0"));
        }

        if self.recording.output_fps == 0 {
            return Err(invalid("Output frame rate must be greater than 0"));
        }

        if self.recording.chunk_frames == 0 {
            return Err(invalid("Chunk size must be greater than 0"));
        }

        if self.recording.extension.is_empty() {
            return Err(invalid("Clip extension cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

/// Configuration manager for loading and validating configurations
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            config: AppConfig::default(),
        }
    }

    /// Load configuration from file; a missing file keeps the defaults
    pub async fn load(&mut self) -> Result<(), ConfigError> {
        if !self.config_path.exists() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| ConfigError::Read {
                path: self.config_path.clone(),
                reason: e.to_string(),
            })?;

        self.config = parse_config(&content)?;
        Ok(())
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }
}

pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

pub fn render_config(config: &AppConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

/// Environment-based configuration override
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    /// Apply process environment overrides (after loading `.env` if present)
    pub fn apply_overrides(config: &mut AppConfig) {
        dotenvy::dotenv().ok();
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_from<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(threshold) = lookup("LITTER_BOX_THRESHOLD") {
            match threshold
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            {
                Some(duration) => config.engine.alert_threshold = duration,
                None => tracing::warn!("Ignoring invalid LITTER_BOX_THRESHOLD: {}", threshold),
            }
        }

        // A single camera source replaces the configured stream list
        if let Some(source) = lookup("CAMERA_SOURCE") {
            let source = source.trim().to_string();
            if !source.is_empty() {
                let mut stream = StreamConfig::new("camera-0", source);
                if let Some(existing) = config.streams.first() {
                    stream.width = existing.width;
                    stream.height = existing.height;
                    stream.capture_fps = existing.capture_fps;
                }
                config.streams = vec![stream];
            }
        }

        if let Some(url) = lookup("DISCORD_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                config.notifier.webhook_url = Some(url.trim().to_string());
            }
        }

        if let Some(level) = lookup("VISIT_MONITOR_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}
