//! Configuration types
//!
//! `StreamConfig` describes one streaming session and is validated once, before
//! any camera, codec or socket is touched. `AppConfig` wraps it together with
//! the server, discovery and capture settings and is persisted as TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Streaming mode selected by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Normal,
    AudioOnly,
    VideoOnly,
    VideoAudio,
    VideoAr,
    VideoAudioAr,
    ArOverlay,
}

impl StreamMode {
    /// Modalities implied by the mode as `(video, audio, ar)`
    pub fn modalities(self) -> (bool, bool, bool) {
        match self {
            StreamMode::Normal | StreamMode::VideoAudio => (true, true, false),
            StreamMode::AudioOnly => (false, true, false),
            StreamMode::VideoOnly => (true, false, false),
            StreamMode::VideoAr => (true, false, true),
            StreamMode::VideoAudioAr | StreamMode::ArOverlay => (true, true, true),
        }
    }
}

/// Video encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Seconds between forced key frames
    pub keyframe_interval_secs: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate: 4_000_000,
            keyframe_interval_secs: 1,
        }
    }
}

impl VideoSettings {
    /// Number of frames between key frames (never zero)
    pub fn keyframe_interval_frames(&self) -> u32 {
        self.fps.saturating_mul(self.keyframe_interval_secs).max(1)
    }

    /// Duration of one frame at the configured rate
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }
}

/// Audio encoder settings.
///
/// `sample_rate` must be one of [`OPUS_SAMPLE_RATES`]. Capture runs at that
/// rate directly, so 44.1 kHz or 22.05 kHz sources are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
        }
    }
}

impl AudioSettings {
    /// Samples per channel in one encoded frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * AUDIO_FRAME_MS / 1000) as usize
    }
}

/// Configuration for a single streaming session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub mode: StreamMode,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_ar: bool,
    pub include_depth: bool,
    pub video: VideoSettings,
    pub audio: AudioSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Normal,
            has_video: true,
            has_audio: true,
            has_ar: false,
            include_depth: false,
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
        }
    }
}

impl StreamConfig {
    /// Build a configuration whose modality flags follow `mode`
    pub fn from_mode(mode: StreamMode) -> Self {
        let (has_video, has_audio, has_ar) = mode.modalities();
        Self {
            mode,
            has_video,
            has_audio,
            has_ar,
            include_depth: has_ar,
            ..Self::default()
        }
    }

    /// 720p30 with stereo audio
    pub fn hd() -> Self {
        Self::default()
    }

    /// 480p24 with mono audio for congested networks
    pub fn low_bandwidth() -> Self {
        Self {
            video: VideoSettings {
                width: 640,
                height: 480,
                fps: 24,
                bitrate: 1_500_000,
                keyframe_interval_secs: 2,
            },
            audio: AudioSettings {
                sample_rate: 24_000,
                channels: 1,
                bitrate: 64_000,
            },
            ..Self::default()
        }
    }

    /// Video, audio, pose and depth
    pub fn ar_mode() -> Self {
        Self {
            mode: StreamMode::ArOverlay,
            has_ar: true,
            include_depth: true,
            video: VideoSettings {
                bitrate: 5_000_000,
                ..VideoSettings::default()
            },
            ..Self::default()
        }
    }

    /// Resolution formatted as `WIDTHxHEIGHT`
    pub fn resolution_string(&self) -> String {
        format!("{}x{}", self.video.width, self.video.height)
    }

    /// Whether a camera must run for this session
    pub fn needs_camera(&self) -> bool {
        self.has_video || self.has_ar
    }

    /// Validate every numeric field. Nothing is acquired before this passes.
    pub fn validate(&self) -> Result<()> {
        let v = &self.video;
        if v.width == 0 || v.height == 0 {
            return Err(Error::ConfigInvalid(format!(
                "video resolution must be positive, got {}",
                self.resolution_string()
            )));
        }
        if v.fps == 0 {
            return Err(Error::ConfigInvalid("video fps must be positive".into()));
        }
        if v.bitrate == 0 {
            return Err(Error::ConfigInvalid("video bitrate must be positive".into()));
        }
        if v.keyframe_interval_secs == 0 {
            return Err(Error::ConfigInvalid(
                "keyframe interval must be positive".into(),
            ));
        }
        if self.has_audio {
            let a = &self.audio;
            if a.sample_rate == 0 || a.channels == 0 || a.bitrate == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "audio settings must be positive, got {}Hz/{}ch/{}bps",
                    a.sample_rate, a.channels, a.bitrate
                )));
            }
            if !OPUS_SAMPLE_RATES.contains(&a.sample_rate) {
                return Err(Error::ConfigInvalid(format!(
                    "audio sample rate {}Hz is not an Opus rate, use one of {:?}",
                    a.sample_rate, OPUS_SAMPLE_RATES
                )));
            }
        }
        if !self.has_video && !self.has_audio && !self.has_ar {
            return Err(Error::ConfigInvalid("no modality enabled".into()));
        }
        if self.include_depth && !self.has_ar {
            return Err(Error::ConfigInvalid(
                "depth requires the AR modality".into(),
            ));
        }
        Ok(())
    }
}

/// RTSP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Largest RTP packet the server emits (header included)
    pub rtp_mtu: usize,
    /// Stream units buffered per client before the oldest is dropped
    pub client_queue_capacity: usize,
    /// Idle seconds before a client session is torn down
    pub session_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_RTSP_PORT,
            rtp_mtu: DEFAULT_RTP_MTU,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Local-network advertisement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// How often the local address is checked for changes
    pub address_poll_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: DEFAULT_SERVICE_NAME.into(),
            address_poll_secs: 5,
        }
    }
}

/// Which camera backend feeds the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    #[default]
    Synthetic,
}

/// Which audio backend feeds the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    #[default]
    Microphone,
    Tone,
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera: CameraKind,
    pub audio: AudioSourceKind,
    /// Input device name, default device when absent
    pub audio_device: Option<String>,
    /// Attempts to open a busy device before giving up
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera: CameraKind::Synthetic,
            audio: AudioSourceKind::Microphone,
            audio_device: None,
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// Which tracking backend is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    #[default]
    Simulated,
    Unsupported,
}

/// AR tracking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub backend: TrackerKind,
    pub poll_interval_ms: u64,
    /// Maximum distance between a camera frame and its pose, unbounded when absent
    pub sync_tolerance_ms: Option<u64>,
    /// Compressed depth maps above this size are sent without samples
    pub max_depth_bytes: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            backend: TrackerKind::Simulated,
            poll_interval_ms: 5,
            sync_tolerance_ms: None,
            max_depth_bytes: DEFAULT_MAX_DEPTH_BYTES,
            retry_attempts: 5,
            retry_backoff_ms: 200,
        }
    }
}

impl TrackingConfig {
    pub fn sync_tolerance(&self) -> Option<Duration> {
        self.sync_tolerance_ms.map(Duration::from_millis)
    }
}

/// Muxer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// How long the muxer holds units back to restore timestamp order
    pub reorder_window_ms: u64,
    /// Capacity of the encoder-to-muxer channel
    pub channel_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: 100,
            channel_capacity: 64,
        }
    }
}

/// Status endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".into(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub capture: CaptureConfig,
    pub tracking: TrackingConfig,
    pub mux: MuxConfig,
    pub ui: UiConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            server: ServerConfig::default(),
            discovery: DiscoveryConfig::default(),
            capture: CaptureConfig::default(),
            tracking: TrackingConfig::default(),
            mux: MuxConfig::default(),
            ui: UiConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "arstreamer", "ar-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let text = std::fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&text).map_err(|e| {
            Error::ConfigInvalid(format!("{}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(StreamConfig::hd().validate().is_ok());
        assert!(StreamConfig::low_bandwidth().validate().is_ok());
        assert!(StreamConfig::ar_mode().validate().is_ok());
    }

    #[test]
    fn test_zero_fps_rejected() {
        let mut config = StreamConfig::hd();
        config.video.fps = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_non_opus_sample_rate_rejected() {
        let mut config = StreamConfig::hd();
        config.audio.sample_rate = 44_100;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("44100Hz is not an Opus rate"));

        config.audio.sample_rate = 22_050;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        // Ignored when the session carries no audio
        config.has_audio = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keyframe_interval_saturates() {
        let mut config = StreamConfig::hd();
        config.video.fps = u32::MAX;
        config.video.keyframe_interval_secs = 3;
        assert_eq!(config.video.keyframe_interval_frames(), u32::MAX);
    }

    #[test]
    fn test_audio_checked_only_when_enabled() {
        let mut config = StreamConfig::from_mode(StreamMode::VideoOnly);
        config.audio.sample_rate = 0;
        assert!(config.validate().is_ok());

        config.has_audio = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_modalities() {
        let config = StreamConfig::from_mode(StreamMode::VideoAr);
        assert!(config.has_video && !config.has_audio && config.has_ar);
        assert!(config.include_depth);

        let config = StreamConfig::from_mode(StreamMode::AudioOnly);
        assert!(!config.needs_camera());
    }

    #[test]
    fn test_keyframe_interval() {
        let video = VideoSettings::default();
        assert_eq!(video.keyframe_interval_frames(), 30);
        assert_eq!(AudioSettings::default().frame_size(), 960);
    }

    #[test]
    fn test_toml_partial_document() {
        let text = r#"
            log_level = "debug"

            [stream]
            has_ar = true
            include_depth = true

            [server]
            port = 9554
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.server.port, 9554);
        assert_eq!(config.server.rtp_mtu, DEFAULT_RTP_MTU);
        assert!(config.stream.has_ar);
        assert_eq!(config.stream.video.width, 1280);
        assert_eq!(config.log_level, "debug");
    }
}
