use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// One of `mjpeg`, `v4l` (with the `v4l` cargo feature) or `file`.
    #[serde(default = "default_source")]
    pub source: String,
    /// V4L2 device index, i.e. `/dev/video{device}`.
    #[serde(default)]
    pub device: usize,
    /// Upstream MJPEG stream, used when `source = "mjpeg"`.
    #[serde(default = "default_camera_url")]
    pub url: String,
    /// Still image, used when `source = "file"`.
    #[serde(default = "default_camera_path")]
    pub path: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Consecutive detector failures tolerated before the loop gives up. 0 disables the limit.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationConfig {
    /// Tried in order; the first font that loads wins.
    #[serde(default = "default_font_paths")]
    pub font_paths: Vec<String>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_shadow_offset")]
    pub shadow_offset: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alert_enabled")]
    pub enabled: bool,
    #[serde(default = "default_alert_command")]
    pub command: String,
    /// `{freq}` and `{ms}` are replaced with the tone's frequency and duration.
    #[serde(default = "default_alert_args")]
    pub args: Vec<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            device: 0,
            url: default_camera_url(),
            path: default_camera_path(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_paths: default_font_paths(),
            font_size: default_font_size(),
            shadow_offset: default_shadow_offset(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: default_alert_enabled(),
            command: default_alert_command(),
            args: default_alert_args(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_source() -> String {
    "mjpeg".into()
}
fn default_camera_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_camera_path() -> String {
    "sample.jpg".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_idle_sleep_ms() -> u64 {
    10
}
fn default_max_consecutive_failures() -> u32 {
    100
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_font_paths() -> Vec<String> {
    [
        "msyh.ttc",
        "C:\\Windows\\Fonts\\msyh.ttc",
        "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
        "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
        "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_font_size() -> f32 {
    100.0
}
fn default_shadow_offset() -> i32 {
    3
}
fn default_alert_enabled() -> bool {
    true
}
fn default_alert_command() -> String {
    "beep".into()
}
fn default_alert_args() -> Vec<String> {
    ["-f", "{freq}", "-l", "{ms}"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_queue_capacity() -> usize {
    2
}
fn default_log_level() -> String {
    "info".into()
}
