use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub canvas: CanvasConfig,
    pub rtmp: RtmpConfig,
    pub encoder: EncoderConfig,
    pub pipeline: PipelineConfig,
    pub pool: PoolConfig,
    pub preview: PreviewConfig,
    pub stream_key: StreamKeyConfig,
    pub render: RenderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub host: String,
    pub port: u16,
    /// RTMP application name; publish/play paths are `/<app>/<key-or-alias>`.
    pub app: String,
    pub max_connections: usize,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1935,
            app: "live".to_string(),
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: String,
    pub bitrate_kbps: u32,
    /// Rate-control buffer, in kbit. Zero means 2x bitrate.
    pub buffer_kbps: u32,
    pub hardware_acceleration: bool,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    /// Frames arriving more than this long after the previous write are dropped.
    pub frame_drop_threshold_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            bitrate_kbps: 2500,
            buffer_kbps: 0,
            hardware_acceleration: true,
            max_restarts: 3,
            restart_delay_ms: 1000,
            frame_drop_threshold_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_queue_size: usize,
    pub buffer_pool_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            buffer_pool_size: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of render workers. Zero selects 75% of available cores.
    pub workers: usize,
    /// Per-worker cache memory threshold that forces a cache purge.
    pub memory_threshold_mb: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            memory_threshold_mb: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub host: String,
    pub port: u16,
    pub batch_window_ms: u64,
    pub batch_max_frames: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            batch_window_ms: 50,
            batch_max_frames: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamKeyConfig {
    /// Storage key namespace prefix.
    pub namespace: String,
    /// Redis URL for the durable key store. None selects the in-memory store.
    pub redis_url: Option<String>,
    pub key_ttl_hours: Option<u64>,
}

impl Default for StreamKeyConfig {
    fn default() -> Self {
        Self {
            namespace: "framecast".to_string(),
            redis_url: None,
            key_ttl_hours: Some(24),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// TTF/OTF font used for text and chat layers. None disables glyph ink.
    pub font_path: Option<String>,
    pub max_text_lines: usize,
    pub chat_max_messages: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            max_text_lines: 8,
            chat_max_messages: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (FRAMECAST_CANVAS_WIDTH, etc.)
        builder = builder.add_source(
            Environment::with_prefix("FRAMECAST")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate configuration. Any error here aborts startup before a
    /// single component is constructed.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.canvas.width == 0 || self.canvas.height == 0 {
            errors.push("canvas width/height must be non-zero".to_string());
        }
        // yuv420p output requires even dimensions.
        if self.canvas.width % 2 != 0 || self.canvas.height % 2 != 0 {
            errors.push("canvas width/height must be even".to_string());
        }
        if self.canvas.fps == 0 || self.canvas.fps > 120 {
            errors.push(format!("canvas fps {} out of range 1..=120", self.canvas.fps));
        }
        if self.encoder.bitrate_kbps == 0 {
            errors.push("encoder bitrate_kbps must be non-zero".to_string());
        }
        if self.encoder.ffmpeg_path.is_empty() {
            errors.push("encoder ffmpeg_path must not be empty".to_string());
        }
        if self.pipeline.max_queue_size == 0 {
            errors.push("pipeline max_queue_size must be non-zero".to_string());
        }
        if self.pipeline.buffer_pool_size == 0 {
            errors.push("pipeline buffer_pool_size must be non-zero".to_string());
        }
        if self.preview.batch_window_ms == 0 {
            errors.push("preview batch_window_ms must be non-zero".to_string());
        }
        if self.preview.batch_max_frames == 0 {
            errors.push("preview batch_max_frames must be non-zero".to_string());
        }
        if self.stream_key.namespace.is_empty() {
            errors.push("stream_key namespace must not be empty".to_string());
        }
        if self.rtmp.app.is_empty() {
            errors.push("rtmp app must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// RTMP bind address
    #[must_use]
    pub fn rtmp_address(&self) -> String {
        format!("{}:{}", self.rtmp.host, self.rtmp.port)
    }

    /// Preview HTTP bind address
    #[must_use]
    pub fn preview_address(&self) -> String {
        format!("{}:{}", self.preview.host, self.preview.port)
    }

    /// RTMP URL the internal encoder publishes to
    #[must_use]
    pub fn encoder_publish_url(&self, stream_key: &str) -> String {
        format!(
            "rtmp://127.0.0.1:{}/{}/{}?role=encoder",
            self.rtmp.port, self.rtmp.app, stream_key
        )
    }

    /// Interval between frames at the configured rate
    #[must_use]
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.canvas.fps.max(1)))
    }
}
