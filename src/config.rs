use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{Result, StreamError};
use crate::utils::duration_str;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Transport {
    #[serde(rename = "tcp")]
    #[default]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub streams: HashMap<String, StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
    pub streams_directory: Option<String>,  // Directory path for per-stream config files (default: "streams")
}

/// Connection settings for one camera stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub enabled: Option<bool>,
    pub url: String,
    #[serde(default)]
    pub transport: Transport,
    pub output_dir: Option<PathBuf>,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            enabled: None,
            url: url.into(),
            transport: Transport::default(),
            output_dir: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Explicit output directory, or `<output_root>/<name>`.
    pub fn resolve_output_dir(&self, output_root: &Path, name: &str) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| output_root.join(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub output_root: PathBuf,
    pub max_streams: usize,
    #[serde(with = "duration_str")]
    pub packet_timeout: Duration,
    #[serde(with = "duration_str")]
    pub teardown_timeout: Duration,
    #[serde(with = "duration_str")]
    pub teardown_poll: Duration,
    #[serde(with = "duration_str")]
    pub restart_settle: Duration,
    pub freed_history: usize,
    pub ffmpeg_path: String,
    pub hls_segment_seconds: u32,
    pub hls_list_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allow_origin: Some("*".to_string()),
            streams_directory: None,  // Default: "streams"
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("hls"),
            max_streams: 16,
            packet_timeout: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(5),
            teardown_poll: Duration::from_millis(50),
            restart_settle: Duration::from_millis(500),
            freed_history: 256,
            ffmpeg_path: "ffmpeg".to_string(),
            hls_segment_seconds: 2,
            hls_list_size: 6,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_attempts: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
            reconnect: ReconnectConfig::default(),
            watchdog: WatchdogConfig::default(),
            streams: HashMap::new(), // No default streams - must be configured
        }
    }
}

/// Deserialize `content` according to the file extension of `path`.
fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => Ok(serde_json::from_str(content)?),
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(content)?),
        Some("toml") | None => Ok(toml::from_str(content)?),
        Some(other) => Err(StreamError::config(format!(
            "Unsupported config file extension '{}' for {}",
            other,
            path.display()
        ))),
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = parse_by_extension(Path::new(path), &content)?;
        config.validate()?;

        // Streams from the streams directory extend (and override) inline ones
        let streams_dir = config.streams_directory().to_string();
        for (name, stream) in Self::load_streams_from_directory(&streams_dir)? {
            config.streams.insert(name, stream);
        }

        Ok(config)
    }

    pub fn streams_directory(&self) -> &str {
        self.server.streams_directory.as_deref().unwrap_or("streams")
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.max_streams == 0 {
            return Err(StreamError::config("ingest.max_streams must be at least 1"));
        }
        if self.ingest.packet_timeout.is_zero() {
            return Err(StreamError::config("ingest.packet_timeout must be positive"));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(StreamError::config("reconnect.base_delay must not exceed reconnect.max_delay"));
        }
        if self.watchdog.max_attempts == 0 {
            return Err(StreamError::config("watchdog.max_attempts must be at least 1"));
        }
        for (name, stream) in &self.streams {
            validate_stream_name(name)?;
            if stream.url.is_empty() {
                return Err(StreamError::config(format!("Stream '{}' has an empty url", name)));
            }
        }
        Ok(())
    }

    pub fn load_streams_from_directory(streams_dir: &str) -> Result<HashMap<String, StreamConfig>> {
        let mut streams = HashMap::new();

        if !Path::new(streams_dir).exists() {
            warn!("Streams directory '{}' does not exist, no streams will be loaded", streams_dir);
            return Ok(streams);
        }

        for entry in fs::read_dir(streams_dir)? {
            let path = entry?.path();
            let Some(name) = stream_name_from_path(&path) else {
                continue;
            };

            match load_stream_file(&path) {
                Ok(stream_config) => {
                    info!("Loaded stream configuration: {} ({})", name, path.display());
                    streams.insert(name, stream_config);
                }
                Err(e) => {
                    warn!("Skipping stream config file {}: {}", path.display(), e);
                }
            }
        }

        Ok(streams)
    }
}

/// Stream names become directory and file names.
pub fn validate_stream_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StreamError::config(format!("Invalid stream name '{}'", name)))
    }
}

/// `streams/front_door.toml` -> `front_door`, for supported config extensions only.
pub fn stream_name_from_path(path: &Path) -> Option<String> {
    let ext = path.extension().and_then(|s| s.to_str())?;
    if !matches!(ext, "json" | "toml" | "yaml" | "yml") {
        return None;
    }
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    validate_stream_name(stem).ok()?;
    Some(stem.to_string())
}

pub fn load_stream_file(path: &Path) -> Result<StreamConfig> {
    let content = fs::read_to_string(path)?;
    let config: StreamConfig = parse_by_extension(path, &content)?;
    if config.url.is_empty() {
        return Err(StreamError::config(format!("{}: url is required", path.display())));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hls_ingest_config_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.ingest.packet_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.watchdog.interval, Duration::from_secs(30));
        assert_eq!(config.watchdog.max_attempts, 5);
        assert_eq!(config.watchdog.cooldown, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_with_humantime_durations() {
        let content = r#"
            [ingest]
            packet_timeout = "2s"
            max_streams = 4

            [reconnect]
            base_delay = "250ms"
            max_delay = "10s"

            [streams.garage]
            url = "rtsp://10.0.0.5/stream1"
            transport = "udp"
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.ingest.packet_timeout, Duration::from_secs(2));
        assert_eq!(config.ingest.max_streams, 4);
        assert_eq!(config.ingest.teardown_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.server.port, 8080);

        let garage = &config.streams["garage"];
        assert_eq!(garage.transport, Transport::Udp);
        assert!(garage.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.reconnect.base_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_name_from_path() {
        assert_eq!(stream_name_from_path(Path::new("streams/front.json")), Some("front".to_string()));
        assert_eq!(stream_name_from_path(Path::new("streams/back-yard.yaml")), Some("back-yard".to_string()));
        assert_eq!(stream_name_from_path(Path::new("streams/notes.txt")), None);
        assert_eq!(stream_name_from_path(Path::new("streams/bad name.toml")), None);
    }

    #[test]
    fn test_load_streams_from_directory_mixed_formats() {
        let dir = temp_dir("mixed");
        fs::write(dir.join("a.json"), r#"{"url": "rtsp://a/1"}"#).unwrap();
        fs::write(dir.join("b.toml"), "url = \"rtsp://b/1\"\nenabled = false\n").unwrap();
        fs::write(dir.join("c.yaml"), "url: rtsp://c/1\ntransport: udp\n").unwrap();
        fs::write(dir.join("broken.json"), "{").unwrap();
        fs::write(dir.join("README.md"), "ignored").unwrap();

        let streams = Config::load_streams_from_directory(dir.to_str().unwrap()).unwrap();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams["a"].url, "rtsp://a/1");
        assert!(!streams["b"].is_enabled());
        assert_eq!(streams["c"].transport, Transport::Udp);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolve_output_dir() {
        let stream = StreamConfig::new("rtsp://x");
        assert_eq!(stream.resolve_output_dir(Path::new("hls"), "x"), PathBuf::from("hls/x"));
    }
}
