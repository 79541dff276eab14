use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Failures inside the ingestion loop. All of them are retried with backoff.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to connect to source: {0}")]
    Connect(String),

    #[error("source has no video stream")]
    NoVideoStream,

    #[error("failed to initialize segment writer: {0}")]
    WriterInit(String),

    #[error("failed to write packet: {0}")]
    Write(String),

    #[error("failed to read packet: {0}")]
    Read(String),

    #[error("source reached end of stream")]
    Eof,

    #[error("no packet received for {0:?}")]
    PacketTimeout(Duration),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("stream '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no free stream slot (capacity {capacity})")]
    NoFreeSlot { capacity: usize },

    #[error("output directory '{}' is not writable: {source}", path.display())]
    DirectoryNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stream '{0}' is disabled")]
    Disabled(String),

    #[error("invalid stream name: {0}")]
    InvalidName(String),

    #[error("system shutdown in progress")]
    ShuttingDown,
}

impl StartError {
    /// `AlreadyRunning` means the caller's intent is already satisfied.
    pub fn is_already_running(&self) -> bool {
        matches!(self, StartError::AlreadyRunning(_))
    }
}

#[derive(Error, Debug)]
pub enum StopError {
    #[error("stream '{0}' not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum RestartError {
    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Start(#[from] StartError),
}
