use std::path::Path;
use std::time::Duration;

use crate::errors::{Result, StreamError};

/// Parse a duration string like "500ms", "30s", "5m" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StreamError::config("Empty duration string"));
    }

    humantime::parse_duration(s)
        .map_err(|e| StreamError::config(format!("Invalid duration '{}': {}", s, e)))
}

/// Serde adapter so config files can say `packet_timeout = "5s"`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Create `dir` if needed and prove it is writable by creating and removing a probe file.
pub async fn ensure_writable_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let probe = dir.join(".write_probe");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_nested() {
        let root = std::env::temp_dir().join(format!("hls_ingest_utils_{}", std::process::id()));
        let nested = root.join("a").join("b");

        ensure_writable_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert!(!nested.join(".write_probe").exists());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_rejects_file_path() {
        let file = std::env::temp_dir().join(format!("hls_ingest_utils_file_{}", std::process::id()));
        tokio::fs::write(&file, b"x").await.unwrap();

        assert!(ensure_writable_dir(&file).await.is_err());

        let _ = tokio::fs::remove_file(&file).await;
    }
}
