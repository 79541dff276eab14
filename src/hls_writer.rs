//! HLS segment writer: H.264 access units are converted to Annex-B and piped
//! into an `ffmpeg` child that muxes them into `index.m3u8` + `.ts` segments.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::errors::IngestError;
use crate::media::{Packet, SegmentWriter, StreamInfo, WriterFactory};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Parsed `AVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub length_size: usize,
    /// SPS and PPS NAL units, each prefixed with a start code.
    pub parameter_sets: Vec<u8>,
}

fn truncated() -> IngestError {
    IngestError::WriterInit("truncated avcC record".to_string())
}

/// Copy `count` u16-length-prefixed NAL units starting at `pos`; returns the end offset.
fn read_parameter_sets(extra: &[u8], mut pos: usize, count: usize, out: &mut Vec<u8>) -> Result<usize, IngestError> {
    for _ in 0..count {
        let len_bytes = extra.get(pos..pos + 2).ok_or_else(truncated)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        pos += 2;
        let nal = extra.get(pos..pos + len).ok_or_else(truncated)?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
        pos += len;
    }
    Ok(pos)
}

pub fn parse_avcc(extra: &[u8]) -> Result<AvcConfig, IngestError> {
    if extra.len() < 6 || extra[0] != 1 {
        return Err(IngestError::WriterInit("not an avcC record".to_string()));
    }
    let length_size = (extra[4] & 0x03) as usize + 1;
    if length_size == 3 {
        return Err(IngestError::WriterInit("invalid NAL length size 3".to_string()));
    }

    let mut parameter_sets = Vec::new();
    let sps_count = (extra[5] & 0x1f) as usize;
    let mut pos = read_parameter_sets(extra, 6, sps_count, &mut parameter_sets)?;
    let pps_count = *extra.get(pos).ok_or_else(truncated)? as usize;
    pos += 1;
    read_parameter_sets(extra, pos, pps_count, &mut parameter_sets)?;

    Ok(AvcConfig {
        length_size,
        parameter_sets,
    })
}

/// Rewrite length-prefixed NAL units as start-code delimited ones.
pub fn avcc_to_annexb(data: &[u8], length_size: usize, out: &mut Vec<u8>) -> Result<(), IngestError> {
    let mut pos = 0;
    while pos < data.len() {
        let prefix = data
            .get(pos..pos + length_size)
            .ok_or_else(|| IngestError::Write("truncated NAL length".to_string()))?;
        let len = prefix.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += length_size;
        let nal = data
            .get(pos..pos + len)
            .ok_or_else(|| IngestError::Write(format!("NAL of {} bytes overruns packet", len)))?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
        pos += len;
    }
    Ok(())
}

/// Turns packets into an Annex-B byte stream that starts on a keyframe.
#[derive(Debug)]
pub struct AnnexBFramer {
    config: AvcConfig,
    waiting_for_keyframe: bool,
}

impl AnnexBFramer {
    pub fn new(config: AvcConfig) -> Self {
        Self {
            config,
            waiting_for_keyframe: true,
        }
    }

    /// `None` while still waiting for the first keyframe.
    pub fn frame(&mut self, packet: &Packet) -> Result<Option<Vec<u8>>, IngestError> {
        if self.waiting_for_keyframe {
            if !packet.keyframe {
                return Ok(None);
            }
            self.waiting_for_keyframe = false;
        }

        let mut out = Vec::with_capacity(packet.data.len() + self.config.parameter_sets.len() + 16);
        if packet.keyframe {
            out.extend_from_slice(&self.config.parameter_sets);
        }
        avcc_to_annexb(&packet.data, self.config.length_size, &mut out)?;
        Ok(Some(out))
    }
}

#[derive(Debug, Clone)]
struct HlsSettings {
    ffmpeg_path: String,
    segment_seconds: u32,
    list_size: u32,
}

pub struct FfmpegHlsWriterFactory {
    settings: HlsSettings,
}

impl FfmpegHlsWriterFactory {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            settings: HlsSettings {
                ffmpeg_path: config.ffmpeg_path.clone(),
                segment_seconds: config.hls_segment_seconds,
                list_size: config.hls_list_size,
            },
        }
    }
}

impl WriterFactory for FfmpegHlsWriterFactory {
    fn create(&self, stream_name: &str, output_dir: &Path) -> Box<dyn SegmentWriter> {
        Box::new(FfmpegHlsWriter {
            name: stream_name.to_string(),
            output_dir: output_dir.to_path_buf(),
            settings: self.settings.clone(),
            info: None,
            framer: None,
            child: None,
            stdin: None,
            frames: 0,
        })
    }
}

pub struct FfmpegHlsWriter {
    name: String,
    output_dir: PathBuf,
    settings: HlsSettings,
    info: Option<StreamInfo>,
    framer: Option<AnnexBFramer>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames: u64,
}

impl FfmpegHlsWriter {
    fn ffmpeg_args(&self) -> Vec<String> {
        let playlist = self.output_dir.join("index.m3u8");
        let segments = self.output_dir.join("segment_%05d.ts");
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-use_wallclock_as_timestamps",
            "1",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-c:v",
            "copy",
            "-an",
            "-f",
            "hls",
            "-hls_time",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            self.settings.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            self.settings.list_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+append_list".to_string(),
            "-hls_segment_filename".to_string(),
            segments.to_string_lossy().into_owned(),
            playlist.to_string_lossy().into_owned(),
        ])
        .collect()
    }

    async fn shutdown_child(&mut self) {
        // EOF on stdin lets ffmpeg finish the last segment and playlist
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("ffmpeg for stream '{}' exited with {}", self.name, status),
            Ok(Err(e)) => warn!("Failed to wait for ffmpeg of stream '{}': {}", self.name, e),
            Err(_) => {
                warn!("ffmpeg for stream '{}' did not exit in {:?}; killing", self.name, CLOSE_GRACE);
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl SegmentWriter for FfmpegHlsWriter {
    async fn init(&mut self, info: &StreamInfo) -> Result<(), IngestError> {
        if info.codec != "h264" {
            return Err(IngestError::WriterInit(format!(
                "unsupported codec '{}' (only h264 is muxed to HLS)",
                info.codec
            )));
        }
        let config = if info.extra_data.is_empty() {
            AvcConfig {
                length_size: 4,
                parameter_sets: Vec::new(),
            }
        } else {
            parse_avcc(&info.extra_data)?
        };

        self.shutdown_child().await;

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(self.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IngestError::WriterInit(format!("failed to spawn {}: {}", self.settings.ffmpeg_path, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IngestError::WriterInit("ffmpeg stdin unavailable".to_string()))?;

        info!(
            "HLS writer for stream '{}' writing to {}",
            self.name,
            self.output_dir.display()
        );
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.framer = Some(AnnexBFramer::new(config));
        self.info = Some(info.clone());
        self.frames = 0;
        Ok(())
    }

    async fn write(&mut self, packet: &Packet) -> Result<(), IngestError> {
        let (Some(framer), Some(stdin)) = (self.framer.as_mut(), self.stdin.as_mut()) else {
            return Err(IngestError::Write("writer is not initialised".to_string()));
        };
        let Some(bytes) = framer.frame(packet)? else {
            return Ok(());
        };
        stdin
            .write_all(&bytes)
            .await
            .map_err(|e| IngestError::Write(format!("ffmpeg pipe: {}", e)))?;

        self.frames += 1;
        if self.frames % 1000 == 0 {
            debug!("HLS writer for stream '{}' muxed {} frames", self.name, self.frames);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.shutdown_child().await;
        self.framer = None;
        debug!("HLS writer for stream '{}' closed", self.name);
    }

    fn stream_info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }
}
