//! Seams between the ingestion loop and the media stack.
//!
//! A [`MediaSource`] opens a [`MediaConnection`] to a camera; a
//! [`WriterFactory`] hands out [`SegmentWriter`]s that persist video packets.
//! The RTSP implementation lives in `rtsp_source`, the HLS writer in
//! `hls_writer`.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Transport;
use crate::errors::IngestError;

/// Parameters of the video sub-stream a writer is initialised with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: usize,
    /// Lower-case encoding name, e.g. "h264".
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub clock_rate: u32,
    /// Codec configuration record (avcC for H.264).
    pub extra_data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp in the stream's clock rate.
    pub pts: i64,
    pub keyframe: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn video(stream_index: usize, pts: i64, keyframe: bool, data: Bytes) -> Self {
        Self {
            stream_index,
            pts,
            keyframe,
            data,
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, url: &str, transport: Transport) -> Result<Box<dyn MediaConnection>, IngestError>;
}

/// An open connection. Confined to the ingestion task that opened it.
#[async_trait]
pub trait MediaConnection: Send {
    fn find_video_substream(&self) -> Option<StreamInfo>;

    /// Next packet; `IngestError::Eof` when the source ended.
    async fn read_packet(&mut self) -> Result<Packet, IngestError>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait SegmentWriter: Send {
    async fn init(&mut self, info: &StreamInfo) -> Result<(), IngestError>;

    async fn write(&mut self, packet: &Packet) -> Result<(), IngestError>;

    async fn close(&mut self);

    /// Parameters from the last successful `init`.
    fn stream_info(&self) -> Option<&StreamInfo>;
}

pub trait WriterFactory: Send + Sync {
    fn create(&self, stream_name: &str, output_dir: &Path) -> Box<dyn SegmentWriter>;
}
