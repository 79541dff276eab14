//! Scripted media sources and recording writers for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::config::{StreamConfig, Transport};
use crate::context::StreamContext;
use crate::coordination::{DrainCoordinator, ShutdownCoordinator, StreamStates};
use crate::errors::IngestError;
use crate::ingest::IngestDeps;
use crate::lifecycle::ContextHandle;
use crate::media::{MediaConnection, MediaSource, Packet, SegmentWriter, StreamInfo, WriterFactory};

pub fn test_context(name: &str, handle: ContextHandle) -> Arc<StreamContext> {
    let coordinator = DrainCoordinator::new();
    Arc::new(StreamContext::new(
        name.to_string(),
        StreamConfig::new(format!("rtsp://camera.test/{}", name)),
        std::env::temp_dir().join("hls_ingest_tests").join(name),
        handle,
        0,
        coordinator.register_component(name),
    ))
}

pub fn video_info() -> StreamInfo {
    StreamInfo {
        index: 0,
        codec: "h264".to_string(),
        width: 1920,
        height: 1080,
        clock_rate: 90_000,
        extra_data: Bytes::from_static(&[1, 0x64, 0, 0x28, 0xff, 0xe0, 0x00]),
    }
}

#[derive(Debug, Clone)]
pub enum ConnScript {
    /// Endless packets at a fixed interval.
    Stream { interval: Duration },
    /// `count` packets, then end of stream.
    Packets { count: usize, interval: Duration },
    /// Never yields a packet.
    Hang,
}

#[derive(Debug, Clone)]
pub enum OpenScript {
    Fail,
    NoVideo,
    Connect(ConnScript),
}

/// Media source that plays back a script of open outcomes, then repeats `fallback`.
pub struct ScriptedSource {
    script: Mutex<VecDeque<OpenScript>>,
    fallback: OpenScript,
    open_times: Mutex<Vec<Instant>>,
    live: Arc<AtomicUsize>,
    peak_live: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<OpenScript>, fallback: OpenScript) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            open_times: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn streaming() -> Self {
        Self::new(Vec::new(), OpenScript::Connect(ConnScript::Stream { interval: Duration::from_millis(40) }))
    }

    pub fn always_failing() -> Self {
        Self::new(Vec::new(), OpenScript::Fail)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.open_times.lock().unwrap().len()
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_live_connections(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    async fn open(&self, url: &str, _transport: Transport) -> Result<Box<dyn MediaConnection>, IngestError> {
        self.open_times.lock().unwrap().push(Instant::now());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let (script, has_video) = match step {
            OpenScript::Fail => return Err(IngestError::Connect(format!("{} refused", url))),
            OpenScript::NoVideo => (ConnScript::Hang, false),
            OpenScript::Connect(script) => (script, true),
        };

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            script,
            has_video,
            sent: 0,
            live: self.live.clone(),
        }))
    }
}

struct ScriptedConnection {
    script: ConnScript,
    has_video: bool,
    sent: usize,
    live: Arc<AtomicUsize>,
}

impl ScriptedConnection {
    fn next_packet(&mut self) -> Packet {
        let keyframe = self.sent % 10 == 0;
        self.sent += 1;
        Packet::video(0, self.sent as i64 * 3000, keyframe, Bytes::from_static(&[0, 0, 0, 1, 0x65]))
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaConnection for ScriptedConnection {
    fn find_video_substream(&self) -> Option<StreamInfo> {
        self.has_video.then(video_info)
    }

    async fn read_packet(&mut self) -> Result<Packet, IngestError> {
        match self.script.clone() {
            ConnScript::Stream { interval } => {
                tokio::time::sleep(interval).await;
                Ok(self.next_packet())
            }
            ConnScript::Packets { count, interval } => {
                if self.sent >= count {
                    return Err(IngestError::Eof);
                }
                tokio::time::sleep(interval).await;
                Ok(self.next_packet())
            }
            ConnScript::Hang => std::future::pending().await,
        }
    }

    async fn close(self: Box<Self>) {}
}

#[derive(Default)]
pub struct WriterStats {
    created: AtomicUsize,
    inits: AtomicUsize,
    writes: AtomicUsize,
    closes: AtomicUsize,
    fail_inits: AtomicUsize,
    block_writes: AtomicUsize,
}

impl WriterStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
    /// Make the next `n` `init` calls fail.
    pub fn fail_next_inits(&self, n: usize) {
        self.fail_inits.store(n, Ordering::SeqCst);
    }
    /// Make the next `n` `write` calls hang forever, ignoring cancellation.
    pub fn block_next_writes(&self, n: usize) {
        self.block_writes.store(n, Ordering::SeqCst);
    }
}

fn consume_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct RecordingWriter {
    stats: Arc<WriterStats>,
    info: Option<StreamInfo>,
}

impl RecordingWriter {
    pub fn new(stats: Arc<WriterStats>) -> Self {
        stats.created.fetch_add(1, Ordering::SeqCst);
        Self { stats, info: None }
    }
}

#[async_trait]
impl SegmentWriter for RecordingWriter {
    async fn init(&mut self, info: &StreamInfo) -> Result<(), IngestError> {
        if consume_one(&self.stats.fail_inits) {
            return Err(IngestError::WriterInit("scripted failure".to_string()));
        }
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        self.info = Some(info.clone());
        Ok(())
    }

    async fn write(&mut self, _packet: &Packet) -> Result<(), IngestError> {
        if consume_one(&self.stats.block_writes) {
            std::future::pending::<()>().await;
        }
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }
}

pub struct RecordingWriterFactory {
    pub stats: Arc<WriterStats>,
}

impl WriterFactory for RecordingWriterFactory {
    fn create(&self, _stream_name: &str, _output_dir: &Path) -> Box<dyn SegmentWriter> {
        Box::new(RecordingWriter::new(self.stats.clone()))
    }
}

/// Dependencies wired to test doubles, with handles kept for assertions.
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub writer_stats: Arc<WriterStats>,
    pub coordinator: Arc<DrainCoordinator>,
    pub states: Arc<StreamStates>,
    pub deps: IngestDeps,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        let source = Arc::new(source);
        let writer_stats = Arc::new(WriterStats::default());
        let coordinator = Arc::new(DrainCoordinator::new());
        let states = Arc::new(StreamStates::new());
        let deps = IngestDeps {
            source: source.clone(),
            writers: Arc::new(RecordingWriterFactory { stats: writer_stats.clone() }),
            shutdown: coordinator.clone(),
            states: states.clone(),
        };
        Self {
            source,
            writer_stats,
            coordinator,
            states,
            deps,
        }
    }

    /// Context whose component is registered with this harness's coordinator.
    pub fn context(&self, name: &str, handle: ContextHandle) -> Arc<StreamContext> {
        Arc::new(StreamContext::new(
            name.to_string(),
            StreamConfig::new(format!("rtsp://camera.test/{}", name)),
            scratch_dir(name),
            handle,
            0,
            self.coordinator.register_component(name),
        ))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutdown_in_progress()
    }
}

/// Unique scratch directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> std::path::PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("hls_ingest_{}_{}_{}", tag, std::process::id(), n))
}
