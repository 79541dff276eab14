use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::coordination::ComponentId;
use crate::lifecycle::ContextHandle;
use crate::media::SegmentWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ThreadState {
    Initializing = 0,
    Connecting = 1,
    Running = 2,
    Reconnecting = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::Initializing,
            1 => ThreadState::Connecting,
            2 => ThreadState::Running,
            3 => ThreadState::Reconnecting,
            4 => ThreadState::Stopping,
            _ => ThreadState::Stopped,
        }
    }
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThreadState::Initializing => "initializing",
            ThreadState::Connecting => "connecting",
            ThreadState::Running => "running",
            ThreadState::Reconnecting => "reconnecting",
            ThreadState::Stopping => "stopping",
            ThreadState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SlotInner {
    writer: Option<Box<dyn SegmentWriter>>,
    sealed: bool,
}

/// Holds the segment writer while nobody is using it.
///
/// Whoever wants the writer takes it out; the slot is empty until it is put
/// back. Once sealed by teardown, `put_back` refuses and hands the writer back
/// so the holder closes it.
pub struct WriterSlot {
    inner: Mutex<SlotInner>,
}

impl WriterSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                writer: None,
                sealed: false,
            }),
        }
    }

    pub fn take(&self) -> Option<Box<dyn SegmentWriter>> {
        lock(&self.inner).writer.take()
    }

    pub fn put_back(&self, writer: Box<dyn SegmentWriter>) -> Result<(), Box<dyn SegmentWriter>> {
        let mut inner = lock(&self.inner);
        if inner.sealed || inner.writer.is_some() {
            return Err(writer);
        }
        inner.writer = Some(writer);
        Ok(())
    }

    /// Seal the slot and take whatever writer is parked in it.
    pub fn seal_and_take(&self) -> Option<Box<dyn SegmentWriter>> {
        let mut inner = lock(&self.inner);
        inner.sealed = true;
        inner.writer.take()
    }

    pub fn is_sealed(&self) -> bool {
        lock(&self.inner).sealed
    }
}

impl Default for WriterSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a context, for the API and logs.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub name: String,
    pub handle: ContextHandle,
    pub url: String,
    pub output_dir: PathBuf,
    pub state: ThreadState,
    pub running: bool,
    pub connection_valid: bool,
    pub consecutive_failures: u32,
    pub ms_since_last_packet: u64,
    pub packets_written: u64,
    pub reconnects: u64,
    pub started_at: DateTime<Utc>,
}

/// Shared state for one managed stream.
///
/// Status fields are written by the owning ingestion task and read lock-free
/// by everyone else. `stop`/the watchdog only touch the cancel signal.
pub struct StreamContext {
    name: String,
    config: StreamConfig,
    output_dir: PathBuf,
    handle: ContextHandle,
    serial: u64,
    component_id: ComponentId,
    created_at: Instant,
    started_at: DateTime<Utc>,

    running: AtomicBool,
    connection_valid: AtomicBool,
    consecutive_failures: AtomicU32,
    // Milliseconds since `created_at`
    last_packet_ms: AtomicU64,
    thread_state: AtomicU8,
    packets_written: AtomicU64,
    reconnects: AtomicU64,

    cancel: CancellationToken,
    writer: WriterSlot,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamContext {
    pub fn new(
        name: String,
        config: StreamConfig,
        output_dir: PathBuf,
        handle: ContextHandle,
        serial: u64,
        component_id: ComponentId,
    ) -> Self {
        Self {
            name,
            config,
            output_dir,
            handle,
            serial,
            component_id,
            created_at: Instant::now(),
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            connection_valid: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_packet_ms: AtomicU64::new(0),
            thread_state: AtomicU8::new(ThreadState::Initializing as u8),
            packets_written: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            writer: WriterSlot::new(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Registry-wide creation order; lower is older.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    pub fn writer(&self) -> &WriterSlot {
        &self.writer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_connection_valid(&self) -> bool {
        self.connection_valid.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.is_running() && self.is_connection_valid()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.thread_state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Cooperative cancel: clear `running` and wake any blocked await.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        !self.is_running() || self.cancel.is_cancelled()
    }

    fn elapsed_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.created_at)
            .as_millis()
            .min(u64::MAX as u128) as u64
    }

    pub fn since_last_packet(&self) -> Duration {
        let last = self.last_packet_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    /// Liveness as seen from outside: running, not stopped, and fed recently.
    pub fn is_alive(&self, stale_after: Duration) -> bool {
        self.is_running()
            && self.state() != ThreadState::Stopped
            && self.since_last_packet() <= stale_after
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            name: self.name.clone(),
            handle: self.handle,
            url: self.config.url.clone(),
            output_dir: self.output_dir.clone(),
            state: self.state(),
            running: self.is_running(),
            connection_valid: self.is_connection_valid(),
            consecutive_failures: self.consecutive_failures(),
            ms_since_last_packet: self.since_last_packet().as_millis() as u64,
            packets_written: self.packets_written.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            started_at: self.started_at,
        }
    }

    pub fn set_task(&self, task: JoinHandle<()>) {
        *lock(&self.task) = Some(task);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.task).take()
    }

    // Written by the owning ingestion task only.

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.thread_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_packet(&self) {
        self.last_packet_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    pub(crate) fn mark_connected(&self, after_reconnect: bool) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.mark_packet();
        if after_reconnect {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_valid.store(true, Ordering::Release);
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.connection_valid.store(false, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub(crate) fn mark_connection_invalid(&self) {
        self.connection_valid.store(false, Ordering::Release);
    }

    pub(crate) fn record_packet_written(&self) -> u64 {
        self.packets_written.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
        self.connection_valid.store(false, Ordering::Release);
    }
}
