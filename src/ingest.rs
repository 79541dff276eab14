//! The per-stream ingestion task.
//!
//! ```text
//! Initializing -> Connecting -> Running <-> Reconnecting -> Stopping -> Stopped
//! ```
//!
//! Stop conditions are checked at the top of every iteration and after every
//! blocking read. Every failure loops back into `Connecting`/`Reconnecting`
//! with backoff, except during shutdown, where it ends the task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context::{StreamContext, ThreadState};
use crate::coordination::{ComponentState, Consumer, ShutdownCoordinator, StreamStateManager};
use crate::errors::IngestError;
use crate::lifecycle::LifecycleTracker;
use crate::media::{MediaConnection, MediaSource, Packet, SegmentWriter, StreamInfo, WriterFactory};
use crate::reconnect::ReconnectPolicy;

/// Shared collaborators handed to every ingestion task.
#[derive(Clone)]
pub struct IngestDeps {
    pub source: Arc<dyn MediaSource>,
    pub writers: Arc<dyn WriterFactory>,
    pub shutdown: Arc<dyn ShutdownCoordinator>,
    pub states: Arc<dyn StreamStateManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `running` cleared or the cancel token fired.
    Requested,
    /// The context is pending deletion or already freed.
    Reclaimed,
    Shutdown,
    Disabled,
}

pub struct IngestionStateMachine {
    ctx: Arc<StreamContext>,
    deps: IngestDeps,
    tracker: Arc<LifecycleTracker>,
    policy: ReconnectPolicy,
    packet_timeout: Duration,
    connection: Option<Box<dyn MediaConnection>>,
    video_index: Option<usize>,
    attempt: u32,
}

impl IngestionStateMachine {
    pub fn new(
        ctx: Arc<StreamContext>,
        deps: IngestDeps,
        tracker: Arc<LifecycleTracker>,
        policy: ReconnectPolicy,
        packet_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            deps,
            tracker,
            policy,
            packet_timeout,
            connection: None,
            video_index: None,
            attempt: 0,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Ingestion task started for stream '{}' ({}) from {}",
            self.ctx.name(),
            self.ctx.handle(),
            self.ctx.config().url
        );
        self.deps
            .shutdown
            .report_state(self.ctx.component_id(), ComponentState::Running);
        self.deps.states.add_ref(self.ctx.name(), Consumer::Hls);

        // Teardown runs through finish() for every stop reason
        let reason = self.drive().await;
        self.finish(reason).await;
    }

    async fn drive(&mut self) -> StopReason {
        let mut state = ThreadState::Initializing;
        loop {
            if let Some(reason) = self.stop_reason() {
                return reason;
            }
            self.ctx.set_state(state);

            let next = match state {
                ThreadState::Initializing => {
                    self.attempt = 0;
                    ThreadState::Connecting
                }
                ThreadState::Connecting => self.connecting().await,
                ThreadState::Running => self.running().await,
                ThreadState::Reconnecting => self.reconnecting().await,
                ThreadState::Stopping | ThreadState::Stopped => {
                    return self.stop_reason().unwrap_or(StopReason::Requested);
                }
            };

            if next != state {
                debug!("Stream '{}': {} -> {}", self.ctx.name(), state, next);
            }
            state = next;
        }
    }

    fn stop_reason(&self) -> Option<StopReason> {
        let handle = self.ctx.handle();
        if self.ctx.stop_requested() {
            return Some(StopReason::Requested);
        }
        if self.tracker.is_pending_deletion(handle) || self.tracker.is_freed(handle) {
            return Some(StopReason::Reclaimed);
        }
        if self.deps.shutdown.is_shutdown_in_progress() {
            return Some(StopReason::Shutdown);
        }
        if self.deps.states.is_stream_disabled(self.ctx.name()) {
            return Some(StopReason::Disabled);
        }
        None
    }

    async fn connecting(&mut self) -> ThreadState {
        match self.connect().await {
            None => ThreadState::Stopping,
            Some(Ok(())) => {
                self.on_connected(false);
                ThreadState::Running
            }
            Some(Err(e)) => {
                self.attempt = self.attempt.saturating_add(1);
                if !self.note_failure(&e) {
                    return ThreadState::Stopping;
                }
                let delay = self.policy.delay(self.attempt);
                warn!(
                    "Stream '{}' connect attempt {} failed: {}; retrying in {:?}",
                    self.ctx.name(),
                    self.attempt,
                    e,
                    delay
                );
                if self.sleep_or_cancel(delay).await {
                    ThreadState::Connecting
                } else {
                    ThreadState::Stopping
                }
            }
        }
    }

    async fn reconnecting(&mut self) -> ThreadState {
        // Drop the old session before dialing again; never two per context
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }

        let delay = self.policy.delay(self.attempt.max(1));
        debug!(
            "Stream '{}' reconnect attempt {} in {:?}",
            self.ctx.name(),
            self.attempt.max(1),
            delay
        );
        if !self.sleep_or_cancel(delay).await || self.stop_reason().is_some() {
            return ThreadState::Stopping;
        }

        match self.connect().await {
            None => ThreadState::Stopping,
            Some(Ok(())) => {
                self.on_connected(true);
                ThreadState::Running
            }
            Some(Err(e)) => {
                self.attempt = self.attempt.saturating_add(1);
                if !self.note_failure(&e) {
                    return ThreadState::Stopping;
                }
                warn!(
                    "Stream '{}' reconnect attempt {} failed: {}",
                    self.ctx.name(),
                    self.attempt - 1,
                    e
                );
                ThreadState::Reconnecting
            }
        }
    }

    async fn running(&mut self) -> ThreadState {
        // The read deadline is whatever is left of the packet timeout
        let since = self.ctx.since_last_packet();
        if since >= self.packet_timeout {
            return self.on_stale();
        }
        let remaining = self.packet_timeout - since;

        let cancel = self.ctx.cancel_token().clone();
        let Some(connection) = self.connection.as_mut() else {
            return self.enter_reconnect(IngestError::Read("no open connection".to_string()));
        };

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ThreadState::Stopping,
            read = tokio::time::timeout(remaining, connection.read_packet()) => read,
        };

        let packet = match read {
            Err(_) => return self.on_stale(),
            Ok(Err(e)) => return self.enter_reconnect(e),
            Ok(Ok(packet)) => packet,
        };

        // Re-check after the blocking read before touching the writer
        self.ctx.mark_packet();
        if self.stop_reason().is_some() {
            return ThreadState::Stopping;
        }
        if Some(packet.stream_index) == self.video_index {
            if let Err(e) = self.write_packet(&packet).await {
                return self.enter_reconnect(e);
            }
        }
        ThreadState::Running
    }

    fn on_stale(&mut self) -> ThreadState {
        warn!(
            "Stream '{}' stale: no packet for {:?}",
            self.ctx.name(),
            self.ctx.since_last_packet()
        );
        self.enter_reconnect(IngestError::PacketTimeout(self.packet_timeout))
    }

    fn enter_reconnect(&mut self, e: IngestError) -> ThreadState {
        self.attempt = 1;
        if !self.note_failure(&e) {
            return ThreadState::Stopping;
        }
        match e {
            IngestError::Eof => info!("Stream '{}' source ended, reconnecting", self.ctx.name()),
            e => warn!("Stream '{}' lost connection: {}", self.ctx.name(), e),
        }
        ThreadState::Reconnecting
    }

    /// Record a failure. False when shutdown turns the failure into a stop.
    fn note_failure(&self, e: &IngestError) -> bool {
        let failures = self.ctx.record_failure();
        if self.deps.shutdown.is_shutdown_in_progress() {
            info!(
                "Stream '{}' failed during shutdown ({}); stopping",
                self.ctx.name(),
                e
            );
            return false;
        }
        if failures > 0 && failures % 10 == 0 {
            error!(
                "Stream '{}' has failed {} times in a row",
                self.ctx.name(),
                failures
            );
        }
        true
    }

    fn on_connected(&mut self, after_reconnect: bool) {
        self.attempt = 0;
        self.ctx.mark_connected(after_reconnect);
        info!(
            "Stream '{}' {}",
            self.ctx.name(),
            if after_reconnect { "reconnected" } else { "connected" }
        );
    }

    /// Sleep unless the context is cancelled first. False if cancelled.
    async fn sleep_or_cancel(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancel_token().cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Open the source, find its video stream and get a writer ready.
    /// `None` means the context was cancelled while connecting.
    async fn connect(&mut self) -> Option<Result<(), IngestError>> {
        let cancel = self.ctx.cancel_token().clone();
        let config = self.ctx.config();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            opened = self.deps.source.open(&config.url, config.transport) => opened,
        };

        let connection = match opened {
            Ok(connection) => connection,
            Err(e) => return Some(Err(e)),
        };

        let Some(info) = connection.find_video_substream() else {
            connection.close().await;
            return Some(Err(IngestError::NoVideoStream));
        };
        debug!(
            "Stream '{}' video: {} {}x{} @{}Hz",
            self.ctx.name(),
            info.codec,
            info.width,
            info.height,
            info.clock_rate
        );

        if let Err(e) = self.prepare_writer(&info).await {
            connection.close().await;
            return Some(Err(e));
        }

        self.video_index = Some(info.index);
        self.connection = Some(connection);
        Some(Ok(()))
    }

    /// Reuse the parked writer if it was initialised with the same
    /// parameters, otherwise replace it.
    async fn prepare_writer(&mut self, info: &StreamInfo) -> Result<(), IngestError> {
        let parked = self.ctx.writer().take();
        let mut writer = match parked {
            Some(writer) if writer.stream_info() == Some(info) => return self.park_writer(writer).await,
            Some(mut stale) => {
                info!(
                    "Stream '{}' parameters changed, replacing segment writer",
                    self.ctx.name()
                );
                stale.close().await;
                self.deps.writers.create(self.ctx.name(), self.ctx.output_dir())
            }
            None => self.deps.writers.create(self.ctx.name(), self.ctx.output_dir()),
        };

        if let Err(e) = writer.init(info).await {
            writer.close().await;
            return Err(e);
        }
        self.park_writer(writer).await
    }

    async fn park_writer(&mut self, writer: Box<dyn SegmentWriter>) -> Result<(), IngestError> {
        match self.ctx.writer().put_back(writer) {
            Ok(()) => Ok(()),
            Err(mut writer) => {
                writer.close().await;
                Err(IngestError::WriterInit("writer slot is sealed".to_string()))
            }
        }
    }

    /// Take the writer for exactly one write, then hand it back.
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), IngestError> {
        let Some(mut writer) = self.ctx.writer().take() else {
            debug!("Stream '{}' writer unavailable, dropping packet", self.ctx.name());
            return Ok(());
        };

        if let Err(e) = writer.write(packet).await {
            writer.close().await;
            return Err(e);
        }

        if let Err(mut writer) = self.ctx.writer().put_back(writer) {
            writer.close().await;
            return Ok(());
        }

        let written = self.ctx.record_packet_written();
        if written % 1000 == 0 {
            debug!("Stream '{}' wrote {} packets", self.ctx.name(), written);
        }
        Ok(())
    }

    async fn finish(mut self, reason: StopReason) {
        let name = self.ctx.name().to_string();
        self.ctx.set_state(ThreadState::Stopping);
        info!("Stream '{}' stopping ({:?})", name, reason);

        let remaining = self.deps.states.release_ref(&name, Consumer::Hls);
        if remaining > 0 {
            info!("Stream '{}' still has {} other consumer(s)", name, remaining);
        }

        // Connection first, then the writer; sealing makes a late put_back fail
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        if let Some(mut writer) = self.ctx.writer().seal_and_take() {
            writer.close().await;
        }

        self.ctx.mark_stopped();
        self.ctx.set_state(ThreadState::Stopped);
        self.deps
            .shutdown
            .report_state(self.ctx.component_id(), ComponentState::Stopped);
        info!("Ingestion task for stream '{}' stopped", name);

        self.tracker.mark_thread_exited(self.ctx.handle());
    }
}
