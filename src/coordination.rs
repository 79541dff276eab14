//! Process-wide collaborators consulted by every ingestion task: the drain
//! coordinator that tracks components during shutdown, and the stream state
//! manager that knows which streams are disabled and who consumes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ComponentId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Running,
    Stopped,
}

pub trait ShutdownCoordinator: Send + Sync {
    fn is_shutdown_in_progress(&self) -> bool;
    fn register_component(&self, name: &str) -> ComponentId;
    fn report_state(&self, id: ComponentId, state: ComponentState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Consumer {
    Hls,
    Recording,
    Detection,
}

pub trait StreamStateManager: Send + Sync {
    fn is_stream_disabled(&self, name: &str) -> bool;
    /// Returns the consumer's reference count after the increment.
    fn add_ref(&self, name: &str, consumer: Consumer) -> usize;
    /// Returns the total number of references left on the stream.
    fn release_ref(&self, name: &str, consumer: Consumer) -> usize;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Component {
    name: String,
    state: ComponentState,
}

/// Tracks registered components so shutdown can wait for all of them to drain.
pub struct DrainCoordinator {
    shutdown: AtomicBool,
    token: CancellationToken,
    next_id: AtomicU64,
    components: Mutex<HashMap<ComponentId, Component>>,
    changed: Notify,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            token: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            components: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn initiate_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("System shutdown initiated");
            self.token.cancel();
        }
    }

    /// Cancelled once shutdown starts; background loops select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn running_components(&self) -> Vec<String> {
        lock(&self.components)
            .values()
            .filter(|c| c.state == ComponentState::Running)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Wait until every registered component reported `Stopped`.
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let running = self.running_components();
            if running.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("Drain timed out with components still running: {:?}", running);
                return false;
            }
        }
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator for DrainCoordinator {
    fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn register_component(&self, name: &str) -> ComponentId {
        let id = ComponentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.components).insert(
            id,
            Component {
                name: name.to_string(),
                state: ComponentState::Running,
            },
        );
        debug!("Registered component '{}' as {:?}", name, id);
        id
    }

    fn report_state(&self, id: ComponentId, state: ComponentState) {
        {
            let mut components = lock(&self.components);
            match components.get_mut(&id) {
                Some(component) => component.state = state,
                None => {
                    warn!("State report for unknown component {:?}", id);
                    return;
                }
            }
        }
        self.changed.notify_waiters();
    }
}

#[derive(Default)]
struct StreamStateEntry {
    disabled: bool,
    refs: HashMap<Consumer, usize>,
}

/// In-process stream state: administrative enable/disable plus consumer refcounts.
#[derive(Default)]
pub struct StreamStates {
    streams: Mutex<HashMap<String, StreamStateEntry>>,
}

impl StreamStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) {
        let mut streams = lock(&self.streams);
        let entry = streams.entry(name.to_string()).or_default();
        if entry.disabled != disabled {
            info!("Stream '{}' {}", name, if disabled { "disabled" } else { "enabled" });
        }
        entry.disabled = disabled;
    }

    pub fn ref_count(&self, name: &str, consumer: Consumer) -> usize {
        lock(&self.streams)
            .get(name)
            .and_then(|e| e.refs.get(&consumer).copied())
            .unwrap_or(0)
    }
}

impl StreamStateManager for StreamStates {
    fn is_stream_disabled(&self, name: &str) -> bool {
        lock(&self.streams).get(name).map(|e| e.disabled).unwrap_or(false)
    }

    fn add_ref(&self, name: &str, consumer: Consumer) -> usize {
        let mut streams = lock(&self.streams);
        let count = streams
            .entry(name.to_string())
            .or_default()
            .refs
            .entry(consumer)
            .or_insert(0);
        *count += 1;
        *count
    }

    fn release_ref(&self, name: &str, consumer: Consumer) -> usize {
        let mut streams = lock(&self.streams);
        let Some(entry) = streams.get_mut(name) else {
            warn!("Released {:?} reference on unknown stream '{}'", consumer, name);
            return 0;
        };
        match entry.refs.get_mut(&consumer) {
            Some(count) if *count > 0 => *count -= 1,
            _ => warn!("Unbalanced {:?} reference release on stream '{}'", consumer, name),
        }
        entry.refs.values().sum()
    }
}
