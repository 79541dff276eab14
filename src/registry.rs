use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::{self, IngestConfig, StreamConfig};
use crate::context::{StreamContext, StreamStatus};
use crate::errors::{RestartError, StartError, StopError};
use crate::ingest::{IngestDeps, IngestionStateMachine};
use crate::lifecycle::{AccessDenied, ContextHandle, LifecycleTracker, Retired};
use crate::reconnect::ReconnectPolicy;
use crate::utils::ensure_writable_dir;

struct Slot {
    generation: u32,
    context: Option<Arc<StreamContext>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which streams exist, keyed by name over a generation-checked slot table.
///
/// The slot mutex only guards insert/remove/iteration and is never held
/// across an `.await`. Status questions go to the contexts' own atomics.
pub struct StreamRegistry {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
    configs: Mutex<HashMap<String, StreamConfig>>,
    tracker: Arc<LifecycleTracker>,
    deps: IngestDeps,
    ingest: IngestConfig,
    policy: ReconnectPolicy,
    next_serial: AtomicU64,
}

impl StreamRegistry {
    pub fn new(ingest: IngestConfig, policy: ReconnectPolicy, deps: IngestDeps) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(ingest.max_streams)),
            capacity: ingest.max_streams,
            configs: Mutex::new(HashMap::new()),
            tracker: Arc::new(LifecycleTracker::new(ingest.freed_history)),
            deps,
            ingest,
            policy,
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn packet_timeout(&self) -> Duration {
        self.ingest.packet_timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.deps.shutdown.is_shutdown_in_progress()
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.deps.states.is_stream_disabled(name)
    }

    /// Last configuration `start` was called with for this name.
    pub fn config_for(&self, name: &str) -> Option<StreamConfig> {
        lock(&self.configs).get(name).cloned()
    }

    /// Start ingesting `name`. Returns as soon as the task is spawned.
    ///
    /// `AlreadyRunning` means a live instance exists and the caller's intent
    /// is already met. A context that is still running counts even while it
    /// is backing off without a valid connection, so no second context is
    /// spawned next to it. Extra contexts left behind by races are converged
    /// here: the one with a valid connection (else the oldest) is kept and
    /// the rest are retired in the background.
    pub async fn start(self: &Arc<Self>, name: &str, config: StreamConfig) -> Result<ContextHandle, StartError> {
        // Cheap refusals first, before touching the filesystem
        config::validate_stream_name(name).map_err(|_| StartError::InvalidName(name.to_string()))?;
        if self.is_shutting_down() {
            return Err(StartError::ShuttingDown);
        }
        if self.is_disabled(name) {
            return Err(StartError::Disabled(name.to_string()));
        }

        let output_dir = config.resolve_output_dir(&self.ingest.output_root, name);
        ensure_writable_dir(&output_dir)
            .await
            .map_err(|source| StartError::DirectoryNotWritable {
                path: output_dir.clone(),
                source,
            })?;

        let (outcome, losers) = {
            let mut slots = lock(&self.slots);
            let (keeper, losers) = self.converge(&slots, name);
            match keeper {
                Some(keeper) if keeper.is_running() => (Err(StartError::AlreadyRunning(name.to_string())), losers),
                keeper => {
                    let mut losers = losers;
                    losers.extend(keeper);
                    let outcome = self.allocate(&mut slots, name, config.clone(), output_dir);
                    // Only a stream that got a slot is remembered for restart
                    if outcome.is_ok() {
                        lock(&self.configs).insert(name.to_string(), config);
                    }
                    (outcome.map(|ctx| ctx.handle()), losers)
                }
            }
        };

        for ctx in losers {
            info!(
                "Retiring duplicate context {} for stream '{}'",
                ctx.handle(),
                name
            );
            let registry = self.clone();
            tokio::spawn(async move { registry.reclaim(&ctx).await });
        }

        match &outcome {
            Ok(handle) => info!("Stream '{}' started as context {}", name, handle),
            Err(StartError::AlreadyRunning(_)) => debug!("Stream '{}' is already running", name),
            Err(e) => warn!("Failed to start stream '{}': {}", name, e),
        }
        outcome
    }

    /// Split the live contexts for `name` into the one to keep and the rest.
    fn converge(&self, slots: &[Slot], name: &str) -> (Option<Arc<StreamContext>>, Vec<Arc<StreamContext>>) {
        let mut live: Vec<Arc<StreamContext>> = slots
            .iter()
            .filter_map(|slot| slot.context.as_ref())
            .filter(|ctx| ctx.name() == name)
            .filter(|ctx| self.tracker.check_access(ctx.handle()).is_ok())
            .cloned()
            .collect();

        // Valid connection first, then oldest
        live.sort_by_key(|ctx| (!ctx.is_connection_valid(), ctx.serial()));
        let mut live = live.into_iter();
        let keeper = live.next();
        (keeper, live.collect())
    }

    fn allocate(
        &self,
        slots: &mut Vec<Slot>,
        name: &str,
        config: StreamConfig,
        output_dir: std::path::PathBuf,
    ) -> Result<Arc<StreamContext>, StartError> {
        // Reuse a released slot before growing the table
        let index = match slots.iter().position(|slot| slot.context.is_none()) {
            Some(index) => index,
            None if slots.len() < self.capacity => {
                slots.push(Slot {
                    generation: 0,
                    context: None,
                });
                slots.len() - 1
            }
            None => {
                return Err(StartError::NoFreeSlot {
                    capacity: self.capacity,
                })
            }
        };

        let slot = &mut slots[index];
        let handle = ContextHandle::new(index as u32, slot.generation);
        let component = self.deps.shutdown.register_component(&format!("hls:{}", name));
        let ctx = Arc::new(StreamContext::new(
            name.to_string(),
            config,
            output_dir,
            handle,
            self.next_serial.fetch_add(1, Ordering::Relaxed),
            component,
        ));

        let machine = IngestionStateMachine::new(
            ctx.clone(),
            self.deps.clone(),
            self.tracker.clone(),
            self.policy,
            self.ingest.packet_timeout,
        );
        // The slot owns the context from here; the task only holds a clone
        ctx.set_task(tokio::spawn(machine.run()));
        slot.context = Some(ctx.clone());
        Ok(ctx)
    }

    /// Tear down every context registered under `name`. Returns once each
    /// is reclaimed, or forced after the teardown timeout.
    pub async fn stop(&self, name: &str) -> Result<(), StopError> {
        let targets = self.contexts_named(name);
        if targets.is_empty() {
            return Err(StopError::NotFound(name.to_string()));
        }
        info!("Stopping stream '{}' ({} context(s))", name, targets.len());
        join_all(targets.iter().map(|ctx| self.reclaim(ctx))).await;
        Ok(())
    }

    /// `stop`, settle, then `start` with the last known configuration.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<ContextHandle, RestartError> {
        let config = self
            .config_for(name)
            .ok_or_else(|| StopError::NotFound(name.to_string()))?;
        self.stop(name).await?;
        tokio::time::sleep(self.ingest.restart_settle).await;
        self.start_idempotent(name, config).await
    }

    /// Swap in a new configuration for `name`, whether or not it is running.
    pub async fn replace(self: &Arc<Self>, name: &str, config: StreamConfig) -> Result<ContextHandle, StartError> {
        if self.stop(name).await.is_ok() {
            tokio::time::sleep(self.ingest.restart_settle).await;
        }
        self.start(name, config).await
    }

    /// Stop `name` and forget its configuration.
    pub async fn remove(&self, name: &str) -> Result<(), StopError> {
        let stopped = self.stop(name).await;
        let known = lock(&self.configs).remove(name).is_some();
        match stopped {
            Err(_) if known => Ok(()),
            other => other,
        }
    }

    async fn start_idempotent(self: &Arc<Self>, name: &str, config: StreamConfig) -> Result<ContextHandle, RestartError> {
        match self.start(name, config).await {
            Ok(handle) => Ok(handle),
            Err(StartError::AlreadyRunning(_)) => self
                .active_handle(name)
                .ok_or_else(|| StopError::NotFound(name.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the teardown protocol for one context, then release its slot.
    async fn reclaim(&self, ctx: &Arc<StreamContext>) -> Option<Retired> {
        let handle = ctx.handle();
        match self
            .tracker
            .retire(ctx, self.ingest.teardown_timeout, self.ingest.teardown_poll)
            .await
        {
            Ok(retired) => {
                // Bump the slot generation before dropping the pending entry
                self.release_slot(handle);
                self.tracker.clear_pending(handle);
                Some(retired)
            }
            Err(AccessDenied::PendingDeletion(_)) => {
                // Someone else is retiring it; wait for them to finish.
                let deadline = tokio::time::Instant::now() + self.ingest.teardown_timeout * 2;
                while self.slot_holds(handle) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(self.ingest.teardown_poll).await;
                }
                if self.slot_holds(handle) {
                    warn!("Timed out waiting for context {} of '{}' to be reclaimed", handle, ctx.name());
                }
                None
            }
            Err(AccessDenied::Freed(_)) => {
                debug!("Context {} of '{}' already reclaimed", handle, ctx.name());
                None
            }
        }
    }

    fn release_slot(&self, handle: ContextHandle) {
        let mut slots = lock(&self.slots);
        match slots.get_mut(handle.index()) {
            Some(slot) if slot.generation == handle.generation() && slot.context.is_some() => {
                slot.context = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
            _ => error!("Slot for context {} does not hold it; skipping release", handle),
        }
    }

    fn slot_holds(&self, handle: ContextHandle) -> bool {
        lock(&self.slots)
            .get(handle.index())
            .is_some_and(|slot| slot.generation == handle.generation() && slot.context.is_some())
    }

    fn contexts_named(&self, name: &str) -> Vec<Arc<StreamContext>> {
        lock(&self.slots)
            .iter()
            .filter_map(|slot| slot.context.as_ref())
            .filter(|ctx| ctx.name() == name)
            .cloned()
            .collect()
    }

    /// True iff some context for `name` is running with a valid connection.
    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.slots)
            .iter()
            .filter_map(|slot| slot.context.as_ref())
            .any(|ctx| ctx.name() == name && ctx.is_active())
    }

    fn active_handle(&self, name: &str) -> Option<ContextHandle> {
        self.live_contexts()
            .into_iter()
            .find(|ctx| ctx.name() == name && ctx.is_running())
            .map(|ctx| ctx.handle())
    }

    /// Resolve a handle, refusing ones that are pending deletion, freed, or stale.
    pub fn get(&self, handle: ContextHandle) -> Option<Arc<StreamContext>> {
        if let Err(denied) = self.tracker.check_access(handle) {
            debug!("Rejected access: {}", denied);
            return None;
        }
        lock(&self.slots)
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.context.clone())
    }

    /// Contexts not currently being torn down.
    pub fn live_contexts(&self) -> Vec<Arc<StreamContext>> {
        let contexts: Vec<Arc<StreamContext>> = lock(&self.slots)
            .iter()
            .filter_map(|slot| slot.context.clone())
            .collect();
        contexts
            .into_iter()
            .filter(|ctx| {
                let handle = ctx.handle();
                !self.tracker.is_pending_deletion(handle) && !self.tracker.is_freed(handle)
            })
            .collect()
    }

    pub fn list(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<StreamStatus> = self.live_contexts().iter().map(|ctx| ctx.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name).then(a.handle.index().cmp(&b.handle.index())));
        statuses
    }

    /// Status of the best context for `name`: active first, then running.
    pub fn status(&self, name: &str) -> Option<StreamStatus> {
        let mut candidates: Vec<Arc<StreamContext>> = self
            .live_contexts()
            .into_iter()
            .filter(|ctx| ctx.name() == name)
            .collect();
        candidates.sort_by_key(|ctx| (!ctx.is_active(), !ctx.is_running(), ctx.serial()));
        candidates.first().map(|ctx| ctx.status())
    }

    /// Tear down every context concurrently.
    pub async fn stop_all(&self) {
        let contexts: Vec<Arc<StreamContext>> = lock(&self.slots)
            .iter()
            .filter_map(|slot| slot.context.clone())
            .collect();
        if contexts.is_empty() {
            return;
        }
        info!("Stopping all {} stream context(s)", contexts.len());
        let results = join_all(contexts.iter().map(|ctx| self.reclaim(ctx))).await;
        let forced = results.iter().flatten().filter(|r| r.forced).count();
        if forced > 0 {
            warn!("{} context(s) had to be reclaimed forcibly", forced);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadState;
    use crate::testing::{scratch_dir, Harness, ScriptedSource};
    use tokio::time::sleep;

    fn registry_with(harness: &Harness, max_streams: usize) -> Arc<StreamRegistry> {
        let ingest = IngestConfig {
            output_root: scratch_dir("registry"),
            max_streams,
            teardown_timeout: Duration::from_secs(1),
            teardown_poll: Duration::from_millis(10),
            restart_settle: Duration::from_millis(10),
            ..IngestConfig::default()
        };
        let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(100));
        Arc::new(StreamRegistry::new(ingest, policy, harness.deps.clone()))
    }

    fn cam() -> StreamConfig {
        StreamConfig::new("rtsp://camera.test/live")
    }

    async fn wait_active(registry: &StreamRegistry, name: &str) {
        for _ in 0..100 {
            if registry.is_active(name) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("stream '{}' never became active", name);
    }

    fn live_count(registry: &StreamRegistry, name: &str) -> usize {
        registry.live_contexts().iter().filter(|ctx| ctx.name() == name).count()
    }

    #[tokio::test]
    async fn test_second_start_is_already_running() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        let handle = registry.start("front", cam()).await.unwrap();
        let err = registry.start("front", cam()).await.unwrap_err();
        assert!(err.is_already_running());
        assert_eq!(live_count(&registry, "front"), 1);

        wait_active(&registry, "front").await;
        assert_eq!(registry.status("front").unwrap().handle, handle);
        assert_eq!(harness.source.peak_live_connections(), 1);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_no_free_slot() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 1);

        registry.start("a", cam()).await.unwrap();
        match registry.start("b", cam()).await {
            Err(StartError::NoFreeSlot { capacity }) => assert_eq!(capacity, 1),
            other => panic!("unexpected: {:?}", other),
        }
        // A start that got no slot leaves nothing behind to restart
        assert!(registry.config_for("b").is_none());
        assert!(matches!(
            registry.restart("b").await,
            Err(RestartError::Stop(StopError::NotFound(_)))
        ));

        // Freed slot is reused under a new generation
        let old = registry.status("a").unwrap().handle;
        registry.stop("a").await.unwrap();
        let new = registry.start("b", cam()).await.unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_unwritable_directory() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        let blocker = scratch_dir("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = cam();
        config.output_dir = Some(blocker.join("hls"));

        assert!(matches!(
            registry.start("blocked", config).await,
            Err(StartError::DirectoryNotWritable { .. })
        ));
        assert_eq!(live_count(&registry, "blocked"), 0);
        let _ = std::fs::remove_file(&blocker);
    }

    #[tokio::test]
    async fn test_rejects_bad_names_disabled_and_shutdown() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        assert!(matches!(
            registry.start("../etc", cam()).await,
            Err(StartError::InvalidName(_))
        ));

        harness.states.set_disabled("garage", true);
        assert!(matches!(
            registry.start("garage", cam()).await,
            Err(StartError::Disabled(_))
        ));

        harness.coordinator.initiate_shutdown();
        assert!(matches!(
            registry.start("porch", cam()).await,
            Err(StartError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_stream() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);
        assert!(matches!(registry.stop("ghost").await, Err(StopError::NotFound(_))));
        assert!(matches!(
            registry.restart("ghost").await,
            Err(RestartError::Stop(StopError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_stop_then_start_leaves_one_task() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        let old = registry.start("yard", cam()).await.unwrap();
        wait_active(&registry, "yard").await;
        let old_ctx = registry.get(old).unwrap();

        registry.stop("yard").await.unwrap();
        assert!(!registry.is_active("yard"));
        assert_eq!(old_ctx.state(), ThreadState::Stopped);

        let new = registry.start("yard", cam()).await.unwrap();
        assert_ne!(old, new);
        assert_eq!(live_count(&registry, "yard"), 1);
        assert_ne!(registry.get(new).unwrap().state(), ThreadState::Stopped);

        // The old handle is gone for good
        let rejected = registry.tracker().stats().rejected_accesses;
        assert!(registry.get(old).is_none());
        assert_eq!(registry.tracker().stats().rejected_accesses, rejected + 1);

        wait_active(&registry, "yard").await;
        assert_eq!(harness.source.live_connections(), 1);
        registry.stop_all().await;
        assert_eq!(harness.source.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_stop_and_restart_free_once() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        registry.start("race", cam()).await.unwrap();
        wait_active(&registry, "race").await;

        let mut tasks = Vec::new();
        for i in 0..6 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _ = registry.stop("race").await;
                } else {
                    let _ = registry.restart("race").await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let stats = registry.tracker().stats();
        assert_eq!(stats.double_frees, 0);
        assert!(live_count(&registry, "race") <= 1);

        let valid = registry
            .live_contexts()
            .iter()
            .filter(|ctx| ctx.name() == "race" && ctx.is_connection_valid())
            .count();
        assert!(valid <= 1);

        registry.stop_all().await;
        assert_eq!(live_count(&registry, "race"), 0);
    }

    #[tokio::test]
    async fn test_stuck_task_is_forced_and_slot_reused() {
        let harness = Harness::new(ScriptedSource::streaming());
        harness.writer_stats.block_next_writes(1);
        let registry = registry_with(&harness, 1);

        let old = registry.start("stuck", cam()).await.unwrap();
        wait_active(&registry, "stuck").await;
        // The first write never returns, so the task never reaches a stop checkpoint
        sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.writer_stats.writes(), 0);

        let started = tokio::time::Instant::now();
        registry.stop("stuck").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "stop returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1800), "stop returned after {:?}", elapsed);

        let stats = registry.tracker().stats();
        assert_eq!(stats.forced_reclaims, 1);
        assert_eq!(stats.double_frees, 0);
        assert!(registry.tracker().is_freed(old));
        assert!(!registry.is_active("stuck"));
        assert!(registry.get(old).is_none());

        // Capacity 1: the only slot must have been released
        let new = registry.start("stuck", cam()).await.unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        wait_active(&registry, "stuck").await;

        registry.stop_all().await;
        assert_eq!(registry.tracker().stats().forced_reclaims, 1);
    }

    #[tokio::test]
    async fn test_duplicates_converge_on_healthy_context() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);
        let output_dir = scratch_dir("dup");

        let (first, second) = {
            let mut slots = lock(&registry.slots);
            let first = registry.allocate(&mut slots, "dup", cam(), output_dir.clone()).unwrap();
            let second = registry.allocate(&mut slots, "dup", cam(), output_dir).unwrap();
            (first, second)
        };
        wait_active(&registry, "dup").await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(live_count(&registry, "dup"), 2);

        assert!(registry.start("dup", cam()).await.unwrap_err().is_already_running());
        sleep(Duration::from_millis(300)).await;

        assert_eq!(live_count(&registry, "dup"), 1);
        // Both were healthy, so the older one wins
        assert!(registry.get(first.handle()).is_some());
        assert!(registry.tracker().is_freed(second.handle()));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_restart_keeps_config() {
        let harness = Harness::new(ScriptedSource::streaming());
        let registry = registry_with(&harness, 4);

        let old = registry.start("side", cam()).await.unwrap();
        wait_active(&registry, "side").await;

        let new = registry.restart("side").await.unwrap();
        assert_ne!(old, new);
        assert_eq!(registry.get(new).unwrap().config(), &cam());
        assert_eq!(live_count(&registry, "side"), 1);

        registry.remove("side").await.unwrap();
        assert!(registry.config_for("side").is_none());
        assert!(matches!(registry.remove("side").await, Err(StopError::NotFound(_))));
    }
}
