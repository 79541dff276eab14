//! Restarts streams whose task has silently died, with a per-stream cap on
//! restarts inside a sliding cooldown window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::registry::StreamRegistry;

/// Liveness is judged against this multiple of the packet timeout.
const STALE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Healthy,
    Restart,
    Throttled,
}

#[derive(Debug, Default)]
struct RestartHistory {
    attempts: VecDeque<Instant>,
    restart_count: u32,
    alive_since: Option<Instant>,
}

impl RestartHistory {
    fn observe_alive(&mut self, now: Instant, cooldown: Duration) -> Decision {
        let since = *self.alive_since.get_or_insert(now);
        if self.restart_count > 0 && now.saturating_duration_since(since) >= cooldown * 2 {
            self.restart_count = 0;
            self.attempts.clear();
        }
        Decision::Healthy
    }

    fn observe_dead(&mut self, now: Instant, max_attempts: u32, cooldown: Duration) -> Decision {
        self.alive_since = None;
        while self
            .attempts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= cooldown)
        {
            self.attempts.pop_front();
        }
        if self.attempts.len() >= max_attempts as usize {
            return Decision::Throttled;
        }
        self.attempts.push_back(now);
        self.restart_count = self.restart_count.saturating_add(1);
        Decision::Restart
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStreamStats {
    pub name: String,
    pub restart_count: u32,
    pub attempts_in_window: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStats {
    pub enabled: bool,
    pub restarts_issued: u64,
    pub restarts_throttled: u64,
    pub streams: Vec<WatchdogStreamStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Watchdog {
    registry: Arc<StreamRegistry>,
    config: WatchdogConfig,
    stale_after: Duration,
    histories: Mutex<HashMap<String, RestartHistory>>,
    restarts_issued: AtomicU64,
    restarts_throttled: AtomicU64,
}

impl Watchdog {
    pub fn new(registry: Arc<StreamRegistry>, config: WatchdogConfig) -> Self {
        let stale_after = registry.packet_timeout() * STALE_FACTOR;
        Self {
            registry,
            config,
            stale_after,
            histories: Mutex::new(HashMap::new()),
            restarts_issued: AtomicU64::new(0),
            restarts_throttled: AtomicU64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Watchdog disabled");
            return;
        }
        info!(
            "Watchdog started: interval {:?}, max {} restarts per {:?}",
            self.config.interval, self.config.max_attempts, self.config.cooldown
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        info!("Watchdog stopped");
    }

    /// One scan. Returns the names that were restarted.
    pub async fn check_once(&self) -> Vec<String> {
        let to_restart = self.plan(Instant::now());
        if to_restart.is_empty() {
            return to_restart;
        }

        let registry = &self.registry;
        let results = join_all(to_restart.iter().map(|name| async move {
            warn!("Watchdog restarting stream '{}'", name);
            (name, registry.restart(name).await)
        }))
        .await;

        for (name, result) in results {
            match result {
                Ok(handle) => info!("Watchdog restarted stream '{}' as context {}", name, handle),
                Err(e) => error!("Watchdog failed to restart stream '{}': {}", name, e),
            }
        }
        to_restart
    }

    fn plan(&self, now: Instant) -> Vec<String> {
        if self.registry.is_shutting_down() {
            return Vec::new();
        }

        // Per name: alive if any of its contexts is alive
        let mut liveness: HashMap<String, bool> = HashMap::new();
        for ctx in self.registry.live_contexts() {
            let alive = ctx.is_alive(self.stale_after);
            *liveness.entry(ctx.name().to_string()).or_insert(false) |= alive;
        }

        let mut histories = lock(&self.histories);
        let mut to_restart = Vec::new();
        let mut seen = HashSet::new();
        for (name, alive) in liveness {
            seen.insert(name.clone());
            if self.registry.is_disabled(&name) {
                continue;
            }
            let history = histories.entry(name.clone()).or_default();
            let decision = if alive {
                history.observe_alive(now, self.config.cooldown)
            } else {
                history.observe_dead(now, self.config.max_attempts, self.config.cooldown)
            };
            match decision {
                Decision::Healthy => {}
                Decision::Restart => {
                    self.restarts_issued.fetch_add(1, Ordering::Relaxed);
                    to_restart.push(name);
                }
                Decision::Throttled => {
                    self.restarts_throttled.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Stream '{}' is not alive but reached {} restarts within {:?}; skipping",
                        name, self.config.max_attempts, self.config.cooldown
                    );
                }
            }
        }

        histories.retain(|name, _| seen.contains(name));
        debug!("Watchdog scan: {} stream(s) to restart", to_restart.len());
        to_restart.sort();
        to_restart
    }

    pub fn stats(&self) -> WatchdogStats {
        let mut streams: Vec<WatchdogStreamStats> = lock(&self.histories)
            .iter()
            .map(|(name, h)| WatchdogStreamStats {
                name: name.clone(),
                restart_count: h.restart_count,
                attempts_in_window: h.attempts.len(),
            })
            .collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        WatchdogStats {
            enabled: self.config.enabled,
            restarts_issued: self.restarts_issued.load(Ordering::Relaxed),
            restarts_throttled: self.restarts_throttled.load(Ordering::Relaxed),
            streams,
        }
    }
}
