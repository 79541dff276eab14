use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config;
use crate::errors::{Result, StreamError};
use crate::AppState;

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// File created or changed: (re)load and apply it.
    Apply(String, PathBuf),
    Remove(String),
}

impl WatchAction {
    pub fn stream_name(&self) -> &str {
        match self {
            WatchAction::Apply(name, _) | WatchAction::Remove(name) => name,
        }
    }
}

/// Map a notify event to per-stream actions. Unrelated files are ignored.
pub fn actions_for(event: &Event) -> Vec<WatchAction> {
    event
        .paths
        .iter()
        .filter_map(|path| {
            let name = config::stream_name_from_path(path)?;
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => Some(WatchAction::Apply(name, path.clone())),
                EventKind::Remove(_) => Some(WatchAction::Remove(name)),
                _ => None,
            }
        })
        .collect()
}

/// Keeps the newest action per stream and releases it once that stream's
/// files have been quiet for the debounce window.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: HashMap<String, (WatchAction, Instant)>,
}

impl Debouncer {
    pub fn push(&mut self, action: WatchAction, now: Instant) {
        self.pending.insert(action.stream_name().to_string(), (action, now));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, last)| *last + DEBOUNCE).min()
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<WatchAction> {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (_, last))| now.saturating_duration_since(*last) >= DEBOUNCE)
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|name| self.pending.remove(&name).map(|(action, _)| action))
            .collect()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub async fn start_stream_config_watcher(app_state: AppState) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| match res {
            Ok(event) => {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watcher event: {}", e);
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| StreamError::config(format!("File watcher error: {}", e)))?;

    let streams_dir = Path::new(&app_state.streams_directory);
    if !streams_dir.exists() {
        info!("Creating streams directory '{}' for watching...", app_state.streams_directory);
        fs::create_dir_all(streams_dir)?;
    }

    watcher
        .watch(streams_dir, RecursiveMode::NonRecursive)
        .map_err(|e| StreamError::config(format!("Failed to watch streams directory: {}", e)))?;
    info!(
        "Started watching streams directory '{}' for configuration changes",
        app_state.streams_directory
    );

    let shutdown = app_state.coordinator.shutdown_token();
    tokio::spawn(async move {
        let _watcher = watcher;
        let mut debouncer = Debouncer::default();

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        // Editors often create an empty file and fill it right after;
                        // only the last event of a burst is applied.
                        let now = Instant::now();
                        for action in actions_for(&event) {
                            debouncer.push(action, now);
                        }
                    }
                    None => break,
                },
                _ = wait_until(deadline) => {
                    for action in debouncer.take_due(Instant::now()) {
                        handle_action(action, &app_state).await;
                    }
                }
            }
        }
        info!("Streams directory watcher stopped");
    });

    Ok(())
}

async fn handle_action(action: WatchAction, app_state: &AppState) {
    match action {
        WatchAction::Apply(name, path) => {
            let stream_config = match config::load_stream_file(&path) {
                Ok(stream_config) => stream_config,
                Err(e) => {
                    error!("Failed to load configuration for stream '{}': {}", name, e);
                    return;
                }
            };

            if !stream_config.is_enabled() {
                info!("Stream '{}' is disabled in its configuration", name);
                app_state.states.set_disabled(&name, true);
                if app_state.registry.stop(&name).await.is_ok() {
                    info!("Stopped disabled stream '{}'", name);
                }
                return;
            }

            app_state.states.set_disabled(&name, false);
            if app_state.registry.config_for(&name).as_ref() == Some(&stream_config) && app_state.registry.is_active(&name) {
                return;
            }
            info!("Detected configuration change for stream '{}'", name);
            match app_state.registry.replace(&name, stream_config).await {
                Ok(handle) => info!("Stream '{}' (re)started as context {}", name, handle),
                Err(e) if e.is_already_running() => {}
                Err(e) => error!("Failed to apply configuration for stream '{}': {}", name, e),
            }
        }
        WatchAction::Remove(name) => {
            info!("Detected configuration removal for stream '{}'", name);
            if let Err(e) = app_state.registry.remove(&name).await {
                warn!("Failed to remove stream '{}': {}", name, e);
            }
        }
    }
}
