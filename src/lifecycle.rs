//! Teardown bookkeeping for stream contexts.
//!
//! A context is retired in a fixed order: mark pending deletion, signal the
//! task, wait (bounded) for it to exit, record the handle as freed, and only
//! then let the registry drop its slot. Anything outside the owning task
//! calls [`LifecycleTracker::check_access`] before touching a context beyond
//! its atomics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::StreamContext;

/// Generation-checked slot reference. A slot's generation is bumped every
/// time it is released, so a stale handle never matches a newer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextHandle {
    index: u32,
    generation: u32,
}

impl ContextHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}g{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingDeletionEntry {
    pub pending_deletion: bool,
    pub thread_exited: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    #[error("context {0} has already been freed")]
    Freed(ContextHandle),

    #[error("context {0} is pending deletion")]
    PendingDeletion(ContextHandle),
}

/// Bounded history of reclaimed handles, oldest evicted first.
struct FreedHandleSet {
    order: VecDeque<ContextHandle>,
    members: HashSet<ContextHandle>,
    capacity: usize,
}

impl FreedHandleSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, handle: &ContextHandle) -> bool {
        self.members.contains(handle)
    }

    /// False if the handle was already present.
    fn insert(&mut self, handle: ContextHandle) -> bool {
        if !self.members.insert(handle) {
            return false;
        }
        self.order.push_back(handle);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub pending: usize,
    pub freed_tracked: usize,
    pub rejected_accesses: u64,
    pub double_frees: u64,
    pub forced_reclaims: u64,
}

/// Result of a completed retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub handle: ContextHandle,
    /// The task did not exit within the teardown timeout.
    pub forced: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LifecycleTracker {
    pending: Mutex<HashMap<ContextHandle, PendingDeletionEntry>>,
    freed: Mutex<FreedHandleSet>,
    rejected_accesses: AtomicU64,
    double_frees: AtomicU64,
    forced_reclaims: AtomicU64,
}

impl LifecycleTracker {
    pub fn new(freed_history: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            freed: Mutex::new(FreedHandleSet::new(freed_history)),
            rejected_accesses: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            forced_reclaims: AtomicU64::new(0),
        }
    }

    /// Step 1 of teardown. False if the handle is already being retired or is gone.
    pub fn begin_deletion(&self, handle: ContextHandle) -> bool {
        if self.is_freed(handle) {
            self.rejected_accesses.fetch_add(1, Ordering::Relaxed);
            warn!("Refusing to delete context {}: already freed", handle);
            return false;
        }
        let mut pending = lock(&self.pending);
        if pending.get(&handle).is_some_and(|e| e.pending_deletion) {
            return false;
        }
        pending.insert(
            handle,
            PendingDeletionEntry {
                pending_deletion: true,
                thread_exited: false,
            },
        );
        true
    }

    pub fn is_pending_deletion(&self, handle: ContextHandle) -> bool {
        lock(&self.pending)
            .get(&handle)
            .is_some_and(|e| e.pending_deletion)
    }

    pub fn pending_entry(&self, handle: ContextHandle) -> Option<PendingDeletionEntry> {
        lock(&self.pending).get(&handle).copied()
    }

    /// Called by the owning task as the last thing before it returns.
    pub fn mark_thread_exited(&self, handle: ContextHandle) {
        if let Some(entry) = lock(&self.pending).get_mut(&handle) {
            entry.thread_exited = true;
        }
    }

    fn thread_exited(&self, handle: ContextHandle) -> bool {
        lock(&self.pending)
            .get(&handle)
            .is_some_and(|e| e.thread_exited)
    }

    fn force_thread_exited(&self, handle: ContextHandle) {
        self.forced_reclaims.fetch_add(1, Ordering::Relaxed);
        self.mark_thread_exited(handle);
    }

    pub fn is_freed(&self, handle: ContextHandle) -> bool {
        lock(&self.freed).contains(&handle)
    }

    /// Step 5: record the handle as freed. A second call for the same handle
    /// is a double free; it is counted and rejected.
    pub fn mark_freed(&self, handle: ContextHandle) -> Result<(), AccessDenied> {
        if lock(&self.freed).insert(handle) {
            Ok(())
        } else {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
            error!("Context {} freed twice; ignoring second free", handle);
            Err(AccessDenied::Freed(handle))
        }
    }

    pub fn clear_pending(&self, handle: ContextHandle) {
        lock(&self.pending).remove(&handle);
    }

    /// Gate for any access from outside the owning task.
    pub fn check_access(&self, handle: ContextHandle) -> Result<(), AccessDenied> {
        if self.is_freed(handle) {
            self.rejected_accesses.fetch_add(1, Ordering::Relaxed);
            return Err(AccessDenied::Freed(handle));
        }
        if self.is_pending_deletion(handle) {
            self.rejected_accesses.fetch_add(1, Ordering::Relaxed);
            return Err(AccessDenied::PendingDeletion(handle));
        }
        Ok(())
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            pending: lock(&self.pending).len(),
            freed_tracked: lock(&self.freed).len(),
            rejected_accesses: self.rejected_accesses.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
            forced_reclaims: self.forced_reclaims.load(Ordering::Relaxed),
        }
    }

    /// Steps 1-5 of the teardown protocol. The caller removes the slot
    /// (step 6) and then calls [`clear_pending`](Self::clear_pending).
    pub async fn retire(
        &self,
        ctx: &Arc<StreamContext>,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Retired, AccessDenied> {
        let handle = ctx.handle();
        if !self.begin_deletion(handle) {
            return Err(if self.is_freed(handle) {
                AccessDenied::Freed(handle)
            } else {
                AccessDenied::PendingDeletion(handle)
            });
        }

        debug!("Retiring stream '{}' context {}", ctx.name(), handle);
        ctx.request_stop();

        let exited = match ctx.take_task() {
            Some(task) => match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!("Ingestion task for stream '{}' ended abnormally: {}", ctx.name(), e);
                    true
                }
                // Dropping the JoinHandle detaches the task; it is never aborted.
                Err(_) => false,
            },
            None => self.poll_thread_exited(handle, timeout, poll).await,
        };

        let forced = if exited {
            self.mark_thread_exited(handle);
            false
        } else {
            warn!(
                "Ingestion task for stream '{}' did not exit within {:?}; forcing reclamation",
                ctx.name(),
                timeout
            );
            self.force_thread_exited(handle);
            ctx.mark_connection_invalid();
            true
        };

        // Only reachable if the task is stuck outside a write; otherwise it already closed it.
        if let Some(mut writer) = ctx.writer().seal_and_take() {
            writer.close().await;
        }

        self.mark_freed(handle)?;
        info!("Stream '{}' context {} reclaimed{}", ctx.name(), handle, if forced { " (forced)" } else { "" });
        Ok(Retired { handle, forced })
    }

    async fn poll_thread_exited(&self, handle: ContextHandle, timeout: Duration, poll: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.thread_exited(handle) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}
