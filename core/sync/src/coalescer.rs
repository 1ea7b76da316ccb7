//! Debounced watcher events and immediate save triggers.
//!
//! Create/change events restart a per-path timer; only the last event of a
//! burst reaches the queue. A save bypasses the timer and cancels it.
//! Deletes go straight to the transport, best effort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::events::{emit, SyncEvent};
use crate::policy::PathPolicy;
use crate::queue::{EnqueueOutcome, TransferQueue};
use crate::session::{ConnectionSession, ErrorClass};
use sitesync_common::{Error, Result, SiteConfig};

/// Quiet period before a changed file is queued.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
}

/// A raw file-system notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir: false,
        }
    }

    pub fn dir(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir: true,
        }
    }
}

struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

type Timers = Arc<Mutex<HashMap<PathBuf, PendingTimer>>>;

fn lock(timers: &Timers) -> MutexGuard<'_, HashMap<PathBuf, PendingTimer>> {
    timers.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ChangeCoalescer {
    queue: Arc<TransferQueue>,
    session: Arc<ConnectionSession>,
    policy: Arc<PathPolicy>,
    config: Arc<SiteConfig>,
    events: broadcast::Sender<SyncEvent>,
    timers: Timers,
    generation: AtomicU64,
    stopped: AtomicBool,
    debounce: Duration,
}

impl ChangeCoalescer {
    pub fn new(
        queue: Arc<TransferQueue>,
        session: Arc<ConnectionSession>,
        policy: Arc<PathPolicy>,
        config: Arc<SiteConfig>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            queue,
            session,
            policy,
            config,
            events,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            debounce: DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Number of armed debounce timers.
    pub fn pending_timers(&self) -> usize {
        lock(&self.timers).len()
    }

    /// React to a watcher notification.
    pub fn on_event(self: &Arc<Self>, event: WatchEvent) {
        if self.stopped.load(Ordering::SeqCst) || !self.policy.is_watched(&event.path) {
            return;
        }
        let watcher = &self.config.watcher;

        match event.kind {
            ChangeKind::Created | ChangeKind::Changed => {
                let disabled = match event.kind {
                    ChangeKind::Created => watcher.ignore_create,
                    _ => watcher.ignore_update,
                };
                if !watcher.auto_upload || disabled || event.is_dir {
                    return;
                }
                self.schedule(event.path);
            }
            ChangeKind::Deleted => {
                self.cancel(&event.path);
                if !watcher.auto_delete || watcher.ignore_delete {
                    return;
                }
                let coalescer = Arc::clone(self);
                tokio::spawn(async move {
                    // Outcome is logged inside.
                    let _ = coalescer.delete_remote(&event.path, event.is_dir).await;
                });
            }
        }
    }

    /// Queue a saved file immediately, superseding any pending timer.
    pub fn on_save(&self, path: &Path) -> EnqueueOutcome {
        if !self.config.upload_on_save {
            return EnqueueOutcome::Ignored;
        }
        self.cancel(path);
        self.queue.enqueue(path)
    }

    fn schedule(&self, path: PathBuf) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let timers = Arc::clone(&self.timers);
        let queue = Arc::clone(&self.queue);
        let delay = self.debounce;
        let key = path.clone();

        let mut pending = lock(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = lock(&timers);
                match pending.get(&path) {
                    Some(timer) if timer.generation == generation => {
                        pending.remove(&path);
                    }
                    // Superseded
                    _ => return,
                }
            }
            queue.enqueue(&path);
        });
        if let Some(previous) = pending.insert(
            key,
            PendingTimer {
                generation,
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    fn cancel(&self, path: &Path) {
        if let Some(timer) = lock(&self.timers).remove(path) {
            timer.handle.abort();
            debug!(path = %path.display(), "Cancelled pending upload timer");
        }
    }

    /// Delete the remote counterpart of `local`.
    ///
    /// A remote path that is already gone counts as success.
    pub async fn delete_remote(&self, local: &Path, is_dir: bool) -> Result<()> {
        let remote = self.policy.remote_path(local).ok_or_else(|| {
            Error::InvalidInput(format!("{} is outside the workspace", local.display()))
        })?;

        let result = async {
            let _slot = self.queue.gate().lock_transport().await;
            let transport = self.session.ensure_connected().await?;
            if is_dir {
                transport.remove_dir(&remote).await
            } else {
                transport.remove(&remote).await
            }
        }
        .await;

        match result {
            Ok(()) => {
                info!(remote = %remote, "Deleted");
                emit(&self.events, SyncEvent::Deleted { remote });
                Ok(())
            }
            Err(err) => match self.session.handle_error(&err) {
                ErrorClass::Benign => {
                    debug!(remote = %remote, "Already absent remotely");
                    emit(&self.events, SyncEvent::Deleted { remote });
                    Ok(())
                }
                _ => {
                    warn!(remote = %remote, "Delete failed: {}", err);
                    Err(err)
                }
            },
        }
    }

    /// Cancel every pending timer without firing it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let timers: Vec<_> = lock(&self.timers).drain().collect();
        for (_, timer) in &timers {
            timer.handle.abort();
        }
        if !timers.is_empty() {
            debug!(cancelled = timers.len(), "Stopped change coalescer");
        }
    }
}

impl Drop for ChangeCoalescer {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::gate::{OperationGate, OperationGuard};
    use chrono::Utc;
    use sitesync_common::Protocol;
    use sitesync_transport::{MemoryTransport, Operation};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        transport: Arc<MemoryTransport>,
        queue: Arc<TransferQueue>,
        coalescer: Arc<ChangeCoalescer>,
        _hold: OperationGuard,
    }

    fn fixture(configure: impl FnOnce(&mut SiteConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SiteConfig::new("example.com", Protocol::Ftp);
        config.watcher.auto_upload = true;
        config.watcher.auto_delete = true;
        configure(&mut config);
        let config = Arc::new(config);

        let transport = Arc::new(MemoryTransport::new());
        let events = events::channel();
        let session = Arc::new(ConnectionSession::new(
            transport.clone(),
            config.clone(),
            events.clone(),
        ));
        let policy = Arc::new(PathPolicy::new(dir.path(), &config));
        // Hold uploads so queue contents stay observable.
        let gate = OperationGate::new();
        let hold = gate.try_acquire().unwrap();
        let queue = Arc::new(TransferQueue::new(
            session.clone(),
            policy.clone(),
            gate,
            events.clone(),
        ));
        let coalescer = Arc::new(ChangeCoalescer::new(
            queue.clone(),
            session,
            policy,
            config,
            events,
        ));
        Fixture {
            dir,
            transport,
            queue,
            coalescer,
            _hold: hold,
        }
    }

    impl Fixture {
        fn file(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, name).unwrap();
            path
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_single_enqueue() {
        let fx = fixture(|_| {});
        let path = fx.file("index.html");

        for _ in 0..5 {
            fx.coalescer
                .on_event(WatchEvent::new(&path, ChangeKind::Changed));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(fx.queue.is_empty());
        assert_eq!(fx.coalescer.pending_timers(), 1);

        tokio::time::sleep(DEBOUNCE).await;
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.coalescer.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_cancels_pending_timer() {
        let fx = fixture(|_| {});
        let path = fx.file("app.js");

        fx.coalescer
            .on_event(WatchEvent::new(&path, ChangeKind::Changed));
        assert_eq!(fx.coalescer.on_save(&path), EnqueueOutcome::Queued);
        assert_eq!(fx.coalescer.pending_timers(), 0);
        assert_eq!(fx.queue.len(), 1);

        // The cancelled timer never fires a second enqueue.
        tokio::time::sleep(DEBOUNCE * 3).await;
        assert_eq!(fx.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_disabled() {
        let fx = fixture(|c| c.upload_on_save = false);
        let path = fx.file("a.txt");
        assert_eq!(fx.coalescer.on_save(&path), EnqueueOutcome::Ignored);
        assert!(fx.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_outside_workspace() {
        let fx = fixture(|_| {});
        let other = tempfile::tempdir().unwrap();
        let path = other.path().join("x.txt");
        std::fs::write(&path, "x").unwrap();

        assert_eq!(fx.coalescer.on_save(&path), EnqueueOutcome::OutsideWorkspace);
        assert!(fx.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_filters() {
        let fx = fixture(|c| {
            c.watcher.ignore_create = true;
            c.ignore = vec!["*.bak".to_string()];
        });
        let created = fx.file("new.txt");
        let ignored = fx.file("old.bak");
        let outside = PathBuf::from("/definitely/elsewhere.txt");

        fx.coalescer
            .on_event(WatchEvent::new(&created, ChangeKind::Created));
        fx.coalescer
            .on_event(WatchEvent::new(&ignored, ChangeKind::Changed));
        fx.coalescer
            .on_event(WatchEvent::new(&outside, ChangeKind::Changed));
        fx.coalescer
            .on_event(WatchEvent::dir(fx.dir.path().join("sub"), ChangeKind::Created));

        assert_eq!(fx.coalescer.pending_timers(), 0);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(fx.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_upload_off() {
        let fx = fixture(|c| c.watcher.auto_upload = false);
        let path = fx.file("a.txt");
        fx.coalescer
            .on_event(WatchEvent::new(&path, ChangeKind::Changed));
        assert_eq!(fx.coalescer.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_without_firing() {
        let fx = fixture(|_| {});
        let a = fx.file("a.txt");
        let b = fx.file("b.txt");
        fx.coalescer.on_event(WatchEvent::new(&a, ChangeKind::Changed));
        fx.coalescer.on_event(WatchEvent::new(&b, ChangeKind::Created));
        assert_eq!(fx.coalescer.pending_timers(), 2);

        fx.coalescer.stop();
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(fx.queue.is_empty());

        fx.coalescer.on_event(WatchEvent::new(&a, ChangeKind::Changed));
        assert_eq!(fx.coalescer.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_missing_remote_is_success() {
        let fx = fixture(|_| {});
        let path = fx.dir.path().join("ghost.txt");

        fx.coalescer.delete_remote(&path, false).await.unwrap();
        assert_eq!(fx.transport.calls(Operation::Remove), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_event_removes_remote() {
        let fx = fixture(|_| {});
        fx.transport.put_file("/gone.txt", "g", Utc::now());
        fx.transport.put_file("/assets/logo.png", "p", Utc::now());

        fx.coalescer
            .on_event(WatchEvent::new(fx.dir.path().join("gone.txt"), ChangeKind::Deleted));
        fx.coalescer
            .on_event(WatchEvent::dir(fx.dir.path().join("assets"), ChangeKind::Deleted));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!fx.transport.exists("/gone.txt"));
        assert!(!fx.transport.exists("/assets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_respects_config() {
        let fx = fixture(|c| c.watcher.ignore_delete = true);
        fx.transport.put_file("/keep.txt", "k", Utc::now());

        fx.coalescer
            .on_event(WatchEvent::new(fx.dir.path().join("keep.txt"), ChangeKind::Deleted));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fx.transport.exists("/keep.txt"));
        assert_eq!(fx.transport.calls(Operation::Connect), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_is_reported() {
        let fx = fixture(|_| {});
        fx.transport.put_file("/locked.txt", "l", Utc::now());
        fx.transport.fail_next(
            Operation::Remove,
            Error::PermissionDenied("locked".to_string()),
        );

        let result = fx
            .coalescer
            .delete_remote(&fx.dir.path().join("locked.txt"), false)
            .await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert!(fx.transport.exists("/locked.txt"));
    }
}
