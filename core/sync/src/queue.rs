//! Ordered upload queue with bounded retry and single-flight draining.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{emit, SyncEvent};
use crate::gate::OperationGate;
use crate::policy::PathPolicy;
use crate::session::{ConnectionSession, ErrorClass};
use sitesync_common::{Error, RemotePath, Result};

/// Attempts after the first failure before a task is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Pause before retrying a failed task.
pub const RETRY_DELAY: Duration = Duration::from_millis(2500);

/// One pending upload. Identity is `local_path`.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub retry_count: u32,
    pub enqueued_at: Instant,
}

/// Result of [`TransferQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The path is already waiting; its position is kept.
    AlreadyQueued,
    OutsideWorkspace,
    Ignored,
    /// Missing or not a regular file.
    NotAFile,
}

impl EnqueueOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued | Self::AlreadyQueued)
    }
}

/// Serializes uploads over the session's transport.
///
/// Tasks are taken from the head. A task failing with a transient error
/// while the connection stays open goes back to the head, so it is retried
/// before anything queued behind it.
pub struct TransferQueue {
    session: Arc<ConnectionSession>,
    policy: Arc<PathPolicy>,
    gate: OperationGate,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<VecDeque<TransferTask>>,
    draining: AtomicBool,
    max_retries: u32,
    retry_delay: Duration,
}

impl TransferQueue {
    pub fn new(
        session: Arc<ConnectionSession>,
        policy: Arc<PathPolicy>,
        gate: OperationGate,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            session,
            policy,
            gate,
            events,
            tasks: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub(crate) fn gate(&self) -> &OperationGate {
        &self.gate
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<TransferTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Snapshot of the pending tasks, head first.
    pub fn pending(&self) -> Vec<TransferTask> {
        self.tasks().iter().cloned().collect()
    }

    /// Drop every pending task.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.tasks()).len();
        if dropped > 0 {
            debug!(dropped, "Cleared transfer queue");
        }
    }

    /// Queue `local` for upload to its mapped remote path.
    ///
    /// Draining starts right away when the connection is live; otherwise a
    /// connection attempt is requested and draining resumes once it
    /// succeeds.
    pub fn enqueue(self: &Arc<Self>, local: &Path) -> EnqueueOutcome {
        let Some(remote_path) = self.policy.remote_path(local) else {
            debug!(path = %local.display(), "Not in workspace, not queued");
            return EnqueueOutcome::OutsideWorkspace;
        };
        if self.policy.is_ignored(local) {
            debug!(path = %local.display(), "Ignored, not queued");
            return EnqueueOutcome::Ignored;
        }
        if !local.is_file() {
            debug!(path = %local.display(), "Not a file, not queued");
            return EnqueueOutcome::NotAFile;
        }

        {
            let mut tasks = self.tasks();
            if tasks.iter().any(|t| t.local_path == local) {
                return EnqueueOutcome::AlreadyQueued;
            }
            tasks.push_back(TransferTask {
                local_path: local.to_path_buf(),
                remote_path,
                retry_count: 0,
                enqueued_at: Instant::now(),
            });
        }
        debug!(path = %local.display(), "Queued for upload");

        if self.session.is_live() {
            self.kick();
        } else {
            self.session.request_connect();
        }
        EnqueueOutcome::Queued
    }

    /// Start a drain unless one is running or an exclusive operation holds
    /// the gate.
    pub fn kick(self: &Arc<Self>) {
        if self.gate.is_busy() || self.is_empty() {
            return;
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    /// Resume draining whenever the session connects or the gate is
    /// released. Runs until the returned task is aborted.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.events.subscribe();
        let mut gate = self.gate.subscribe();
        let queue = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SyncEvent::Connected { .. }) | Err(RecvError::Lagged(_)) => {}
                        Ok(_) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *gate.borrow_and_update() {
                            continue;
                        }
                    }
                }
                match queue.upgrade() {
                    Some(queue) => queue.kick(),
                    None => break,
                }
            }
        })
    }

    async fn drain(self: Arc<Self>) {
        loop {
            self.drain_pass().await;
            self.draining.store(false, Ordering::SeqCst);

            // An enqueue may have raced the flag reset.
            let resume = !self.is_empty() && self.session.is_live() && !self.gate.is_busy();
            if !resume || self.draining.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn drain_pass(&self) {
        loop {
            if self.gate.is_busy() {
                debug!("Exclusive operation running, pausing uploads");
                return;
            }
            if !self.session.is_live() {
                self.session.request_connect();
                return;
            }
            let slot = self.gate.lock_transport().await;
            // A sync may have taken the flag while this waited.
            if self.gate.is_busy() {
                debug!("Exclusive operation running, pausing uploads");
                return;
            }
            let Some(task) = self.tasks().pop_front() else {
                return;
            };

            let result = self.transfer(&task).await;
            drop(slot);
            match result {
                Ok(()) => {
                    info!(
                        local = %task.local_path.display(),
                        remote = %task.remote_path,
                        "Uploaded"
                    );
                    emit(
                        &self.events,
                        SyncEvent::Uploaded {
                            local: task.local_path,
                            remote: task.remote_path,
                        },
                    );
                }
                Err(err) => {
                    if !self.handle_failure(task, err).await {
                        return;
                    }
                }
            }
        }
    }

    async fn transfer(&self, task: &TransferTask) -> Result<()> {
        if !tokio::fs::try_exists(&task.local_path).await.unwrap_or(false) {
            return Err(Error::Vanished(task.local_path.display().to_string()));
        }
        let transport = self.session.transport()?;
        if let Some(parent) = task.remote_path.parent() {
            transport.ensure_dir(&parent).await?;
        }
        transport.upload_from(&task.local_path, &task.remote_path).await
    }

    /// Requeue or drop a failed task. Returns whether draining may go on.
    async fn handle_failure(&self, mut task: TransferTask, err: Error) -> bool {
        if let Error::Vanished(_) = err {
            warn!(local = %task.local_path.display(), "File vanished before upload");
            self.fail(task, &err);
            return true;
        }

        let class = self.session.handle_error(&err);
        let closed = self.session.transport_closed();

        if class == ErrorClass::Transient && !closed && task.retry_count < self.max_retries {
            task.retry_count += 1;
            warn!(
                local = %task.local_path.display(),
                retry = task.retry_count,
                max = self.max_retries,
                "Upload failed, retrying: {}",
                err
            );
            self.tasks().push_front(task);
            tokio::time::sleep(self.retry_delay).await;
            return true;
        }

        self.fail(task, &err);
        // A dead session was handed to the reconnect timer by handle_error.
        !closed
    }

    fn fail(&self, task: TransferTask, err: &Error) {
        error!(
            local = %task.local_path.display(),
            retries = task.retry_count,
            "Upload failed: {}",
            err
        );
        emit(
            &self.events,
            SyncEvent::UploadFailed {
                local: task.local_path,
                error: err.to_string(),
            },
        );
    }
}
