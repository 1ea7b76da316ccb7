//! Recursive remote → local tree synchronization.
//!
//! The remote side is the source of truth. Each directory pair is listed on
//! both sides and every remote entry gets a [`SyncDecision`]; nothing is
//! ever uploaded or deleted by this path.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{emit, SyncEvent};
use crate::gate::OperationGate;
use crate::policy::PathPolicy;
use crate::session::ConnectionSession;
use sitesync_common::{Error, RemotePath, Result};
use sitesync_transport::{EntryKind, RemoteEntry, Transport};

/// Remote modification times within this window of the local one count as
/// equal.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Skip,
    CreateLocalDir,
    DownloadFile,
}

/// Outcome of comparing one remote entry with its local counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    pub action: SyncAction,
    pub reason: &'static str,
}

impl SyncDecision {
    fn new(action: SyncAction, reason: &'static str) -> Self {
        Self { action, reason }
    }
}

/// What the local filesystem knows about one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
}

impl LocalEntry {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            is_dir: meta.is_dir(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            size: meta.len(),
        }
    }
}

/// Decide what to do with `remote` given the local state.
pub fn decide(remote: &RemoteEntry, local: Option<&LocalEntry>, tolerance: Duration) -> SyncDecision {
    use SyncAction::*;

    if remote.is_directory() {
        return match local {
            Some(l) if l.is_dir => SyncDecision::new(Skip, "directory exists"),
            _ => SyncDecision::new(CreateLocalDir, "directory missing locally"),
        };
    }

    let Some(local) = local else {
        return SyncDecision::new(DownloadFile, "missing locally");
    };
    if local.is_dir {
        return SyncDecision::new(Skip, "local path is a directory");
    }
    let Some(remote_time) = remote.modified else {
        return SyncDecision::new(DownloadFile, "remote time unknown");
    };
    let Some(local_time) = local.modified else {
        return SyncDecision::new(DownloadFile, "local time unknown");
    };

    let tolerance = chrono::Duration::from_std(tolerance).unwrap_or_else(|_| chrono::Duration::zero());
    if remote_time - local_time > tolerance {
        return SyncDecision::new(DownloadFile, "remote is newer");
    }
    if remote.size != local.size {
        return SyncDecision::new(DownloadFile, "size differs");
    }
    SyncDecision::new(Skip, "up to date")
}

/// Counters of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub directories_created: usize,
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub duration: Duration,
}

/// Pulls remote subtrees down to the workspace.
pub struct TreeSyncEngine {
    /// Connection used for listings and downloads.
    session: Arc<ConnectionSession>,
    /// Path mapping and ignore rules.
    policy: Arc<PathPolicy>,
    /// Held for a whole run; also pauses upload draining.
    gate: OperationGate,
    events: broadcast::Sender<SyncEvent>,
    tolerance: Duration,
}

impl TreeSyncEngine {
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
            tolerance: MTIME_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn busy() -> Error {
        Error::Busy("A sync or download is already running".to_string())
    }

    fn remote_for(&self, local: &Path) -> Result<RemotePath> {
        let remote = self.policy.remote_path(local).ok_or_else(|| {
            Error::InvalidInput(format!("{} is outside the workspace", local.display()))
        })?;
        if self.policy.is_ignored(local) {
            return Err(Error::InvalidInput(format!(
                "{} is excluded by ignore rules",
                local.display()
            )));
        }
        Ok(remote)
    }

    /// Sync the workspace directory `local_dir` from its remote counterpart.
    pub async fn sync_folder(&self, local_dir: &Path) -> Result<SyncReport> {
        let remote = self.remote_for(local_dir)?;
        self.sync_tree(local_dir, &remote).await
    }

    /// Sync `local_dir` from `remote_dir`.
    ///
    /// # Errors
    /// - `Busy` if another sync or download is running
    /// - Connection failures, including a connection lost mid-traversal;
    ///   files already written stay in place
    /// - Failure to create `local_dir`
    pub async fn sync_tree(&self, local_dir: &Path, remote_dir: &RemotePath) -> Result<SyncReport> {
        let _guard = self.gate.try_acquire().ok_or_else(Self::busy)?;
        let _transport = self.gate.lock_transport().await;
        self.session.ensure_connected().await?;

        info!(local = %local_dir.display(), remote = %remote_dir, "Starting sync");
        let started = Instant::now();
        let mut report = SyncReport::default();
        let result = self.sync_dir(local_dir, remote_dir, 0, &mut report).await;
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    "Sync completed: {} downloaded, {} skipped, {} failed, {} directories created",
                    report.files_downloaded,
                    report.files_skipped,
                    report.files_failed,
                    report.directories_created
                );
                emit(
                    &self.events,
                    SyncEvent::SyncFinished {
                        report: report.clone(),
                    },
                );
                Ok(report)
            }
            Err(err) => {
                warn!(
                    downloaded = report.files_downloaded,
                    "Sync aborted: {}", err
                );
                Err(err)
            }
        }
    }

    fn sync_dir<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a RemotePath,
        depth: usize,
        report: &'a mut SyncReport,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            // Liveness is re-checked at every level.
            let transport = self.session.transport()?;

            let entries = match transport.list(remote).await {
                Ok(entries) => entries,
                Err(err) if err.is_not_found() => {
                    debug!(remote = %remote, "Remote directory absent, nothing to sync");
                    return Ok(());
                }
                Err(err) => {
                    self.session.handle_error(&err);
                    if depth == 0 || !self.session.is_live() {
                        return Err(err);
                    }
                    warn!(remote = %remote, "Cannot list directory, skipping: {}", err);
                    report.files_failed += 1;
                    return Ok(());
                }
            };

            tokio::fs::create_dir_all(local).await?;
            let locals = self.local_entries(local).await?;

            for entry in entries {
                let child_local = local.join(&entry.name);
                if self.policy.is_ignored(&child_local) {
                    continue;
                }
                if matches!(entry.kind, EntryKind::Symlink | EntryKind::Other) {
                    debug!(name = %entry.name, "Skipping non-regular remote entry");
                    continue;
                }
                let child_remote = match remote.join(&entry.name) {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(name = %entry.name, "Skipping remote entry: {}", err);
                        continue;
                    }
                };

                let existing = locals.get(&entry.name);
                let decision = decide(&entry, existing, self.tolerance);
                debug!(
                    remote = %child_remote,
                    action = ?decision.action,
                    reason = decision.reason,
                    "Compared"
                );

                if entry.is_directory() {
                    if decision.action == SyncAction::CreateLocalDir {
                        if let Err(err) = tokio::fs::create_dir_all(&child_local).await {
                            warn!(
                                local = %child_local.display(),
                                "Cannot create directory, skipping subtree: {}",
                                err
                            );
                            report.files_failed += 1;
                            continue;
                        }
                        report.directories_created += 1;
                    }
                    self.sync_dir(&child_local, &child_remote, depth + 1, report)
                        .await?;
                    continue;
                }

                match decision.action {
                    SyncAction::DownloadFile => {
                        self.fetch(&transport, &child_local, &child_remote, report)
                            .await?
                    }
                    _ => {
                        if existing.is_some_and(|l| l.is_dir) {
                            warn!(
                                local = %child_local.display(),
                                "Remote file collides with a local directory, skipping"
                            );
                        }
                        report.files_skipped += 1;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn local_entries(&self, dir: &Path) -> Result<HashMap<String, LocalEntry>> {
        let mut entries = HashMap::new();
        let mut reader = tokio::fs::read_dir(dir).await?;
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %dir.display(), "Directory listing interrupted: {}", err);
                    break;
                }
            };
            let path = entry.path();
            if self.policy.is_ignored(&path) {
                continue;
            }
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    entries.insert(name, LocalEntry::from_metadata(&meta));
                }
                Err(err) => warn!(path = %path.display(), "Cannot stat, skipping: {}", err),
            }
        }
        Ok(entries)
    }

    /// Download one file; only a lost connection is an error.
    async fn fetch(
        &self,
        transport: &Arc<dyn Transport>,
        local: &Path,
        remote: &RemotePath,
        report: &mut SyncReport,
    ) -> Result<()> {
        match transport.download_to(local, remote).await {
            Ok(()) => {
                debug!(remote = %remote, "Downloaded");
                report.files_downloaded += 1;
                emit(
                    &self.events,
                    SyncEvent::Downloaded {
                        local: local.to_path_buf(),
                        remote: remote.clone(),
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.session.handle_error(&err);
                if !self.session.is_live() {
                    return Err(err);
                }
                warn!(remote = %remote, "Download failed, continuing: {}", err);
                report.files_failed += 1;
                Ok(())
            }
        }
    }

    /// Download a single workspace file from its remote counterpart.
    ///
    /// Holds the same exclusivity as a sync.
    pub async fn download_file(&self, local: &Path) -> Result<()> {
        let remote = self.remote_for(local)?;
        let _guard = self.gate.try_acquire().ok_or_else(Self::busy)?;
        let _transport = self.gate.lock_transport().await;
        let transport = self.session.ensure_connected().await?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = transport.download_to(local, &remote).await {
            self.session.handle_error(&err);
            return Err(err);
        }

        info!(local = %local.display(), remote = %remote, "Downloaded");
        emit(
            &self.events,
            SyncEvent::Downloaded {
                local: local.to_path_buf(),
                remote,
            },
        );
        Ok(())
    }
}
