//! Command loop owning the components of the configured site.
//!
//! Front ends talk to a [`ServiceHandle`]: each [`Command`] travels over an
//! mpsc channel together with a oneshot for the reply. Quick commands are
//! answered on the loop; syncs, downloads, connects and folder walks run in
//! their own tasks so saves keep flowing while they are in progress.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coalescer::{ChangeCoalescer, WatchEvent};
use crate::engine::{SyncReport, TreeSyncEngine};
use crate::events::{self, ConnectionStatus, SyncEvent};
use crate::gate::OperationGate;
use crate::policy::PathPolicy;
use crate::queue::{EnqueueOutcome, TransferQueue};
use crate::session::ConnectionSession;
use sitesync_common::{Error, Result, SiteConfig};
use sitesync_transport::TransportRegistry;

/// Requests accepted by the service.
///
/// Relative paths are resolved against the workspace root.
#[derive(Debug)]
pub enum Command {
    /// A file was saved in the editor.
    Save(PathBuf),
    /// A file-system watcher notification.
    Watch(WatchEvent),
    UploadFile(PathBuf),
    /// Queue every tracked file below a directory.
    UploadFolder(PathBuf),
    DownloadFile(PathBuf),
    SyncFolder(PathBuf),
    Connect,
    Disconnect,
    /// Replace the site configuration; `None` removes it.
    ApplyConfig(Option<SiteConfig>),
    Status,
    Shutdown,
}

#[derive(Debug)]
pub enum Response {
    Done,
    Enqueued(EnqueueOutcome),
    /// Number of files queued by a folder upload.
    Queued(usize),
    Synced(SyncReport),
    Status(ServiceStatus),
}

/// Snapshot returned by [`Command::Status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub site: Option<String>,
    pub connection: ConnectionStatus,
    pub queued: usize,
    pub busy: bool,
}

type Request = (Command, oneshot::Sender<Result<Response>>);

/// Components built for one configuration.
struct Site {
    config: Arc<SiteConfig>,
    session: Arc<ConnectionSession>,
    queue: Arc<TransferQueue>,
    coalescer: Arc<ChangeCoalescer>,
    engine: Arc<TreeSyncEngine>,
    policy: Arc<PathPolicy>,
    gate: OperationGate,
    /// Resumes queue draining on connect and gate release.
    drain_watch: JoinHandle<()>,
}

impl Site {
    fn build(
        workspace_root: &Path,
        config: SiteConfig,
        registry: &TransportRegistry,
        events: &broadcast::Sender<SyncEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = registry.resolve(&config)?;
        let config = Arc::new(config);

        let session = Arc::new(ConnectionSession::new(
            transport,
            config.clone(),
            events.clone(),
        ));
        let policy = Arc::new(PathPolicy::new(workspace_root, &config));
        let gate = OperationGate::new();
        let queue = Arc::new(TransferQueue::new(
            session.clone(),
            policy.clone(),
            gate.clone(),
            events.clone(),
        ));
        let coalescer = Arc::new(ChangeCoalescer::new(
            queue.clone(),
            session.clone(),
            policy.clone(),
            config.clone(),
            events.clone(),
        ));
        let engine = Arc::new(TreeSyncEngine::new(
            session.clone(),
            policy.clone(),
            gate.clone(),
            events.clone(),
        ));
        let drain_watch = queue.attach();

        Ok(Self {
            config,
            session,
            queue,
            coalescer,
            engine,
            policy,
            gate,
            drain_watch,
        })
    }

    async fn teardown(self) {
        self.coalescer.stop();
        self.queue.clear();
        self.drain_watch.abort();
        self.session.disconnect().await;
        debug!(site = %self.config.name, "Site torn down");
    }
}

enum Dispatch {
    Ready(Result<Response>),
    Deferred(BoxFuture<'static, Result<Response>>),
}

/// Owns the site components and serves [`Command`]s.
pub struct SyncService {
    workspace_root: PathBuf,
    registry: TransportRegistry,
    events: broadcast::Sender<SyncEvent>,
    site: Option<Site>,
}

impl SyncService {
    /// Create a service for `workspace_root` with no site configured.
    pub fn new(workspace_root: impl Into<PathBuf>, registry: TransportRegistry) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            registry,
            events: events::channel(),
            site: None,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run the command loop in a background task.
    pub fn spawn(self) -> ServiceHandle {
        let (request_tx, request_rx) = mpsc::channel(100);
        let handle = ServiceHandle {
            request_tx,
            events: self.events.clone(),
        };
        tokio::spawn(self.run(request_rx));
        handle
    }

    async fn run(mut self, mut request_rx: mpsc::Receiver<Request>) {
        info!(workspace = %self.workspace_root.display(), "Sync service started");

        while let Some((command, response_tx)) = request_rx.recv().await {
            if matches!(command, Command::Shutdown) {
                info!("Received shutdown request");
                self.apply_config(None).await.ok();
                let _ = response_tx.send(Ok(Response::Done));
                break;
            }

            debug!("Processing command: {:?}", command);
            match self.dispatch(command).await {
                Dispatch::Ready(result) => {
                    let _ = response_tx.send(result);
                }
                Dispatch::Deferred(work) => {
                    tokio::spawn(async move {
                        let _ = response_tx.send(work.await);
                    });
                }
            }
        }

        if let Some(site) = self.site.take() {
            site.teardown().await;
        }
        info!("Sync service stopped");
    }

    /// Execute one command to completion.
    pub async fn handle(&mut self, command: Command) -> Result<Response> {
        if matches!(command, Command::Shutdown) {
            self.apply_config(None).await?;
            return Ok(Response::Done);
        }
        match self.dispatch(command).await {
            Dispatch::Ready(result) => result,
            Dispatch::Deferred(work) => work.await,
        }
    }

    /// Replace the current site.
    ///
    /// The previous site is torn down first: pending uploads and debounce
    /// timers are discarded and its connection is closed.
    ///
    /// # Errors
    /// - `Config` if the new configuration is invalid
    /// - `Unsupported` if its protocol is not compiled in
    pub async fn apply_config(&mut self, config: Option<SiteConfig>) -> Result<()> {
        if let Some(site) = self.site.take() {
            site.teardown().await;
        }
        let Some(config) = config else {
            return Ok(());
        };

        let site = Site::build(&self.workspace_root, config, &self.registry, &self.events)?;
        info!(
            site = %site.config.name,
            host = %site.config.host,
            remote = %site.policy.remote_root(),
            "Site configured"
        );
        self.site = Some(site);
        Ok(())
    }

    fn site(&self) -> Result<&Site> {
        self.site
            .as_ref()
            .ok_or_else(|| Error::Config("No site configured".to_string()))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    async fn dispatch(&mut self, command: Command) -> Dispatch {
        use Dispatch::{Deferred, Ready};

        if let Command::ApplyConfig(config) = command {
            return Ready(self.apply_config(config).await.map(|()| Response::Done));
        }
        if let Command::Status = command {
            return Ready(Ok(Response::Status(self.status())));
        }

        let site = match self.site() {
            Ok(site) => site,
            Err(err) => return Ready(Err(err)),
        };

        match command {
            Command::Save(path) => {
                let path = self.resolve(&path);
                Ready(Ok(Response::Enqueued(site.coalescer.on_save(&path))))
            }
            Command::Watch(mut event) => {
                event.path = self.resolve(&event.path);
                site.coalescer.on_event(event);
                Ready(Ok(Response::Done))
            }
            Command::UploadFile(path) => {
                let path = self.resolve(&path);
                Ready(Ok(Response::Enqueued(site.queue.enqueue(&path))))
            }
            Command::UploadFolder(dir) => {
                let dir = self.resolve(&dir);
                let queue = site.queue.clone();
                let policy = site.policy.clone();
                Deferred(async move { upload_folder(queue, policy, dir).await }.boxed())
            }
            Command::DownloadFile(path) => {
                let path = self.resolve(&path);
                let engine = site.engine.clone();
                Deferred(
                    async move {
                        engine.download_file(&path).await?;
                        Ok(Response::Done)
                    }
                    .boxed(),
                )
            }
            Command::SyncFolder(dir) => {
                let dir = self.resolve(&dir);
                let engine = site.engine.clone();
                Deferred(
                    async move { engine.sync_folder(&dir).await.map(Response::Synced) }.boxed(),
                )
            }
            Command::Connect => {
                let session = site.session.clone();
                Deferred(
                    async move {
                        session.connect().await?;
                        Ok(Response::Done)
                    }
                    .boxed(),
                )
            }
            Command::Disconnect => {
                site.session.disconnect().await;
                Ready(Ok(Response::Done))
            }
            // Answered above.
            Command::ApplyConfig(_) | Command::Status | Command::Shutdown => Ready(Err(
                Error::InvalidInput("Command not handled by the site".to_string()),
            )),
        }
    }

    fn status(&self) -> ServiceStatus {
        match &self.site {
            Some(site) => ServiceStatus {
                site: Some(site.config.name.clone()),
                connection: site.session.status(),
                queued: site.queue.len(),
                busy: site.gate.is_busy(),
            },
            None => ServiceStatus {
                site: None,
                connection: ConnectionStatus::default(),
                queued: 0,
                busy: false,
            },
        }
    }
}

/// Queue every tracked file below `dir`.
async fn upload_folder(
    queue: Arc<TransferQueue>,
    policy: Arc<PathPolicy>,
    dir: PathBuf,
) -> Result<Response> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if !policy.is_tracked(&dir) {
        return Err(Error::InvalidInput(format!(
            "{} is outside the workspace or ignored",
            dir.display()
        )));
    }

    let walk_policy = policy.clone();
    let files = tokio::task::spawn_blocking(move || collect_files(&walk_policy, &dir))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    let queued = files
        .iter()
        .filter(|file| queue.enqueue(file).is_queued())
        .count();
    info!(files = files.len(), queued, "Folder upload queued");
    Ok(Response::Queued(queued))
}

/// Tracked regular files below `dir`, ignored subtrees pruned.
fn collect_files(policy: &PathPolicy, dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %current.display(), "Cannot read directory: {}", err);
                continue;
            }
        };
        let mut children: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        children.sort();

        for path in children {
            if policy.is_ignored(&path) {
                continue;
            }
            // Symlinks are followed by `is_dir`/`is_file`.
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files
}

/// Cloneable front door to a running [`SyncService`].
#[derive(Clone)]
pub struct ServiceHandle {
    request_tx: mpsc::Sender<Request>,
    events: broadcast::Sender<SyncEvent>,
}

impl ServiceHandle {
    /// Submit a command and wait for its reply.
    ///
    /// # Errors
    /// - `Stopped` if the service loop has exited
    /// - Whatever the command itself fails with
    pub async fn request(&self, command: Command) -> Result<Response> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((command, response_tx))
            .await
            .map_err(|_| Error::Stopped("Sync service not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Stopped("Sync service dropped the request".to_string()))?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Tear down the site and stop the loop.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::ChangeKind;
    use chrono::Utc;
    use sitesync_common::Protocol;
    use sitesync_transport::{MemoryTransport, Transport};
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(transport: Arc<MemoryTransport>) -> TransportRegistry {
        let mut registry = TransportRegistry::new();
        registry
            .register(
                Protocol::Ftp,
                Box::new(move |_| Ok(transport.clone() as Arc<dyn Transport>)),
            )
            .unwrap();
        registry
    }

    fn site_config() -> SiteConfig {
        let mut config = SiteConfig::new("example.com", Protocol::Ftp);
        config.name = "test".to_string();
        config.remote_path = "/www".to_string();
        config.watcher.auto_delete = true;
        config
    }

    async fn started() -> (TempDir, Arc<MemoryTransport>, ServiceHandle) {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.put_dir("/www");
        let handle = SyncService::new(dir.path(), registry(transport.clone())).spawn();
        handle
            .request(Command::ApplyConfig(Some(site_config())))
            .await
            .unwrap();
        (dir, transport, handle)
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("event not observed")
    }

    #[tokio::test]
    async fn test_commands_require_site() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let handle = SyncService::new(dir.path(), registry(transport)).spawn();

        let result = handle.request(Command::Save("a.txt".into())).await;
        assert!(matches!(result, Err(Error::Config(_))));

        match handle.request(Command::Status).await.unwrap() {
            Response::Status(status) => {
                assert!(status.site.is_none());
                assert!(!status.connection.connected);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_file_reaches_remote() {
        let (dir, transport, handle) = started().await;
        let mut events = handle.subscribe();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();

        let response = handle
            .request(Command::UploadFile("css/site.css".into()))
            .await
            .unwrap();
        assert!(matches!(response, Response::Enqueued(EnqueueOutcome::Queued)));

        wait_for(&mut events, |e| matches!(e, SyncEvent::Uploaded { .. })).await;
        assert_eq!(transport.file("/www/css/site.css").unwrap(), b"body{}");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_respects_upload_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.put_dir("/www");
        let handle = SyncService::new(dir.path(), registry(transport)).spawn();
        let mut config = site_config();
        config.upload_on_save = false;
        handle.request(Command::ApplyConfig(Some(config))).await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let response = handle.request(Command::Save("a.txt".into())).await.unwrap();
        assert!(matches!(response, Response::Enqueued(EnqueueOutcome::Ignored)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_folder_skips_ignored() {
        let (dir, transport, handle) = started().await;
        let mut events = handle.subscribe();
        let root = dir.path();
        std::fs::create_dir_all(root.join("js")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/lib")).unwrap();
        std::fs::write(root.join("index.html"), "<html>").unwrap();
        std::fs::write(root.join("js/app.js"), "let a;").unwrap();
        std::fs::write(root.join("node_modules/lib/x.js"), "x").unwrap();
        std::fs::write(root.join("debug.log"), "log").unwrap();

        let response = handle
            .request(Command::UploadFolder(root.to_path_buf()))
            .await
            .unwrap();
        assert!(matches!(response, Response::Queued(2)));

        let mut uploaded = 0;
        while uploaded < 2 {
            wait_for(&mut events, |e| matches!(e, SyncEvent::Uploaded { .. })).await;
            uploaded += 1;
        }
        assert!(transport.exists("/www/index.html"));
        assert!(transport.exists("/www/js/app.js"));
        assert!(!transport.exists("/www/node_modules"));
        assert!(!transport.exists("/www/debug.log"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_folder_reports() {
        let (dir, transport, handle) = started().await;
        let old = Utc::now() - chrono::Duration::hours(1);
        transport.put_file("/www/index.html", "<html>", old);
        transport.put_file("/www/img/logo.svg", "<svg/>", old);

        let response = handle
            .request(Command::SyncFolder(dir.path().to_path_buf()))
            .await
            .unwrap();
        match response {
            Response::Synced(report) => {
                assert_eq!(report.files_downloaded, 2);
                assert_eq!(report.directories_created, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(dir.path().join("img/logo.svg").is_file());

        handle
            .request(Command::DownloadFile("index.html".into()))
            .await
            .unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_delete_removes_remote() {
        let (dir, transport, handle) = started().await;
        let mut events = handle.subscribe();
        transport.put_file("/www/old.html", "x", Utc::now());

        handle
            .request(Command::Watch(WatchEvent::new(
                dir.path().join("old.html"),
                ChangeKind::Deleted,
            )))
            .await
            .unwrap();

        wait_for(&mut events, |e| matches!(e, SyncEvent::Deleted { .. })).await;
        assert!(!transport.exists("/www/old.html"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_and_status() {
        let (_dir, transport, handle) = started().await;

        handle.request(Command::Connect).await.unwrap();
        match handle.request(Command::Status).await.unwrap() {
            Response::Status(status) => {
                assert_eq!(status.site.as_deref(), Some("test"));
                assert!(status.connection.connected);
                assert_eq!(status.queued, 0);
                assert!(!status.busy);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        handle.request(Command::Disconnect).await.unwrap();
        assert!(transport.is_closed());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_replacing_config_closes_connection() {
        let (_dir, transport, handle) = started().await;
        handle.request(Command::Connect).await.unwrap();
        assert!(!transport.is_closed());

        handle.request(Command::ApplyConfig(None)).await.unwrap();
        assert!(transport.is_closed());
        let result = handle.request(Command::Connect).await;
        assert!(matches!(result, Err(Error::Config(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let (_dir, _transport, handle) = started().await;
        let mut config = site_config();
        config.protocol = Protocol::Sftp;

        let result = handle.request(Command::ApplyConfig(Some(config))).await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let (_dir, _transport, handle) = started().await;
        handle.shutdown().await;

        let result = handle.request(Command::Status).await;
        assert!(matches!(result, Err(Error::Stopped(_))));
    }
}
