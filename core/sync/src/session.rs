//! Connection lifecycle for the single transport session.
//!
//! States: `Disconnected` → `Connecting` → `Connected`. A failed attempt or a
//! lost connection goes back to `Disconnected` and arms a reconnect timer
//! with a flat delay. An intentional [`ConnectionSession::disconnect`] never
//! re-arms it.

use chrono::Utc;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{emit, ConnectionStatus, SyncEvent};
use sitesync_common::{Error, Result, SiteConfig};
use sitesync_transport::Transport;

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How an error affects the connection and the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection is gone or unusable; reconnect.
    Transient,
    /// Harmless for the caller's purpose (deleting something already absent).
    Benign,
    /// Surface to the caller; no retry, no reconnect.
    Fatal,
}

/// Classify a transport error.
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        // service closing, data connection failures, not logged in
        Error::Reply {
            code: 421 | 425 | 426 | 530,
            ..
        } => ErrorClass::Transient,
        Error::Network { kind, .. }
            if matches!(
                kind,
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            ErrorClass::Transient
        }
        Error::NotConnected(_) => ErrorClass::Transient,
        Error::NotFound(_) => ErrorClass::Benign,
        _ => ErrorClass::Fatal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owner of the single logical transport connection.
pub struct ConnectionSession {
    transport: Arc<dyn Transport>,
    config: Arc<SiteConfig>,
    state: Mutex<SessionState>,
    /// Bumped by `disconnect` so an in-flight handshake knows it lost.
    epoch: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<SyncEvent>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    auto_reconnect: AtomicBool,
    reconnect_delay: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<SiteConfig>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            transport,
            config,
            state: Mutex::new(SessionState::Disconnected),
            epoch: AtomicU64::new(0),
            status,
            events,
            reconnect: Mutex::new(None),
            auto_reconnect: AtomicBool::new(true),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn config(&self) -> &Arc<SiteConfig> {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Connected and the transport has not noticed a dead socket.
    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Connected && !self.transport.is_closed()
    }

    /// Whether the underlying transport reports itself closed.
    pub fn transport_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// The transport, if the connection is live.
    ///
    /// # Errors
    /// - `NotConnected` otherwise
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        if self.is_live() {
            Ok(Arc::clone(&self.transport))
        } else {
            Err(Error::NotConnected(format!(
                "No live connection to {}",
                self.config.host
            )))
        }
    }

    /// Open the connection.
    ///
    /// Performs the handshake and one verification listing of the remote
    /// root. Idempotent while connected; rejected while another attempt is
    /// in progress.
    ///
    /// # Errors
    /// - `Busy` if a connection attempt is already running
    /// - Any transport error of the handshake (a reconnect is scheduled)
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let epoch = {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Connecting => {
                    return Err(Error::Busy(
                        "Connection attempt already in progress".to_string(),
                    ))
                }
                SessionState::Connected if !self.transport.is_closed() => return Ok(()),
                _ => {}
            }
            *state = SessionState::Connecting;
            // State and status change together, under the same lock.
            self.status.send_modify(|s| {
                s.connected = false;
                s.connecting = true;
                s.error = None;
            });
            self.epoch.load(Ordering::SeqCst)
        };
        self.auto_reconnect.store(true, Ordering::SeqCst);
        self.cancel_reconnect();

        let host = self.config.host.clone();
        emit(&self.events, SyncEvent::Connecting { host: host.clone() });
        info!(host = %host, protocol = %self.config.protocol, "Connecting");

        let result = self.handshake().await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            if result.is_ok() {
                self.transport.close().await;
            }
            return Err(Error::NotConnected(
                "Disconnected while connecting".to_string(),
            ));
        }

        match result {
            Ok(()) => {
                let now = Utc::now();
                {
                    let mut state = lock(&self.state);
                    *state = SessionState::Connected;
                    self.status.send_modify(|s| {
                        s.connected = true;
                        s.connecting = false;
                        s.error = None;
                        s.last_connected = Some(now);
                        s.host = Some(host.clone());
                    });
                }
                info!(host = %host, "Connected");
                emit(&self.events, SyncEvent::Connected { host });
                Ok(())
            }
            Err(err) => {
                self.transport.close().await;
                {
                    let mut state = lock(&self.state);
                    *state = SessionState::Disconnected;
                    self.status.send_modify(|s| {
                        s.connected = false;
                        s.connecting = false;
                        s.error = Some(err.to_string());
                    });
                }
                warn!(host = %host, "Connection failed: {}", err);
                emit(
                    &self.events,
                    SyncEvent::ConnectionFailed {
                        host,
                        error: err.to_string(),
                    },
                );
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        let limit = Duration::from_secs(self.config.connect_timeout_secs);
        let attempt = async {
            self.transport.connect(&self.config).await?;
            self.transport.list(&self.config.remote_root()).await?;
            Ok(())
        };
        tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| Error::Network {
                kind: ErrorKind::TimedOut,
                message: format!("Connecting to {} timed out", self.config.host),
            })?
    }

    /// Start a connection attempt in the background unless one is running
    /// or the connection is already live.
    pub fn request_connect(self: &Arc<Self>) {
        if self.state() == SessionState::Connecting || self.is_live() {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _ = session.connect().await;
        });
    }

    /// Return the live transport, connecting first if necessary.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<Arc<dyn Transport>> {
        if self.is_live() {
            return Ok(Arc::clone(&self.transport));
        }
        if self.state() == SessionState::Connecting {
            let mut status = self.status.subscribe();
            let _ = status.wait_for(|s| !s.connecting).await;
        } else {
            self.connect().await?;
        }
        self.transport()
    }

    /// Classify `err` and react to it.
    ///
    /// Transient errors, and any error after which the transport reports
    /// itself closed, drop the session to `Disconnected` and arm a
    /// reconnect.
    pub fn handle_error(self: &Arc<Self>, err: &Error) -> ErrorClass {
        let class = classify(err);
        if class == ErrorClass::Transient || self.transport.is_closed() {
            self.mark_lost(err);
        }
        class
    }

    fn mark_lost(self: &Arc<Self>, err: &Error) {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            if previous != SessionState::Connecting {
                *state = SessionState::Disconnected;
            }
            previous
        };

        match previous {
            // The running attempt decides the outcome.
            SessionState::Connecting => return,
            SessionState::Connected => {
                self.status.send_modify(|s| {
                    s.connected = false;
                    s.error = Some(err.to_string());
                });
                warn!("Connection lost: {}", err);
                emit(
                    &self.events,
                    SyncEvent::Disconnected {
                        error: Some(err.to_string()),
                    },
                );
            }
            SessionState::Disconnected => {}
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = lock(&self.reconnect);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let session = Arc::downgrade(self);
        let delay = self.reconnect_delay;
        debug!("Reconnecting in {:?}", delay);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            // Detach first so `connect` does not abort this task.
            lock(&session.reconnect).take();
            if session.state() == SessionState::Disconnected
                && session.auto_reconnect.load(Ordering::SeqCst)
            {
                let _ = session.connect().await;
            }
        }));
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = lock(&self.reconnect).take() {
            handle.abort();
        }
    }

    /// Whether a reconnect timer is armed.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.reconnect)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Close the connection on purpose; no reconnect follows.
    pub async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.cancel_reconnect();

        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Disconnected);
        self.transport.close().await;
        self.status.send_modify(|s| {
            s.connected = false;
            s.connecting = false;
        });
        if previous != SessionState::Disconnected {
            info!(host = %self.config.host, "Disconnected");
            emit(&self.events, SyncEvent::Disconnected { error: None });
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}
