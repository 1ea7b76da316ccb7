//! Status and progress notifications published by the core.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::engine::SyncReport;
use sitesync_common::RemotePath;

/// Capacity of the notification channel.
const EVENT_CAPACITY: usize = 256;

/// Snapshot of the connection state.
///
/// `connected` and `connecting` are never both true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub host: Option<String>,
}

/// Notification for whoever renders status (CLI output, an editor, ...).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connecting { host: String },
    Connected { host: String },
    ConnectionFailed { host: String, error: String },
    Disconnected { error: Option<String> },
    Uploaded { local: PathBuf, remote: RemotePath },
    /// Terminal failure; the task has left the queue.
    UploadFailed { local: PathBuf, error: String },
    Deleted { remote: RemotePath },
    Downloaded { local: PathBuf, remote: RemotePath },
    SyncFinished { report: SyncReport },
}

/// Create the notification channel shared by all components of a site.
pub fn channel() -> broadcast::Sender<SyncEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Publish without caring whether anyone listens.
pub(crate) fn emit(events: &broadcast::Sender<SyncEvent>, event: SyncEvent) {
    let _ = events.send(event);
}
