//! Transport trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use sitesync_common::{RemotePath, Result, SiteConfig};

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Name of the entry, without any directory part.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, when the server reports one.
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Remote file-transfer connection.
///
/// A transport object wraps at most one live protocol session. `connect`
/// replaces a dead session with a new one; callers are responsible for not
/// issuing overlapping operations. Every operation on a closed transport
/// fails with `Error::NotConnected`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "ftp", "sftp", "memory").
    fn name(&self) -> &str;

    /// Open the session: socket handshake and authentication.
    ///
    /// # Postconditions
    /// - `is_closed()` returns false on success
    ///
    /// # Errors
    /// - Network errors while connecting
    /// - Authentication rejected
    async fn connect(&self, config: &SiteConfig) -> Result<()>;

    /// List the contents of a remote directory.
    ///
    /// # Errors
    /// - `NotFound` if the directory does not exist
    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>>;

    /// Upload the local file at `local` to `remote`, replacing it.
    ///
    /// # Preconditions
    /// - Parent directory of `remote` must exist
    async fn upload_from(&self, local: &Path, remote: &RemotePath) -> Result<()>;

    /// Download `remote` into the local file at `local`, replacing it.
    ///
    /// # Preconditions
    /// - Parent directory of `local` must exist
    async fn download_to(&self, local: &Path, remote: &RemotePath) -> Result<()>;

    /// Delete a remote file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    async fn remove(&self, path: &RemotePath) -> Result<()>;

    /// Delete a remote directory and everything below it.
    ///
    /// # Errors
    /// - `NotFound` if the directory does not exist
    async fn remove_dir(&self, path: &RemotePath) -> Result<()>;

    /// Create a remote directory and any missing parents.
    ///
    /// Succeeds if the directory already exists.
    async fn ensure_dir(&self, path: &RemotePath) -> Result<()>;

    /// Close the session. Never fails; errors while closing are ignored.
    async fn close(&self);

    /// Whether the session is closed (never opened, closed, or dropped).
    fn is_closed(&self) -> bool;
}
