//! SFTP transport on libssh2.
//!
//! libssh2 is blocking, so every operation runs on the blocking pool with
//! the session behind a std mutex.

use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::transport::{EntryKind, RemoteEntry, Transport};
use sitesync_common::{Error, RemotePath, Result, SiteConfig};

// SSH_FX_* status codes (draft-ietf-secsh-filexfer-02 §7).
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;

struct Connection {
    session: Session,
    sftp: Sftp,
}

type Slot = Arc<Mutex<Option<Connection>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Connection>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn map_code(code: ErrorCode, context: String) -> Error {
    match code {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => Error::NotFound(context),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => Error::PermissionDenied(context),
        ErrorCode::SFTP(FX_NO_CONNECTION) | ErrorCode::SFTP(FX_CONNECTION_LOST) => {
            Error::Network {
                kind: std::io::ErrorKind::ConnectionAborted,
                message: context,
            }
        }
        ErrorCode::SFTP(status) => Error::Reply {
            code: status as u16,
            message: context,
        },
        // Session-level failures mean the channel itself is gone.
        ErrorCode::Session(_) => Error::Network {
            kind: std::io::ErrorKind::ConnectionAborted,
            message: context,
        },
    }
}

fn map_err(err: ssh2::Error, path: &Path) -> Error {
    map_code(err.code(), format!("{}: {}", path.display(), err.message()))
}

fn entry_kind(stat: &FileStat) -> EntryKind {
    match stat.perm.unwrap_or(0) & 0o170000 {
        0o040000 => EntryKind::Directory,
        0o100000 => EntryKind::File,
        0o120000 => EntryKind::Symlink,
        0 if stat.is_dir() => EntryKind::Directory,
        0 if stat.is_file() => EntryKind::File,
        _ => EntryKind::Other,
    }
}

fn to_entry(path: &Path, stat: &FileStat) -> Option<RemoteEntry> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    if name == "." || name == ".." {
        return None;
    }
    let kind = entry_kind(stat);
    Some(RemoteEntry {
        name,
        kind,
        size: if kind == EntryKind::Directory {
            0
        } else {
            stat.size.unwrap_or(0)
        },
        modified: stat
            .mtime
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
    })
}

fn remote_path(path: &RemotePath) -> PathBuf {
    PathBuf::from(path.to_string_path())
}

fn open(config: &SiteConfig) -> Result<Connection> {
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let addr = config
        .address()
        .to_socket_addrs()
        .map_err(Error::network)?
        .next()
        .ok_or_else(|| Error::Config(format!("Cannot resolve {}", config.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(Error::network)?;

    let handshake_failed = |e: ssh2::Error| Error::Network {
        kind: std::io::ErrorKind::ConnectionAborted,
        message: format!("SSH handshake failed: {}", e),
    };
    let mut session = Session::new().map_err(handshake_failed)?;
    session.set_timeout(timeout.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(handshake_failed)?;

    let credentials = &config.credentials;
    let auth = match (&credentials.private_key_path, &credentials.password) {
        (Some(key), _) => session.userauth_pubkey_file(
            &credentials.username,
            None,
            key,
            credentials.passphrase.as_deref(),
        ),
        (None, Some(password)) => session.userauth_password(&credentials.username, password),
        (None, None) => {
            return Err(Error::Config(
                "SFTP needs a password or privateKeyPath".to_string(),
            ))
        }
    };
    auth.map_err(|e| Error::PermissionDenied(format!("Authentication failed: {}", e)))?;
    if !session.authenticated() {
        return Err(Error::PermissionDenied(
            "Authentication failed".to_string(),
        ));
    }
    // Transfers may legitimately block longer than the handshake.
    session.set_timeout(0);

    let sftp = session
        .sftp()
        .map_err(|e| map_code(e.code(), format!("SFTP subsystem: {}", e.message())))?;
    Ok(Connection { session, sftp })
}

fn remove_tree(sftp: &Sftp, path: &Path) -> Result<()> {
    for (child, stat) in sftp.readdir(path).map_err(|e| map_err(e, path))? {
        match to_entry(&child, &stat) {
            Some(entry) if entry.is_directory() => remove_tree(sftp, &child)?,
            Some(_) => sftp.unlink(&child).map_err(|e| map_err(e, &child))?,
            None => {}
        }
    }
    sftp.rmdir(path).map_err(|e| map_err(e, path))
}

fn make_dirs(sftp: &Sftp, path: &RemotePath) -> Result<()> {
    let mut current = if path.is_absolute() {
        RemotePath::root()
    } else {
        RemotePath::parse("")
    };
    for component in path.components() {
        current = current.join(component)?;
        let target = remote_path(&current);
        match sftp.stat(&target) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(Error::InvalidInput(format!(
                    "{} exists and is not a directory",
                    current
                )))
            }
            Err(_) => sftp.mkdir(&target, 0o755).map_err(|e| map_err(e, &target))?,
        }
    }
    Ok(())
}

/// SFTP transport holding at most one SSH session.
pub struct SftpTransport {
    conn: Slot,
    closed: Arc<AtomicBool>,
}

impl SftpTransport {
    pub fn new() -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Run `op` against the live session on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let slot = Arc::clone(&self.conn);
        let closed = Arc::clone(&self.closed);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&slot);
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::NotConnected("SFTP session is closed".to_string()))?;
            let result = op(&conn.sftp);
            if let Err(err) = &result {
                if matches!(err, Error::Network { .. }) {
                    warn!("SFTP connection lost: {}", err);
                    guard.take();
                    closed.store(true, Ordering::SeqCst);
                }
            }
            result
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

impl Default for SftpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SftpTransport {
    fn name(&self) -> &str {
        "sftp"
    }

    async fn connect(&self, config: &SiteConfig) -> Result<()> {
        self.close().await;

        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || open(&config))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        *lock(&self.conn) = Some(conn);
        self.closed.store(false, Ordering::SeqCst);
        debug!("SFTP connected");
        Ok(())
    }

    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let dir = remote_path(path);
        self.run(move |sftp| {
            let entries = sftp.readdir(&dir).map_err(|e| map_err(e, &dir))?;
            Ok(entries
                .iter()
                .filter_map(|(path, stat)| to_entry(path, stat))
                .collect())
        })
        .await
    }

    async fn upload_from(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let local = local.to_path_buf();
        let target = remote_path(remote);
        self.run(move |sftp| {
            let mut source = std::fs::File::open(&local)?;
            let mut dest = sftp.create(&target).map_err(|e| map_err(e, &target))?;
            std::io::copy(&mut source, &mut dest).map_err(Error::network)?;
            Ok(())
        })
        .await
    }

    async fn download_to(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let local = local.to_path_buf();
        let source_path = remote_path(remote);
        self.run(move |sftp| {
            // Open the remote side first so a missing file leaves no local stub.
            let mut source = sftp
                .open(&source_path)
                .map_err(|e| map_err(e, &source_path))?;
            let mut dest = std::fs::File::create(&local)?;
            std::io::copy(&mut source, &mut dest).map_err(Error::network)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, path: &RemotePath) -> Result<()> {
        let target = remote_path(path);
        self.run(move |sftp| sftp.unlink(&target).map_err(|e| map_err(e, &target)))
            .await
    }

    async fn remove_dir(&self, path: &RemotePath) -> Result<()> {
        let target = remote_path(path);
        self.run(move |sftp| remove_tree(sftp, &target)).await
    }

    async fn ensure_dir(&self, path: &RemotePath) -> Result<()> {
        let path = path.clone();
        self.run(move |sftp| make_dirs(sftp, &path)).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(conn) = lock(&self.conn).take() else {
            return;
        };
        let _ = tokio::task::spawn_blocking(move || {
            let _ = conn.session.disconnect(None, "closing", None);
        })
        .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(perm: u32, size: u64, mtime: u64) -> FileStat {
        FileStat {
            size: Some(size),
            uid: None,
            gid: None,
            perm: Some(perm),
            atime: None,
            mtime: Some(mtime),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert!(map_code(ErrorCode::SFTP(FX_NO_SUCH_FILE), "x".into()).is_not_found());
        assert!(matches!(
            map_code(ErrorCode::SFTP(FX_PERMISSION_DENIED), "x".into()),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            map_code(ErrorCode::SFTP(FX_CONNECTION_LOST), "x".into()),
            Error::Network { .. }
        ));
        assert!(matches!(
            map_code(ErrorCode::Session(-7), "x".into()),
            Error::Network { .. }
        ));
        assert!(matches!(
            map_code(ErrorCode::SFTP(4), "x".into()),
            Error::Reply { code: 4, .. }
        ));
    }

    #[test]
    fn test_to_entry() {
        let file = to_entry(Path::new("/www/index.html"), &stat(0o100644, 12, 1_700_000_000))
            .unwrap();
        assert_eq!(file.name, "index.html");
        assert!(file.is_file());
        assert_eq!(file.size, 12);
        assert_eq!(file.modified.unwrap().timestamp(), 1_700_000_000);

        let dir = to_entry(Path::new("/www/css"), &stat(0o040755, 4096, 0)).unwrap();
        assert!(dir.is_directory());
        assert_eq!(dir.size, 0);

        assert!(to_entry(Path::new("/www/.."), &stat(0o040755, 0, 0)).is_none());
    }

    #[tokio::test]
    async fn test_closed_until_connected() {
        let transport = SftpTransport::new();
        assert!(transport.is_closed());
        let result = transport.remove(&RemotePath::parse("/a")).await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
    }
}
