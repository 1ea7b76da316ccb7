//! FTP transport (RFC 959, with RFC 2428 EPSV and RFC 3659 MLSD).

mod codec;
mod listing;
mod session;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::{RemoteEntry, Transport};
use session::FtpSession;
use sitesync_common::{Error, RemotePath, Result, SiteConfig};

pub use listing::parse_listing;

/// Map a failure reply to an error.
///
/// Servers use 550 for both missing files and refused operations, so the
/// reply text decides between `NotFound` and `PermissionDenied`.
pub(crate) fn reply_error(code: u16, text: &str) -> Error {
    let lower = text.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    match code {
        450 | 550 if mentions(&["no such", "not found", "does not exist", "cannot find"]) => {
            Error::NotFound(text.to_string())
        }
        550 | 553 if mentions(&["permission", "denied", "not allowed"]) => {
            Error::PermissionDenied(text.to_string())
        }
        _ => Error::Reply {
            code,
            message: text.to_string(),
        },
    }
}

/// Whether the control connection is unusable after `err`.
fn connection_lost(err: &Error) -> bool {
    matches!(err, Error::Network { .. } | Error::Reply { code: 421, .. })
}

/// FTP transport holding at most one control connection.
pub struct FtpTransport {
    session: Mutex<Option<FtpSession>>,
    closed: AtomicBool,
}

impl FtpTransport {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            closed: AtomicBool::new(true),
        }
    }

    fn not_connected() -> Error {
        Error::NotConnected("FTP session is closed".to_string())
    }

    /// Pass `result` through, dropping the session if the connection died.
    fn settle<T>(&self, slot: &mut Option<FtpSession>, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if connection_lost(err) && slot.take().is_some() {
                self.closed.store(true, Ordering::SeqCst);
                warn!("FTP connection lost: {}", err);
            }
        }
        result
    }
}

impl Default for FtpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FtpTransport {
    fn name(&self) -> &str {
        "ftp"
    }

    async fn connect(&self, config: &SiteConfig) -> Result<()> {
        let mut slot = self.session.lock().await;
        if let Some(mut stale) = slot.take() {
            stale.quit().await;
        }
        self.closed.store(true, Ordering::SeqCst);

        let session = FtpSession::open(config).await?;
        *slot = Some(session);
        self.closed.store(false, Ordering::SeqCst);
        debug!(address = %config.address(), "FTP connected");
        Ok(())
    }

    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.list(path).await;
        self.settle(&mut slot, result)
    }

    async fn upload_from(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.store(local, remote).await;
        self.settle(&mut slot, result)
    }

    async fn download_to(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.retrieve(local, remote).await;
        self.settle(&mut slot, result)
    }

    async fn remove(&self, path: &RemotePath) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.delete(path).await;
        self.settle(&mut slot, result)
    }

    async fn remove_dir(&self, path: &RemotePath) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.remove_tree(path).await;
        self.settle(&mut slot, result)
    }

    async fn ensure_dir(&self, path: &RemotePath) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(Self::not_connected());
        };
        let result = session.make_dirs(path).await;
        self.settle(&mut slot, result)
    }

    async fn close(&self) {
        let mut slot = self.session.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut session) = slot.take() {
            session.quit().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_common::Protocol;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedWriteHalf;
    use tokio::net::TcpListener;

    const LISTING: &str = "type=cdir; .\r\n\
                           type=file;size=5;modify=20260101120000; index.html\r\n\
                           type=dir;modify=20260101120000; css\r\n";

    async fn reply(out: &mut OwnedWriteHalf, text: &str) {
        out.write_all(format!("{}\r\n", text).as_bytes())
            .await
            .unwrap();
    }

    /// Scripted single-client server covering login, EPSV, MLSD and RETR.
    async fn serve(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut out) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut passive: Option<TcpListener> = None;

        reply(&mut out, "220 test server ready").await;
        while let Ok(Some(line)) = lines.next_line().await {
            let (command, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            match command {
                "USER" => reply(&mut out, "331 Password required").await,
                "PASS" if arg == "secret" => reply(&mut out, "230 Logged in").await,
                "PASS" => reply(&mut out, "530 Login incorrect").await,
                "FEAT" => reply(&mut out, "211-Features:\r\n MLSD\r\n EPSV\r\n211 End").await,
                "TYPE" => reply(&mut out, "200 Type set to I").await,
                "PWD" => reply(&mut out, "257 \"/\" is the current directory").await,
                "EPSV" => {
                    let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = data.local_addr().unwrap().port();
                    passive = Some(data);
                    reply(&mut out, &format!("229 Entering Extended Passive Mode (|||{}|)", port))
                        .await;
                }
                "MLSD" if arg == "/missing" => {
                    reply(&mut out, "550 /missing: No such file or directory").await
                }
                "MLSD" => {
                    reply(&mut out, "150 Opening data connection").await;
                    if let Some(data) = passive.take() {
                        let (mut conn, _) = data.accept().await.unwrap();
                        conn.write_all(LISTING.as_bytes()).await.unwrap();
                    }
                    reply(&mut out, "226 Transfer complete").await;
                }
                "RETR" if arg == "/missing.txt" => {
                    reply(&mut out, "550 /missing.txt: No such file or directory").await
                }
                "RETR" => {
                    reply(&mut out, "150 Opening data connection").await;
                    if let Some(data) = passive.take() {
                        let (mut conn, _) = data.accept().await.unwrap();
                        conn.write_all(b"hello").await.unwrap();
                    }
                    reply(&mut out, "226 Transfer complete").await;
                }
                "QUIT" => {
                    reply(&mut out, "221 Bye").await;
                    break;
                }
                _ => reply(&mut out, "502 Command not implemented").await,
            }
        }
    }

    async fn start_server() -> SiteConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener));

        let mut config = SiteConfig::new("127.0.0.1", Protocol::Ftp);
        config.port = Some(port);
        config.credentials.username = "deploy".to_string();
        config.credentials.password = Some("secret".to_string());
        config
    }

    #[test]
    fn test_reply_error_mapping() {
        assert!(matches!(
            reply_error(550, "file.txt: No such file or directory"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            reply_error(550, "Permission denied"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            reply_error(421, "Service not available"),
            Error::Reply { code: 421, .. }
        ));
        assert!(matches!(
            reply_error(550, "Requested action not taken"),
            Error::Reply { code: 550, .. }
        ));
    }

    #[test]
    fn test_connection_lost() {
        assert!(connection_lost(&Error::Reply {
            code: 421,
            message: "Timeout".to_string()
        }));
        assert!(connection_lost(&Error::network(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        ))));
        assert!(!connection_lost(&Error::NotFound("x".to_string())));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let transport = FtpTransport::new();
        assert!(transport.is_closed());
        let result = transport.list(&RemotePath::root()).await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_connect_and_list() {
        let config = start_server().await;
        let transport = FtpTransport::new();

        transport.connect(&config).await.unwrap();
        assert!(!transport.is_closed());

        let entries = transport.list(&RemotePath::root()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "index.html");
        assert_eq!(entries[0].size, 5);
        assert!(entries[1].is_directory());

        let missing = transport.list(&RemotePath::parse("/missing")).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
        // A missing path does not cost the session.
        assert!(!transport.is_closed());

        transport.close().await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_download() {
        let config = start_server().await;
        let transport = FtpTransport::new();
        transport.connect(&config).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let target = dir.path().join("index.html");
        transport
            .download_to(&target, &RemotePath::parse("/index.html"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        let missing = dir.path().join("missing.txt");
        let result = transport
            .download_to(&missing, &RemotePath::parse("/missing.txt"))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!missing.exists());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_unwritable_local_file_keeps_session_in_step() {
        let config = start_server().await;
        let transport = FtpTransport::new();
        transport.connect(&config).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let unwritable = dir.path().join("no-such-dir").join("x.txt");
        let result = transport
            .download_to(&unwritable, &RemotePath::parse("/index.html"))
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!transport.is_closed());

        // Replies still pair with their commands.
        let entries = transport.list(&RemotePath::root()).await.unwrap();
        assert_eq!(entries.len(), 2);
        let target = dir.path().join("x.txt");
        transport
            .download_to(&target, &RemotePath::parse("/index.html"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        transport.close().await;
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let mut config = start_server().await;
        config.credentials.password = Some("wrong".to_string());
        let transport = FtpTransport::new();

        let err = transport.connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::Reply { code: 530, .. }));
        assert!(transport.is_closed());
    }
}
