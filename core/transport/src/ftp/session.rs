//! One logged-in FTP control connection and the commands issued over it.
//!
//! Lifecycle: TCP connect → 220 greeting → USER/PASS → FEAT query →
//! `TYPE I` → PWD. Every transfer opens a passive data connection (EPSV,
//! falling back to PASV).

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::codec::{Codec, Reply};
use super::listing::parse_listing;
use super::reply_error;
use crate::transport::RemoteEntry;
use sitesync_common::{Error, RemotePath, Result, SiteConfig};

static PASV_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("static regex")
});

static EPSV_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\|\|\|(\d+)\|\)").expect("static regex"));

fn timed_out(what: &str) -> Error {
    Error::Network {
        kind: std::io::ErrorKind::TimedOut,
        message: format!("{} timed out", what),
    }
}

fn unexpected(reply: &Reply) -> Error {
    reply_error(reply.code, &reply.text())
}

/// A logged-in FTP session.
pub(crate) struct FtpSession {
    codec: Codec,
    host: String,
    home: String,
    mlsd: bool,
    epsv: bool,
    io_timeout: Duration,
}

impl FtpSession {
    /// Connect and log in.
    pub async fn open(config: &SiteConfig) -> Result<Self> {
        let io_timeout = Duration::from_secs(config.connect_timeout_secs);
        let stream = timeout(io_timeout, TcpStream::connect(config.address()))
            .await
            .map_err(|_| timed_out("Connect"))?
            .map_err(Error::network)?;
        let mut codec = Codec::new(stream);

        let greeting = timeout(io_timeout, codec.read_reply())
            .await
            .map_err(|_| timed_out("Greeting"))??;
        if !greeting.is_success() {
            return Err(unexpected(&greeting));
        }

        let username = if config.credentials.username.is_empty() {
            "anonymous"
        } else {
            config.credentials.username.as_str()
        };
        let user = codec.execute(&format!("USER {}", username)).await?;
        if user.is_intermediate() {
            let password = config.credentials.password.as_deref().unwrap_or("");
            let pass = codec.execute(&format!("PASS {}", password)).await?;
            if !pass.is_success() {
                return Err(unexpected(&pass));
            }
        } else if !user.is_success() {
            return Err(unexpected(&user));
        }

        let features = codec.execute("FEAT").await?;
        let has = |name: &str| {
            features.is_success()
                && features
                    .lines
                    .iter()
                    .skip(1)
                    .any(|l| l.trim().to_ascii_uppercase().starts_with(name))
        };
        let mlsd = has("MLSD");
        let epsv = has("EPSV");

        codec.expect_ok("TYPE I").await?;
        let home = codec
            .expect_ok("PWD")
            .await
            .ok()
            .and_then(|r| parse_pwd(&r.text()))
            .unwrap_or_else(|| "/".to_string());

        debug!(host = %config.host, mlsd, epsv, home = %home, "FTP session established");

        Ok(Self {
            codec,
            host: config.host.clone(),
            home,
            mlsd,
            epsv,
            io_timeout,
        })
    }

    async fn open_data(&mut self) -> Result<TcpStream> {
        let addr = if self.epsv {
            let reply = self.codec.execute("EPSV").await?;
            let port = reply.is_success().then(|| parse_epsv(&reply.text())).flatten();
            if port.is_none() {
                self.epsv = false;
            }
            port.map(|port| format!("{}:{}", self.host, port))
        } else {
            None
        };

        let addr = match addr {
            Some(addr) => addr,
            None => {
                let reply = self.codec.expect_ok("PASV").await?;
                parse_pasv(&reply.text())
                    .ok_or_else(|| unexpected(&reply))?
                    .to_string()
            }
        };

        timeout(self.io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| timed_out("Data connection"))?
            .map_err(Error::network)
    }

    /// Send a transfer command and require the 1xx "opening data connection".
    async fn start_transfer(&mut self, command: &str) -> Result<()> {
        let reply = self.codec.execute(command).await?;
        if !reply.is_preliminary() {
            return Err(unexpected(&reply));
        }
        Ok(())
    }

    /// Read the 226 that closes a transfer.
    async fn finish_transfer(&mut self) -> Result<()> {
        let done = timeout(self.io_timeout, self.codec.read_reply())
            .await
            .map_err(|_| timed_out("Transfer completion"))??;
        if !done.is_success() {
            return Err(unexpected(&done));
        }
        Ok(())
    }

    pub async fn list(&mut self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let command = if self.mlsd {
            format!("MLSD {}", path)
        } else {
            format!("LIST {}", path)
        };

        let mut data = self.open_data().await?;
        self.start_transfer(&command).await?;
        let mut body = Vec::new();
        data.read_to_end(&mut body).await.map_err(Error::network)?;
        drop(data);
        self.finish_transfer().await?;

        Ok(parse_listing(&String::from_utf8_lossy(&body), Utc::now()))
    }

    pub async fn store(&mut self, local: &Path, remote: &RemotePath) -> Result<()> {
        // Local errors surface before any remote state is touched.
        let mut file = File::open(local).await?;

        let mut data = self.open_data().await?;
        self.start_transfer(&format!("STOR {}", remote)).await?;
        tokio::io::copy(&mut file, &mut data)
            .await
            .map_err(Error::network)?;
        data.shutdown().await.map_err(Error::network)?;
        drop(data);
        self.finish_transfer().await
    }

    pub async fn retrieve(&mut self, local: &Path, remote: &RemotePath) -> Result<()> {
        // Fail on the local side before the server starts a transfer.
        let mut file = File::create(local).await?;

        let started = async {
            let data = self.open_data().await?;
            self.start_transfer(&format!("RETR {}", remote)).await?;
            Ok::<TcpStream, Error>(data)
        }
        .await;
        let mut data = match started {
            Ok(data) => data,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(local).await;
                return Err(err);
            }
        };

        let written = match tokio::io::copy(&mut data, &mut file).await {
            Ok(_) => file.flush().await.map_err(Error::from),
            // Either side may have failed; treat the data channel as dead.
            Err(e) => return Err(Error::network(e)),
        };
        drop(data);

        // The completion reply is consumed even after a local failure so the
        // control channel stays in step.
        let finished = self.finish_transfer().await;
        written?;
        finished
    }

    pub async fn delete(&mut self, path: &RemotePath) -> Result<()> {
        self.codec.expect_ok(&format!("DELE {}", path)).await?;
        Ok(())
    }

    pub fn remove_tree<'a>(&'a mut self, path: &'a RemotePath) -> BoxFuture<'a, Result<()>> {
        async move {
            for entry in self.list(path).await? {
                let child = path.join(&entry.name)?;
                if entry.is_directory() {
                    self.remove_tree(&child).await?;
                } else {
                    self.delete(&child).await?;
                }
            }
            self.codec.expect_ok(&format!("RMD {}", path)).await?;
            Ok(())
        }
        .boxed()
    }

    /// Create `path` and its parents, tolerating existing directories.
    pub async fn make_dirs(&mut self, path: &RemotePath) -> Result<()> {
        let mut current = if path.is_absolute() {
            RemotePath::root()
        } else {
            RemotePath::parse("")
        };
        let mut last_error = None;
        for component in path.components() {
            current = current.join(component)?;
            let reply = self.codec.execute(&format!("MKD {}", current)).await?;
            last_error = if reply.is_success() {
                None
            } else {
                // Usually "already exists"; verified below.
                Some(unexpected(&reply))
            };
        }

        if let Some(err) = last_error {
            let check = self.codec.execute(&format!("CWD {}", path)).await?;
            if !check.is_success() {
                return Err(err);
            }
            self.codec.expect_ok(&format!("CWD {}", self.home)).await?;
        }
        Ok(())
    }

    pub async fn quit(&mut self) {
        let _ = timeout(Duration::from_secs(2), self.codec.execute("QUIT")).await;
    }
}

fn parse_pwd(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let end = text[start + 1..].find('"')?;
    Some(text[start + 1..start + 1 + end].to_string())
}

fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let caps = PASV_ADDR.captures(text)?;
    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1].parse().ok()?;
    }
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Some(SocketAddr::new(ip, port))
}

fn parse_epsv(text: &str) -> Option<u16> {
    EPSV_PORT.captures(text)?[1].parse().ok()
}
