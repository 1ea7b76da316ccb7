//! FTP control-channel codec (RFC 959 §4).
//!
//! Commands are sent terminated with `\r\n`. Replies start with a 3-digit
//! code; a `-` after the code opens a multi-line reply that ends with a
//! line starting with the same code followed by a space.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

use super::reply_error;
use sitesync_common::{Error, Result};

/// A complete server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Reply text with the code prefix of the last line removed.
    pub fn text(&self) -> String {
        let last = self.lines.last().map(String::as_str).unwrap_or("");
        last.get(4..).unwrap_or("").trim().to_string()
    }

    /// 1xx: transfer about to start.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: more information needed (e.g. password).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Command/reply codec over any byte stream.
pub struct Codec<S = TcpStream> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Codec<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send a command; CRLF is appended.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let line = format!("{}\r\n", command);
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(Error::network)?;
        if command.starts_with("PASS ") {
            trace!(">>> PASS ****");
        } else {
            trace!(">>> {}", command);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let n = self
            .stream
            .read_line(&mut buf)
            .await
            .map_err(Error::network)?;
        if n == 0 {
            return Err(Error::Network {
                kind: std::io::ErrorKind::UnexpectedEof,
                message: "Server closed the control connection".to_string(),
            });
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];

        if lines[0].as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let reply = Reply { code, lines };
        trace!("<<< {} {}", reply.code, reply.text());
        Ok(reply)
    }

    /// Send a command and read its reply.
    pub async fn execute(&mut self, command: &str) -> Result<Reply> {
        self.send(command).await?;
        self.read_reply().await
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, command: &str) -> Result<Reply> {
        let reply = self.execute(command).await?;
        if !reply.is_success() {
            return Err(reply_error(reply.code, &reply.text()));
        }
        Ok(reply)
    }
}

fn parse_code(line: &str) -> Result<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| Error::Network {
            kind: std::io::ErrorKind::InvalidData,
            message: format!("Malformed server reply: '{}'", line),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_single_line_reply() {
        let (client, mut server) = duplex(1024);
        let mut codec = Codec::new(client);
        server.write_all(b"220 Welcome\r\n").await.unwrap();

        let reply = codec.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text(), "Welcome");
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_multi_line_reply() {
        let (client, mut server) = duplex(1024);
        let mut codec = Codec::new(client);
        server
            .write_all(b"211-Features:\r\n MLSD\r\n SIZE\r\n211 End\r\n")
            .await
            .unwrap();

        let reply = codec.read_reply().await.unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.lines[1].trim(), "MLSD");
    }

    #[tokio::test]
    async fn test_execute_appends_crlf() {
        let (client, mut server) = duplex(1024);
        let mut codec = Codec::new(client);
        server.write_all(b"331 Password required\r\n").await.unwrap();

        let reply = codec.execute("USER deploy").await.unwrap();
        assert!(reply.is_intermediate());

        let mut buf = vec![0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"USER deploy\r");
    }

    #[tokio::test]
    async fn test_expect_ok_maps_failure() {
        let (client, mut server) = duplex(1024);
        let mut codec = Codec::new(client);
        server
            .write_all(b"550 missing.txt: No such file or directory\r\n")
            .await
            .unwrap();

        let err = codec.expect_ok("DELE missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_eof_is_network_error() {
        let (client, server) = duplex(64);
        let mut codec = Codec::new(client);
        drop(server);

        let err = codec.read_reply().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network {
                kind: std::io::ErrorKind::UnexpectedEof,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let (client, mut server) = duplex(64);
        let mut codec = Codec::new(client);
        server.write_all(b"hello\r\n").await.unwrap();
        assert!(codec.read_reply().await.is_err());
    }
}
