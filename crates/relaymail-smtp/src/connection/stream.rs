//! Low-level SMTP stream handling.

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// Upper bound on one reply line, line ending included.
const MAX_LINE_LENGTH: u64 = 4096;

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Tcp(BufReader<TcpStream>),
    /// TLS-encrypted connection (boxed to reduce enum size).
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl SmtpStream {
    /// Reads one line, without its line ending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] at end of stream, a protocol error
    /// for a line longer than 4096 bytes, or an I/O error.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = match self {
            Self::Tcp(reader) => reader.take(MAX_LINE_LENGTH).read_line(&mut line).await?,
            Self::Tls(reader) => reader.take(MAX_LINE_LENGTH).read_line(&mut line).await?,
        };
        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        if read as u64 >= MAX_LINE_LENGTH && !line.ends_with('\n') {
            return Err(Error::Protocol(format!(
                "Reply line exceeds {MAX_LINE_LENGTH} bytes"
            )));
        }
        Ok(line.trim_end().to_string())
    }

    /// Writes data to the stream and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    /// Wraps the existing TCP connection in TLS.
    ///
    /// The socket is reused as-is; nothing is re-resolved or re-dialed.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS or the handshake fails.
    pub async fn upgrade(
        self,
        connector: &TlsConnector,
        name: ServerName<'static>,
    ) -> Result<Self> {
        let tcp_stream = match self {
            Self::Tcp(reader) => {
                if !reader.buffer().is_empty() {
                    return Err(Error::Protocol(
                        "Server sent data before the TLS handshake".into(),
                    ));
                }
                reader.into_inner()
            }
            Self::Tls(_) => return Err(Error::Protocol("Already using TLS".into())),
        };

        let tls_stream = connector
            .connect(name, tcp_stream)
            .await
            .map_err(Error::Tls)?;
        Ok(Self::Tls(Box::new(BufReader::new(tls_stream))))
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Closes the write half (sends `close_notify` on TLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Tcp(reader) => reader.get_mut().shutdown().await?,
            Self::Tls(reader) => reader.get_mut().shutdown().await?,
        }
        Ok(())
    }
}

/// Connects to `host:port` over plain TCP.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn connect(addr: &str) -> Result<SmtpStream> {
    match TcpStream::connect(addr).await {
        Ok(stream) => Ok(SmtpStream::Tcp(BufReader::new(stream))),
        Err(source) => Err(Error::Connect {
            addr: addr.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn stream_fed_with(data: Vec<u8>) -> SmtpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let _ = peer.write_all(&data).await;
            let _ = peer.shutdown().await;
        });
        connect(&addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_line_strips_crlf_then_reports_eof() {
        let mut stream = stream_fed_with(b"220 ready\r\n".to_vec()).await;
        assert_eq!(stream.read_line().await.unwrap(), "220 ready");
        assert!(matches!(
            stream.read_line().await,
            Err(Error::ConnectionClosed)
        ));
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_read_line_rejects_unterminated_flood() {
        let mut stream = stream_fed_with(vec![b'a'; 10_000]).await;
        let err = stream.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert_eq!(err.to_string(), "Protocol error: Reply line exceeds 4096 bytes");
    }

    #[tokio::test]
    async fn test_read_line_accepts_long_terminated_line() {
        let mut data = b"250 ".to_vec();
        data.extend(vec![b'x'; 4000]);
        data.extend_from_slice(b"\r\n");
        let mut stream = stream_fed_with(data).await;
        assert_eq!(stream.read_line().await.unwrap().len(), 4004);
    }

    #[tokio::test]
    async fn test_connect_error_names_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect(&addr).await.unwrap_err();
        assert!(err.to_string().starts_with(&format!("Failed to connect to {addr}: ")));
    }
}
