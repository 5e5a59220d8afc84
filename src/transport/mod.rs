//! # Transport Layer
//!
//! Framed duplex byte channels between protocol peers. Two interchangeable
//! implementations exist behind the same pair of traits:
//!
//! - [`tls`]: TLS 1.3 over TCP with optional SPKI fingerprint pinning
//! - [`ws`]: WebSocket binary frames
//!
//! Commands are line-oriented (single LF terminator); message bodies are
//! raw byte blocks whose length travels on the preceding command line.
//! Constructors hand back boxed read/write halves so read loops and write
//! loops can run as separate tasks per connection.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::defaults;

pub mod tls;
pub mod ws;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection (clean EOF included).
    #[error("connection closed")]
    ConnClosed,
    /// TLS setup or certificate validation failure.
    #[error("TLS error: {0}")]
    Tls(String),
    /// A length-prefixed block did not match its declared size.
    #[error("malformed length-prefixed block")]
    BadBlockSize,
    /// A line exceeded [`defaults::MAX_LINE`].
    #[error("line exceeds maximum length")]
    LineTooLong,
    /// A protocol line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    BadUtf8,
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Receiving half of a transport.
#[async_trait]
pub trait TransportRead: Send {
    /// Read one LF-terminated line; the terminator is stripped.
    async fn get_line(&mut self) -> Result<String, TransportError>;

    /// Read exactly `n` raw bytes.
    async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;
}

/// Sending half of a transport.
#[async_trait]
pub trait TransportWrite: Send {
    /// Write one line followed by the LF terminator.
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Write raw bytes.
    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Flush and close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub type BoxedRead = Box<dyn TransportRead>;
pub type BoxedWrite = Box<dyn TransportWrite>;

/// Read a body block of `declared` bytes plus the trailing LF.
pub async fn get_block(
    r: &mut (dyn TransportRead + '_),
    declared: usize,
    max: usize,
) -> Result<Vec<u8>, TransportError> {
    if declared > max {
        return Err(TransportError::BadBlockSize);
    }
    let mut body = r.get_bytes(declared + 1).await?;
    if body.pop() != Some(b'\n') {
        return Err(TransportError::BadBlockSize);
    }
    Ok(body)
}

/// Buffered line/block reader over any [`AsyncRead`] byte stream.
pub struct IoTransportRead<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> IoTransportRead<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; 4096];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::ConnClosed);
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportRead for IoTransportRead<R> {
    async fn get_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                if pos > defaults::MAX_LINE {
                    return Err(TransportError::LineTooLong);
                }
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return String::from_utf8(line).map_err(|_| TransportError::BadUtf8);
            }
            if self.pending.len() > defaults::MAX_LINE {
                return Err(TransportError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        while self.pending.len() < n {
            self.fill().await?;
        }
        Ok(self.pending.drain(..n).collect())
    }
}

/// Writer over any [`AsyncWrite`] byte stream.
pub struct IoTransportWrite<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> IoTransportWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWrite for IoTransportWrite<W> {
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a plain byte stream into boxed transport halves.
///
/// Used for the agent's local client listener, where sessions stay on the
/// loopback interface and TLS would add nothing.
pub fn plain<S>(stream: S) -> (BoxedRead, BoxedWrite)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    (
        Box::new(IoTransportRead::new(r)),
        Box::new(IoTransportWrite::new(w)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_and_blocks() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut read, _w) = plain(server);
        let (_r, mut write) = plain(client);

        write.put_line("NEW key").await.unwrap();
        write.put_bytes(b"hello\n").await.unwrap();

        assert_eq!(read.get_line().await.unwrap(), "NEW key");
        assert_eq!(get_block(read.as_mut(), 5, 16).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn line_longer_than_cap_fails() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut read, _w) = plain(server);
        let (_r, mut write) = plain(client);

        let long = "x".repeat(defaults::MAX_LINE + 1);
        write.put_line(&long).await.unwrap();
        assert!(matches!(
            read.get_line().await,
            Err(TransportError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn block_without_terminator_fails() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut read, _w) = plain(server);
        let (_r, mut write) = plain(client);

        write.put_bytes(b"hellox").await.unwrap();
        assert!(matches!(
            get_block(read.as_mut(), 5, 16).await,
            Err(TransportError::BadBlockSize)
        ));
    }

    #[tokio::test]
    async fn eof_surfaces_as_conn_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut read, _w) = plain(server);
        drop(client);
        assert!(matches!(
            read.get_line().await,
            Err(TransportError::ConnClosed)
        ));
    }
}
