//! WebSocket transport (binary frames).
//!
//! Each outbound line or byte block travels as one binary frame; inbound
//! frames feed a byte buffer the shared line/block framing reads from, so
//! frame boundaries carry no protocol meaning.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::defaults;
use crate::transport::{BoxedRead, BoxedWrite, TransportError, TransportRead, TransportWrite};

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::ConnClosed,
        Error::Io(e) => TransportError::Io(e),
        other => TransportError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

/// Receiving half over a split WebSocket.
pub struct WsTransportRead<S> {
    inner: SplitStream<WebSocketStream<S>>,
    pending: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WsTransportRead<S> {
    async fn fill(&mut self) -> Result<(), TransportError> {
        loop {
            match self.inner.next().await {
                None => return Err(TransportError::ConnClosed),
                Some(Err(e)) => return Err(ws_error(e)),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    self.pending.extend_from_slice(&bytes);
                    return Ok(());
                }
                Some(Ok(WsMessage::Text(text))) => {
                    self.pending.extend_from_slice(text.as_bytes());
                    return Ok(());
                }
                Some(Ok(WsMessage::Close(_))) => return Err(TransportError::ConnClosed),
                // ping/pong are handled by tungstenite itself
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TransportRead for WsTransportRead<S> {
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

/// Sending half over a split WebSocket.
pub struct WsTransportWrite<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TransportWrite for WsTransportWrite<S> {
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.inner
            .send(WsMessage::Binary(frame))
            .await
            .map_err(ws_error)
    }

    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::Binary(bytes.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(ws_error)
    }
}

fn split_ws<S>(ws: WebSocketStream<S>) -> (BoxedRead, BoxedWrite)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        Box::new(WsTransportRead {
            inner: stream,
            pending: Vec::new(),
        }),
        Box::new(WsTransportWrite { inner: sink }),
    )
}

/// Accept a WebSocket session on an already-accepted TCP stream.
pub async fn accept(stream: TcpStream) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    stream.set_nodelay(true)?;
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(ws_error)?;
    Ok(split_ws(ws))
}

/// Open a WebSocket session to `host:port`.
pub async fn connect(host: &str, port: u16) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{host}:{port}/"))
        .await
        .map_err(ws_error)?;
    Ok(split_ws(ws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn lines_and_blocks_cross_frame_boundaries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read, _write) = accept(stream).await.unwrap();
            let line = read.get_line().await.unwrap();
            let block = crate::transport::get_block(read.as_mut(), 5, 16)
                .await
                .unwrap();
            (line, block)
        });

        let (_read, mut write) = connect("127.0.0.1", addr.port()).await.unwrap();
        // one frame carrying a line plus the start of the body block
        write.put_bytes(b"PING\nhel").await.unwrap();
        write.put_bytes(b"lo\n").await.unwrap();

        let (line, block) = server.await.unwrap();
        assert_eq!(line, "PING");
        assert_eq!(block, b"hello");
    }
}
