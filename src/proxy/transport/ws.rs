use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::common::{Error, ProxyStream};

/// WebSocket 流包装层：二进制帧承载上层字节流
pub struct WsWrapper {
    host: String,
    path: String,
    headers: HashMap<String, String>,
}

impl WsWrapper {
    pub fn new(host: String, path: String, headers: HashMap<String, String>) -> Self {
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self { host, path, headers }
    }

    pub async fn wrap(&self, stream: ProxyStream) -> Result<ProxyStream> {
        // Host 头可被 ws-headers 覆盖（CDN 场景）
        let host = self
            .headers
            .get("Host")
            .cloned()
            .unwrap_or_else(|| self.host.clone());
        let url = format!("ws://{}{}", host, self.path);

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::HandshakeFailure(format!("ws request: {}", e)))?;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("host") {
                continue;
            }
            let name: tokio_tungstenite::tungstenite::http::HeaderName = key
                .parse()
                .map_err(|_| Error::HandshakeFailure(format!("invalid ws header name: {}", key)))?;
            let value = value
                .parse()
                .map_err(|_| Error::HandshakeFailure(format!("invalid ws header value: {}", key)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _resp) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| Error::HandshakeFailure(format!("ws handshake: {}", e)))?;
        debug!(host = host.as_str(), path = self.path.as_str(), "ws handshake completed");
        Ok(Box::new(WsByteStream::new(ws)))
    }
}

/// 把 WebSocket 二进制帧适配为字节流
pub struct WsByteStream {
    inner: WebSocketStream<ProxyStream>,
    read_buf: BytesMut,
    eof: bool,
}

impl WsByteStream {
    pub fn new(inner: WebSocketStream<ProxyStream>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            eof: false,
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => this.read_buf.extend_from_slice(&data),
                    Message::Text(text) => this.read_buf.extend_from_slice(text.as_bytes()),
                    Message::Close(_) => {
                        this.eof = true;
                    }
                    // Ping/Pong 由 tungstenite 内部应答
                    _ => {}
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(e.to_string())));
                }
                Poll::Ready(None) => {
                    this.eof = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e.to_string()))),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(|e| io::Error::other(e.to_string()))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn ws_bytestream_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 服务端：接受 ws 握手后回显二进制帧
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(sock).await.unwrap();
            use futures_util::{SinkExt, StreamExt};
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(data) = message {
                    ws.send(Message::Binary(data)).await.unwrap();
                }
            }
        });

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let wrapper = WsWrapper::new(addr.to_string(), "/tunnel".to_string(), HashMap::new());
        let mut stream = wrapper.wrap(Box::new(tcp)).await.unwrap();

        stream.write_all(b"frame-payload").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame-payload");
    }
}
