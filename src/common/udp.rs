use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use super::Address;

/// UDP 数据包
pub struct UdpPacket {
    /// 目标(发送)或来源(接收)地址
    pub addr: Address,
    /// 载荷
    pub data: Bytes,
}

/// UDP 传输抽象 trait
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn send(&self, packet: UdpPacket) -> Result<()>;
    async fn recv(&self) -> Result<UdpPacket>;
}

/// 类型擦除的 UDP 传输
pub type BoxUdpTransport = Box<dyn UdpTransport>;

/// packet socket 的流式门面。
///
/// 把一个已绑定的 UDP socket 当作字节流使用：`write` 向固定远端发包，
/// `read` 只向上层透出来源等于该远端的数据报，其余来源的包丢弃。
/// 数据报边界即一次 read/write 的边界。
pub struct DatagramStream {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl DatagramStream {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl AsyncRead for DatagramStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.socket.poll_recv_from(cx, buf) {
                Poll::Ready(Ok(from)) => {
                    if from == this.remote {
                        return Poll::Ready(Ok(()));
                    }
                    // 来源不匹配的数据报直接丢弃，继续等下一个
                    buf.clear();
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.socket.poll_send_to(cx, buf, this.remote)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn datagram_stream_filters_by_remote() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_addr = client.local_addr().unwrap();
        let mut stream = DatagramStream::new(client.clone(), server_addr);

        // 陌生来源先发一个包，随后配置的远端发一个包
        stranger.send_to(b"noise", client_addr).await.unwrap();
        server.send_to(b"hello", client_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn datagram_stream_writes_to_remote() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut stream = DatagramStream::new(client, server_addr);

        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
