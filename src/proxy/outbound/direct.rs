use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, DatagramStream, Error, UdpPacket, UdpTransport};
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, Network, OutboundHandler, Session,
};

/// 直连出站
pub struct DirectOutbound {
    name: String,
}

impl DirectOutbound {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    async fn resolve_target(&self, target: &Address) -> Result<SocketAddr> {
        match target {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(host, port) => {
                let ips = match crate::dns::global_resolver() {
                    Some(resolver) => {
                        resolver
                            .resolve_ips(host, crate::dns::ResolveFlags::default())
                            .await?
                    }
                    None => tokio::net::lookup_host(format!("{}:{}", host, port))
                        .await?
                        .map(|a| a.ip())
                        .collect(),
                };
                let ip = ips
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::IpNotFound(host.clone()))?;
                Ok(SocketAddr::new(ip, *port))
            }
        }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Direct
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let mut stream = match &ctx.dialer {
            Some(nested) => nested.dial(Network::Tcp, &session.target).await?,
            None => {
                let dialer = match crate::dns::global_resolver() {
                    Some(resolver) => Dialer::with_resolver(
                        Default::default(),
                        Arc::new(crate::dns::ResolverHandle(resolver)),
                    ),
                    None => Dialer::default_dialer(),
                };
                let stream = dialer
                    .connect_host(&session.target.host(), session.target.port())
                    .await?;
                ChainedStream::new(Box::new(stream))
            }
        };
        debug!(target = %session.target, "direct connected");
        stream.push_inner_hop(&self.name);
        Ok(stream)
    }

    async fn connect_udp(&self, _ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        let remote = self.resolve_target(&session.target).await?;
        let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        debug!(target = %session.target, remote = %remote, "direct udp bound");

        let transport = DirectUdpTransport {
            stream: DatagramStream::new(socket, remote),
            remote,
        };
        let mut datagram = ChainedDatagram::new(Box::new(transport));
        datagram.push_inner_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// 直连 UDP：packet socket 的流式门面之上按包收发
struct DirectUdpTransport {
    stream: DatagramStream,
    remote: SocketAddr,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        self.stream.socket().send_to(&packet.data, self.remote).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        loop {
            let mut buf = vec![0u8; 65535];
            let (n, from) = self.stream.socket().recv_from(&mut buf).await?;
            // 只透出配置远端的数据报
            if from != self.remote {
                continue;
            }
            buf.truncate(n);
            return Ok(UdpPacket {
                addr: Address::Ip(from),
                data: buf.into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn direct_connect_records_hop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let outbound = DirectOutbound::new("DIRECT".to_string());
        let session = Session::tcp(Address::Ip(addr));
        let mut stream = outbound.connect(&DialCtx::plain(), &session).await.unwrap();

        assert_eq!(crate::proxy::ChainedStream::chain(&stream).hops(), vec!["DIRECT"]);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn direct_udp_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let outbound = DirectOutbound::new("DIRECT".to_string());
        let session = Session::udp(Address::Ip(server_addr));
        let datagram = outbound
            .connect_udp(&DialCtx::plain(), &session)
            .await
            .unwrap();

        assert_eq!(crate::proxy::ChainedDatagram::chain(&datagram).hops(), vec!["DIRECT"]);

        datagram
            .send(UdpPacket {
                addr: Address::Ip(server_addr),
                data: bytes::Bytes::from_static(b"echo"),
            })
            .await
            .unwrap();

        let packet = datagram.recv().await.unwrap();
        assert_eq!(&packet.data[..], b"echo");
    }
}
