use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, Error, ProxyStream, UdpPacket, UdpTransport};
use crate::config::OutboundConfig;
use crate::proxy::transport::tls::TlsWrapper;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// SOCKS5 出站（RFC 1928 / RFC 1929 客户端侧）
pub struct Socks5Outbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
    udp: bool,
    tls: Option<Arc<TlsWrapper>>,
    dialer: Dialer,
}

impl Socks5Outbound {
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        let server = Address::Domain(config.require_server()?.to_string(), config.require_port()?);

        let tls = if config.tls {
            let sni = config.sni.clone().unwrap_or_else(|| server.host());
            Some(Arc::new(TlsWrapper::new(
                sni,
                config.alpn.clone(),
                config.skip_cert_verify,
            )?))
        } else {
            None
        };

        Ok(Self {
            name: config.name.clone(),
            server,
            username: config.username.clone(),
            password: config.password.clone(),
            udp: config.udp,
            tls,
            dialer: super::outbound_dialer(config),
        })
    }

    /// 方法协商 + 可选的用户名密码认证
    async fn handshake(&self, stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<()> {
        let has_auth = self.username.is_some() && self.password.is_some();

        if has_auth {
            stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
        }

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;

        if resp[0] != 0x05 {
            return Err(Error::Protocol(format!(
                "socks5: unsupported version 0x{:02x}",
                resp[0]
            ))
            .into());
        }

        match resp[1] {
            0x00 => {}
            0x02 => {
                let username = self
                    .username
                    .as_ref()
                    .ok_or_else(|| Error::AuthRequired)?;
                let password = self
                    .password
                    .as_ref()
                    .ok_or_else(|| Error::AuthRequired)?;

                let mut auth_req = Vec::with_capacity(3 + username.len() + password.len());
                auth_req.push(0x01);
                auth_req.push(username.len() as u8);
                auth_req.extend_from_slice(username.as_bytes());
                auth_req.push(password.len() as u8);
                auth_req.extend_from_slice(password.as_bytes());
                stream.write_all(&auth_req).await?;

                let mut auth_resp = [0u8; 2];
                stream.read_exact(&mut auth_resp).await?;
                if auth_resp[1] != 0x00 {
                    return Err(Error::HandshakeFailure(format!(
                        "socks5 auth rejected (status 0x{:02x})",
                        auth_resp[1]
                    ))
                    .into());
                }
            }
            0xFF => return Err(Error::AuthRequired.into()),
            method => {
                return Err(Error::Protocol(format!(
                    "socks5: unsupported auth method 0x{:02x}",
                    method
                ))
                .into());
            }
        }

        Ok(())
    }

    /// 发送请求并读取回复，返回 BND.ADDR
    async fn send_request(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        cmd: u8,
        target: &Address,
    ) -> Result<Address> {
        let mut req = BytesMut::with_capacity(64);
        req.put_u8(0x05);
        req.put_u8(cmd);
        req.put_u8(0x00);
        target.encode_socks5(&mut req);
        stream.write_all(&req).await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x05 {
            return Err(Error::Protocol(format!(
                "socks5: invalid reply version 0x{:02x}",
                head[0]
            ))
            .into());
        }
        if head[1] != 0x00 {
            return Err(match head[1] {
                0x03 => Error::NetworkUnreachable(target.to_string()),
                0x05 => Error::ConnectionRefused(target.to_string()),
                code => Error::Protocol(format!("socks5: request failed (0x{:02x})", code)),
            }
            .into());
        }

        let atyp = stream.read_u8().await?;
        let bind = match atyp {
            0x01 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Ip(SocketAddr::new(IpAddr::V4(addr.into()), port))
            }
            0x03 => {
                let len = stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                let port = stream.read_u16().await?;
                Address::Domain(String::from_utf8_lossy(&domain).to_string(), port)
            }
            0x04 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Ip(SocketAddr::new(IpAddr::V6(addr.into()), port))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "socks5: unsupported bind address type 0x{:02x}",
                    other
                ))
                .into());
            }
        };

        Ok(bind)
    }

    async fn open_control(&self, ctx: &DialCtx) -> Result<(ProxyStream, crate::proxy::Chain)> {
        let transport = super::dial_server(ctx, &self.dialer, &self.server).await?;
        let (inner, chain) = transport.into_parts();

        let stream = match &self.tls {
            Some(wrapper) => wrapper.wrap(inner).await?,
            None => inner,
        };
        Ok((stream, chain))
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Socks5
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, server = %self.server, "socks5 CONNECT");

        let (mut stream, chain) = self.open_control(ctx).await?;
        self.handshake(&mut stream).await?;
        let _bind = self
            .send_request(&mut stream, CMD_CONNECT, &session.target)
            .await?;

        let mut stream = ChainedStream::with_chain(stream, chain);
        stream.push_inner_hop(&self.name);
        debug!(target = %session.target, "socks5 tunnel established");
        Ok(stream)
    }

    async fn connect_udp(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        debug!(target = %session.target, server = %self.server, "socks5 UDP ASSOCIATE");

        let (mut control, chain) = self.open_control(ctx).await?;
        self.handshake(&mut control).await?;

        // 目标 0.0.0.0:0 表示由服务器指定中继地址
        let placeholder = Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let bind = self
            .send_request(&mut control, CMD_UDP_ASSOCIATE, &placeholder)
            .await?;

        // 服务器返回未指定地址时，用控制连接的服务器 IP 替换
        let relay_addr: SocketAddr = match &bind {
            Address::Ip(addr) if addr.ip().is_unspecified() => {
                let ip: IpAddr = match self.server.ip() {
                    Some(ip) => ip,
                    None => {
                        let ips: Vec<SocketAddr> =
                            tokio::net::lookup_host(format!("{}:{}", self.server.host(), addr.port()))
                                .await?
                                .collect();
                        ips.first()
                            .map(|a| a.ip())
                            .ok_or_else(|| Error::IpNotFound(self.server.host()))?
                    }
                };
                SocketAddr::new(ip, addr.port())
            }
            Address::Ip(addr) => *addr,
            Address::Domain(host, port) => {
                let addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host(format!("{}:{}", host, port)).await?.collect();
                *addrs
                    .first()
                    .ok_or_else(|| Error::IpNotFound(host.clone()))?
            }
        };

        debug!(relay = %relay_addr, "socks5 udp relay address");

        let local_bind = if relay_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_bind).await?;

        let transport = Socks5UdpTransport {
            socket: Arc::new(socket),
            relay_addr,
            // RFC 1928：控制 TCP 断开时中继随之关闭；传输体持有它保活
            _control: Mutex::new(control),
        };

        let mut datagram = ChainedDatagram::with_chain(Box::new(transport), chain);
        datagram.push_inner_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// SOCKS5 UDP 中继传输：数据报带 SOCKS5 UDP 头
struct Socks5UdpTransport {
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    // RFC 1928：控制 TCP 断开时中继随之关闭；持有它保活
    _control: Mutex<ProxyStream>,
}

#[async_trait]
impl UdpTransport for Socks5UdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        // [RSV 2B=0][FRAG 1B=0][ATYP+ADDR+PORT][DATA]
        let mut buf = BytesMut::with_capacity(3 + 32 + packet.data.len());
        buf.put_slice(&[0x00, 0x00, 0x00]);
        packet.addr.encode_socks5(&mut buf);
        buf.put_slice(&packet.data);
        self.socket.send_to(&buf, self.relay_addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        loop {
            let mut buf = vec![0u8; 65535];
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.relay_addr {
                continue;
            }
            let data = &buf[..n];
            if data.len() < 4 || data[2] != 0 {
                continue; // 过短或分片，丢弃
            }
            let (addr, addr_len) = match Address::parse_socks5(&data[3..]) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let payload_start = 3 + addr_len;
            if payload_start > data.len() {
                continue;
            }
            return Ok(UdpPacket {
                addr,
                data: Bytes::copy_from_slice(&data[payload_start..]),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(port: u16) -> OutboundConfig {
        OutboundConfig {
            name: "socks-out".to_string(),
            protocol: "socks5".to_string(),
            server: Some("127.0.0.1".to_string()),
            port: Some(port),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn socks5_connect_no_auth() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 256];
            let n = sock.read(&mut req).await.unwrap();
            assert!(n >= 4);
            assert_eq!(req[0], 0x05);
            assert_eq!(req[1], CMD_CONNECT);

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();
        });

        let outbound = Socks5Outbound::new(&make_config(port)).unwrap();
        let session = Session::tcp(Address::Domain("example.com".to_string(), 80));
        let stream = outbound.connect(&DialCtx::plain(), &session).await.unwrap();
        assert_eq!(crate::proxy::ChainedStream::chain(&stream).hops(), vec!["socks-out"]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_connect_userpass_auth() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[1], 0x02); // 两种方法
            sock.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = vec![0u8; 64];
            let n = sock.read(&mut auth).await.unwrap();
            assert!(n > 2);
            assert_eq!(auth[0], 0x01);
            let ulen = auth[1] as usize;
            assert_eq!(&auth[2..2 + ulen], b"admin");
            sock.write_all(&[0x01, 0x00]).await.unwrap();

            let mut req = vec![0u8; 256];
            let _ = sock.read(&mut req).await.unwrap();
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut config = make_config(port);
        config.username = Some("admin".to_string());
        config.password = Some("secret".to_string());

        let outbound = Socks5Outbound::new(&config).unwrap();
        let session = Session::tcp(Address::Ip("1.2.3.4:443".parse().unwrap()));
        outbound.connect(&DialCtx::plain(), &session).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_refused_reply_maps_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 256];
            let _ = sock.read(&mut req).await.unwrap();
            // REP=0x05 connection refused
            sock.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let outbound = Socks5Outbound::new(&make_config(port)).unwrap();
        let session = Session::tcp(Address::Domain("example.com".to_string(), 80));
        let err = outbound
            .connect(&DialCtx::plain(), &session)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn socks5_udp_associate_relays_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // 模拟服务器的 UDP 中继口
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = vec![0u8; 256];
            let n = sock.read(&mut req).await.unwrap();
            assert!(n >= 4);
            assert_eq!(req[1], CMD_UDP_ASSOCIATE);

            // BND.ADDR = 0.0.0.0:relay_port（触发客户端用服务器 IP 替换）
            let mut reply = vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0];
            reply.extend_from_slice(&relay_port.to_be_bytes());
            sock.write_all(&reply).await.unwrap();

            // 保持控制连接
            let mut hold = [0u8; 1];
            let _ = sock.read(&mut hold).await;
        });

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, from) = relay.recv_from(&mut buf).await.unwrap();
            // 校验 SOCKS5 UDP 头，回发同一帧
            assert_eq!(&buf[..3], &[0x00, 0x00, 0x00]);
            relay.send_to(&buf[..n], from).await.unwrap();
        });

        let mut config = make_config(port);
        config.udp = true;

        let outbound = Socks5Outbound::new(&config).unwrap();
        let session = Session::udp(Address::Domain("dns.test".to_string(), 53));
        let datagram = outbound
            .connect_udp(&DialCtx::plain(), &session)
            .await
            .unwrap();

        datagram
            .send(UdpPacket {
                addr: Address::Domain("dns.test".to_string(), 53),
                data: Bytes::from_static(b"query"),
            })
            .await
            .unwrap();

        let packet = datagram.recv().await.unwrap();
        assert_eq!(&packet.data[..], b"query");
        assert_eq!(packet.addr, Address::Domain("dns.test".to_string(), 53));
    }
}
