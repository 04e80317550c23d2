pub mod protocol;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, ProxyStream, UdpPacket, UdpTransport};
use crate::config::OutboundConfig;
use crate::proxy::transport::StreamTransform;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// Trojan 出站。默认走 TLS（协议即伪装 HTTPS）。
pub struct TrojanOutbound {
    name: String,
    server: Address,
    password_hash: String,
    udp: bool,
    transform: StreamTransform,
    dialer: Dialer,
}

impl TrojanOutbound {
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        let server = Address::Domain(config.require_server()?.to_string(), config.require_port()?);
        let password = config
            .password
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("trojan '{}' missing 'password'", config.name))?;

        // trojan 缺省强制 TLS；SNI 未配置时用服务器域名
        let mut transport_config = config.transport();
        transport_config.tls = true;
        if transport_config.sni.is_none() {
            transport_config.sni = Some(server.host());
        }
        let transform = StreamTransform::from_config(&server.host(), &transport_config)?;

        Ok(Self {
            name: config.name.clone(),
            server,
            password_hash: protocol::password_hash(password),
            udp: config.udp,
            transform,
            dialer: super::outbound_dialer(config),
        })
    }

    async fn open(&self, ctx: &DialCtx, target: &Address, cmd: u8) -> Result<ChainedStream> {
        let transport = super::dial_server(ctx, &self.dialer, &self.server).await?;
        let (inner, chain) = transport.into_parts();
        let mut stream = self.transform.apply(inner).await?;

        protocol::write_request(&mut stream, &self.password_hash, target, cmd).await?;
        Ok(ChainedStream::with_chain(stream, chain))
    }
}

#[async_trait]
impl OutboundHandler for TrojanOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Trojan
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, server = %self.server, "trojan connecting");
        let mut stream = self
            .open(ctx, &session.target, protocol::CMD_CONNECT)
            .await?;
        stream.push_inner_hop(&self.name);
        debug!(target = %session.target, "trojan tunnel established");
        Ok(stream)
    }

    async fn connect_udp(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        debug!(target = %session.target, server = %self.server, "trojan udp associate");
        let stream = self
            .open(ctx, &session.target, protocol::CMD_UDP_ASSOCIATE)
            .await?;
        let (inner, chain) = stream.into_parts();

        let transport = TrojanUdpTransport {
            stream: Mutex::new(inner),
        };
        let mut datagram = ChainedDatagram::with_chain(Box::new(transport), chain);
        datagram.push_inner_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Trojan UDP：经 TLS 流收发 UDP 帧
struct TrojanUdpTransport {
    stream: Mutex<ProxyStream>,
}

#[async_trait]
impl UdpTransport for TrojanUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let mut stream = self.stream.lock().await;
        protocol::write_udp_frame(&mut *stream, &packet.addr, &packet.data).await
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut stream = self.stream.lock().await;
        let (addr, data) = protocol::read_udp_frame(&mut *stream).await?;
        Ok(UdpPacket {
            addr,
            data: data.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_password_rejected() {
        let config = OutboundConfig {
            name: "t".to_string(),
            protocol: "trojan".to_string(),
            server: Some("example.com".to_string()),
            port: Some(443),
            ..Default::default()
        };
        assert!(TrojanOutbound::new(&config).is_err());
    }

    #[test]
    fn tls_forced_with_server_sni() {
        let config = OutboundConfig {
            name: "t".to_string(),
            protocol: "trojan".to_string(),
            server: Some("example.com".to_string()),
            port: Some(443),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        // TLS 强制开启（构造成功即表示 transform 含 TLS 层）
        assert!(TrojanOutbound::new(&config).is_ok());
    }
}
