//! DNS 传输客户端：UDP / TCP / DoT / DoH / DHCP 学习。

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::Error;

use super::NameClient;

/// 单次查询的传输层超时
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// 解析 nameserver 配置串并构建客户端。
///
/// 支持的形式：`udp://ip[:port]`、`tcp://ip[:port]`、`tls://host[:port]`、
/// `https://host/path`、`dhcp://iface`；裸 IP 视作 UDP。
/// `bootstrap` 用来解出 DoT/DoH 服务器自身的域名。
pub async fn build_client(
    server: &str,
    bootstrap: &[Arc<dyn NameClient>],
) -> Result<Arc<dyn NameClient>> {
    if let Some(rest) = server.strip_prefix("udp://") {
        let addr = parse_host_port(rest, 53)?;
        let addr = resolve_endpoint(addr, bootstrap).await?;
        Ok(Arc::new(UdpClient::new(server.to_string(), addr)))
    } else if let Some(rest) = server.strip_prefix("tcp://") {
        let addr = parse_host_port(rest, 53)?;
        let addr = resolve_endpoint(addr, bootstrap).await?;
        Ok(Arc::new(TcpClient::new(server.to_string(), addr)))
    } else if let Some(rest) = server.strip_prefix("tls://") {
        let (host, port) = split_host_port(rest, 853)?;
        let addr = resolve_endpoint(Endpoint { host: host.clone(), port }, bootstrap).await?;
        Ok(Arc::new(TlsClient::new(server.to_string(), addr, host)?))
    } else if server.starts_with("https://") {
        Ok(Arc::new(
            HttpsClient::new(server.to_string(), bootstrap).await?,
        ))
    } else if let Some(iface) = server.strip_prefix("dhcp://") {
        Ok(Arc::new(DhcpClient::new(server.to_string(), iface.to_string())))
    } else {
        // 裸 IP（或 ip:port）按 UDP 处理
        let addr = parse_host_port(server, 53)?;
        let addr = resolve_endpoint(addr, bootstrap).await?;
        Ok(Arc::new(UdpClient::new(server.to_string(), addr)))
    }
}

pub async fn build_clients(
    servers: &[String],
    bootstrap: &[Arc<dyn NameClient>],
) -> Result<Vec<Arc<dyn NameClient>>> {
    let mut clients = Vec::with_capacity(servers.len());
    for server in servers {
        clients.push(build_client(server, bootstrap).await?);
    }
    Ok(clients)
}

struct Endpoint {
    host: String,
    port: u16,
}

fn parse_host_port(s: &str, default_port: u16) -> Result<Endpoint> {
    let (host, port) = split_host_port(s, default_port)?;
    Ok(Endpoint { host, port })
}

fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok((ip.to_string(), default_port));
    }
    if let Some((host, port_str)) = s.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }
    if s.is_empty() {
        anyhow::bail!("empty nameserver address");
    }
    Ok((s.to_string(), default_port))
}

/// 把 host:port 解成 SocketAddr；域名 host 先走 bootstrap 上游
async fn resolve_endpoint(
    endpoint: Endpoint,
    bootstrap: &[Arc<dyn NameClient>],
) -> Result<SocketAddr> {
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, endpoint.port));
    }

    if !bootstrap.is_empty() {
        if let Some(ip) = bootstrap_lookup(&endpoint.host, bootstrap).await {
            return Ok(SocketAddr::new(ip, endpoint.port));
        }
    }

    // 兜底：系统解析
    tokio::net::lookup_host(format!("{}:{}", endpoint.host, endpoint.port))
        .await?
        .next()
        .ok_or_else(|| Error::IpNotFound(endpoint.host).into())
}

async fn bootstrap_lookup(host: &str, bootstrap: &[Arc<dyn NameClient>]) -> Option<IpAddr> {
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    let name = Name::from_str(&format!("{}.", host)).ok()?;
    let mut query = Message::new();
    query.set_id(rand::random());
    query.set_recursion_desired(true);
    query.add_query(hickory_proto::op::Query::query(name, RecordType::A));

    for client in bootstrap {
        if let Ok(reply) = client.exchange(&query).await {
            for record in reply.answers() {
                if let Some(hickory_proto::rr::RData::A(a)) = record.data() {
                    return Some(IpAddr::V4(a.0));
                }
            }
        }
    }
    None
}

/// UDP 客户端；响应截断时用 TCP 重试
pub struct UdpClient {
    address: String,
    server: SocketAddr,
}

impl UdpClient {
    pub fn new(address: String, server: SocketAddr) -> Self {
        Self { address, server }
    }
}

#[async_trait]
impl NameClient for UdpClient {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let bind = if self.server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;

        let wire = msg.to_vec()?;
        socket.send(&wire).await?;

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(DNS_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::DnsTimeout(self.address.clone()))??;

        let reply = Message::from_vec(&buf[..n])?;
        if reply.truncated() {
            // TC 位：换 TCP 重发同一问题
            debug!(server = self.address.as_str(), "udp reply truncated, retrying over tcp");
            return TcpClient::new(self.address.clone(), self.server)
                .exchange(msg)
                .await;
        }
        Ok(reply)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// TCP 客户端：2 字节长度前缀帧
pub struct TcpClient {
    address: String,
    server: SocketAddr,
}

impl TcpClient {
    pub fn new(address: String, server: SocketAddr) -> Self {
        Self { address, server }
    }
}

async fn exchange_framed(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    msg: &Message,
) -> Result<Message> {
    let wire = msg.to_vec()?;
    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);
    stream.write_all(&framed).await?;

    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

#[async_trait]
impl NameClient for TcpClient {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let fut = async {
            let mut stream = TcpStream::connect(self.server).await?;
            exchange_framed(&mut stream, msg).await
        };
        tokio::time::timeout(DNS_TIMEOUT, fut)
            .await
            .map_err(|_| Error::DnsTimeout(self.address.clone()))?
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// DoT 客户端（RFC 7858，ALPN "dns"）
pub struct TlsClient {
    address: String,
    server: SocketAddr,
    server_name: rustls::pki_types::ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

impl TlsClient {
    pub fn new(address: String, server: SocketAddr, sni: String) -> Result<Self> {
        // ALPN 标识见 RFC 7858
        let options = crate::common::tls::TlsOptions::for_host(sni).with_alpn(&["dns"]);
        let (connector, server_name) = crate::common::tls::connector(&options)?;
        Ok(Self {
            address,
            server,
            server_name,
            connector,
        })
    }
}

#[async_trait]
impl NameClient for TlsClient {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let fut = async {
            let tcp = TcpStream::connect(self.server).await?;
            let mut tls = self
                .connector
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(|e| Error::TlsFailure(e.to_string()))?;
            exchange_framed(&mut tls, msg).await
        };
        tokio::time::timeout(DNS_TIMEOUT, fut)
            .await
            .map_err(|_| Error::DnsTimeout(self.address.clone()))?
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// DoH 客户端（RFC 8484，POST application/dns-message）
pub struct HttpsClient {
    address: String,
    url: String,
    client: reqwest::Client,
}

impl HttpsClient {
    pub async fn new(url: String, bootstrap: &[Arc<dyn NameClient>]) -> Result<Self> {
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| anyhow::anyhow!("invalid DoH URL '{}': {}", url, e))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("DoH URL missing host: {}", url))?
            .to_string();
        let port = parsed.port().unwrap_or(443);

        let mut builder = reqwest::Client::builder().timeout(DNS_TIMEOUT);

        // 服务器域名用 bootstrap 上游解出并钉住，避免自举循环
        if host.parse::<IpAddr>().is_err() && !bootstrap.is_empty() {
            if let Some(ip) = bootstrap_lookup(&host, bootstrap).await {
                builder = builder.resolve(&host, SocketAddr::new(ip, port));
            }
        }

        Ok(Self {
            address: url.clone(),
            url,
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl NameClient for HttpsClient {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let wire = msg.to_vec()?;
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(wire)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::RemoteCode(response.status().as_u16()).into());
        }

        let body = response.bytes().await?;
        Ok(Message::from_vec(&body)?)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// 学习间隔：一段时间内复用已发现的系统 DNS
const DHCP_RELEARN_INTERVAL: Duration = Duration::from_secs(20);

/// DHCP 客户端：向指定网卡当前获得的系统 DNS 转发查询
pub struct DhcpClient {
    address: String,
    iface: String,
    learned: Mutex<Option<(Instant, Vec<Arc<UdpClient>>)>>,
}

impl DhcpClient {
    pub fn new(address: String, iface: String) -> Self {
        Self {
            address,
            iface,
            learned: Mutex::new(None),
        }
    }

    async fn clients(&self) -> Result<Vec<Arc<UdpClient>>> {
        let mut learned = self.learned.lock().await;
        if let Some((at, clients)) = learned.as_ref() {
            if at.elapsed() < DHCP_RELEARN_INTERVAL && !clients.is_empty() {
                return Ok(clients.clone());
            }
        }

        let iface = if self.iface.is_empty() || self.iface == "auto" {
            None
        } else {
            Some(self.iface.as_str())
        };
        let servers = super::dhcp::system_dns_servers(iface)?;
        let clients: Vec<Arc<UdpClient>> = servers
            .into_iter()
            .map(|ip| {
                Arc::new(UdpClient::new(
                    format!("udp://{}:53", ip),
                    SocketAddr::new(ip, 53),
                ))
            })
            .collect();

        debug!(iface = self.iface.as_str(), count = clients.len(), "dhcp nameservers learned");
        *learned = Some((Instant::now(), clients.clone()));
        Ok(clients)
    }
}

#[async_trait]
impl NameClient for DhcpClient {
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let clients = self.clients().await?;
        let mut last_err: Option<anyhow::Error> = None;
        for client in clients {
            match client.exchange(msg).await {
                Ok(reply) => return Ok(reply),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::DnsUpstreamFailure("no dhcp nameservers".to_string()).into()))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn make_query(host: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(host).unwrap(), qtype));
        msg
    }

    /// 单次应答的 mock UDP 上游
    async fn run_udp_upstream(socket: UdpSocket, answer_ip: std::net::Ipv4Addr) {
        let mut buf = vec![0u8; 4096];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        let query = Message::from_vec(&buf[..n]).unwrap();

        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_message_type(hickory_proto::op::MessageType::Response);
        reply.set_response_code(ResponseCode::NoError);
        for q in query.queries() {
            reply.add_query(q.clone());
            reply.add_answer(Record::from_rdata(q.name().clone(), 300, RData::A(A(answer_ip))));
        }
        socket.send_to(&reply.to_vec().unwrap(), from).await.unwrap();
    }

    #[tokio::test]
    async fn udp_client_exchange() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(run_udp_upstream(upstream, "1.2.3.4".parse().unwrap()));

        let client = UdpClient::new(format!("udp://{}", addr), addr);
        let reply = client
            .exchange(&make_query("example.com.", RecordType::A))
            .await
            .unwrap();

        assert_eq!(reply.id(), 0x1234);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn tcp_client_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = sock.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            sock.read_exact(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf).unwrap();

            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(hickory_proto::op::MessageType::Response);
            for q in query.queries() {
                reply.add_query(q.clone());
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    60,
                    RData::A(A("5.6.7.8".parse().unwrap())),
                ));
            }
            let wire = reply.to_vec().unwrap();
            sock.write_all(&(wire.len() as u16).to_be_bytes()).await.unwrap();
            sock.write_all(&wire).await.unwrap();
        });

        let client = TcpClient::new(format!("tcp://{}", addr), addr);
        let reply = client
            .exchange(&make_query("example.com.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn udp_truncated_falls_back_to_tcp() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        // UDP 侧回截断响应
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(hickory_proto::op::MessageType::Response);
            reply.set_truncated(true);
            for q in query.queries() {
                reply.add_query(q.clone());
            }
            upstream.send_to(&reply.to_vec().unwrap(), from).await.unwrap();
        });

        // 同端口的 TCP 侧给完整响应
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = sock.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            sock.read_exact(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf).unwrap();

            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(hickory_proto::op::MessageType::Response);
            for q in query.queries() {
                reply.add_query(q.clone());
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    60,
                    RData::A(A("9.9.9.9".parse().unwrap())),
                ));
            }
            let wire = reply.to_vec().unwrap();
            sock.write_all(&(wire.len() as u16).to_be_bytes()).await.unwrap();
            sock.write_all(&wire).await.unwrap();
        });

        let client = UdpClient::new(format!("udp://{}", addr), addr);
        let reply = client
            .exchange(&make_query("big.example.com.", RecordType::A))
            .await
            .unwrap();
        assert!(!reply.truncated());
        assert_eq!(reply.answers().len(), 1);
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(
            split_host_port("1.1.1.1", 53).unwrap(),
            ("1.1.1.1".to_string(), 53)
        );
        assert_eq!(
            split_host_port("1.1.1.1:5353", 53).unwrap(),
            ("1.1.1.1".to_string(), 5353)
        );
        assert_eq!(
            split_host_port("dns.example.com:853", 853).unwrap(),
            ("dns.example.com".to_string(), 853)
        );
        assert_eq!(
            split_host_port("[2606:4700:4700::1111]", 853).unwrap(),
            ("2606:4700:4700::1111".to_string(), 853)
        );
        assert!(split_host_port("", 53).is_err());
    }

    #[tokio::test]
    async fn build_client_recognizes_schemes() {
        let udp = build_client("udp://127.0.0.1:53", &[]).await.unwrap();
        assert_eq!(udp.address(), "udp://127.0.0.1:53");

        let tcp = build_client("tcp://127.0.0.1", &[]).await.unwrap();
        assert_eq!(tcp.address(), "tcp://127.0.0.1");

        let tls = build_client("tls://1.1.1.1:853", &[]).await.unwrap();
        assert_eq!(tls.address(), "tls://1.1.1.1:853");

        let dhcp = build_client("dhcp://auto", &[]).await.unwrap();
        assert_eq!(dhcp.address(), "dhcp://auto");

        let bare = build_client("223.5.5.5", &[]).await.unwrap();
        assert_eq!(bare.address(), "223.5.5.5");
    }
}
