pub mod chain;
pub mod group;
pub mod outbound;
pub mod probe;
pub mod provider;
pub mod transport;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::common::{Address, Error};

pub use chain::{Chain, ChainedDatagram, ChainedStream};
pub use probe::{DelayHistory, ProxyHandle};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// 入站类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Http,
    Socks,
    Redir,
}

/// 连接会话元数据。
///
/// 入站在接入时构造；除 `resolved_ip` 由解析器回填外，此后不再变更。
#[derive(Debug, Clone)]
pub struct Session {
    pub network: Network,
    pub inbound: InboundKind,
    pub source: Option<SocketAddr>,
    /// 目标：IP 或 域名+端口
    pub target: Address,
    /// 规则匹配前由解析器回填（目标为域名且规则需要 IP 时）
    pub resolved_ip: Option<IpAddr>,
}

impl Session {
    pub fn tcp(target: Address) -> Self {
        Self {
            network: Network::Tcp,
            inbound: InboundKind::Socks,
            source: None,
            target,
            resolved_ip: None,
        }
    }

    pub fn udp(target: Address) -> Self {
        Self {
            network: Network::Udp,
            ..Self::tcp(target)
        }
    }
}

/// 出站适配器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterKind {
    Direct,
    Reject,
    Shadowsocks,
    ShadowsocksR,
    Snell,
    Socks5,
    Http,
    Vmess,
    Trojan,
    Selector,
    Fallback,
    LoadBalance,
    UrlTest,
    Relay,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Direct => "Direct",
            AdapterKind::Reject => "Reject",
            AdapterKind::Shadowsocks => "Shadowsocks",
            AdapterKind::ShadowsocksR => "ShadowsocksR",
            AdapterKind::Snell => "Snell",
            AdapterKind::Socks5 => "Socks5",
            AdapterKind::Http => "Http",
            AdapterKind::Vmess => "Vmess",
            AdapterKind::Trojan => "Trojan",
            AdapterKind::Selector => "Selector",
            AdapterKind::Fallback => "Fallback",
            AdapterKind::LoadBalance => "LoadBalance",
            AdapterKind::UrlTest => "URLTest",
            AdapterKind::Relay => "Relay",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(
            self,
            AdapterKind::Selector
                | AdapterKind::Fallback
                | AdapterKind::LoadBalance
                | AdapterKind::UrlTest
                | AdapterKind::Relay
        )
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 随拨号调用传播的上下文槽。
///
/// 组策略把选中子节点的拨号器放进来，适配器在建立底层连接时
/// 优先使用它；槽为空时适配器经解析器解析并直连。
#[derive(Clone, Default)]
pub struct DialCtx {
    pub dialer: Option<Arc<dyn ContextDialer>>,
}

impl DialCtx {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_dialer(dialer: Arc<dyn ContextDialer>) -> Self {
        Self {
            dialer: Some(dialer),
        }
    }
}

/// 嵌套拨号器：给定网络与目标地址，产出一条带链路标记的流
#[async_trait]
pub trait ContextDialer: Send + Sync {
    async fn dial(&self, network: Network, target: &Address) -> Result<ChainedStream>;
}

/// 出站适配器 trait
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    /// 远端服务器地址（direct/reject 为 None）
    fn server_addr(&self) -> Option<Address> {
        None
    }

    fn support_udp(&self) -> bool {
        false
    }

    /// 建立 TCP 流。成功时返回的流已带上本适配器的链路 hop。
    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream>;

    /// 建立 UDP 传输。默认不支持。
    async fn connect_udp(&self, _ctx: &DialCtx, _session: &Session) -> Result<ChainedDatagram> {
        Err(Error::UnsupportedNetwork {
            adapter: self.name().to_string(),
            network: "udp".to_string(),
        }
        .into())
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// 把一个适配器当作嵌套拨号器使用（relay 组的折叠单元）
pub struct AdapterDialer {
    handler: Arc<dyn OutboundHandler>,
    ctx: DialCtx,
}

impl AdapterDialer {
    pub fn new(handler: Arc<dyn OutboundHandler>, ctx: DialCtx) -> Self {
        Self { handler, ctx }
    }
}

#[async_trait]
impl ContextDialer for AdapterDialer {
    async fn dial(&self, network: Network, target: &Address) -> Result<ChainedStream> {
        let session = match network {
            Network::Tcp => Session::tcp(target.clone()),
            Network::Udp => Session::udp(target.clone()),
        };
        self.handler.connect(&self.ctx, &session).await
    }
}
