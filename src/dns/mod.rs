pub mod cache;
pub mod client;
pub mod dhcp;
pub mod fakeip;
pub mod filters;
pub mod mapper;
pub mod resolver;
pub mod server;

use std::sync::{Arc, LazyLock, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;

pub use fakeip::FakeIpPool;
pub use mapper::HostMapper;
pub use resolver::{ResolveFlags, Resolver, ResolverHandle};

/// 单个 DNS 上游：发一问收一答
#[async_trait]
pub trait NameClient: Send + Sync {
    async fn exchange(&self, msg: &Message) -> Result<Message>;

    /// 配置里的地址串，错误信息与日志用
    fn address(&self) -> &str;
}

/// 增强模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancedMode {
    Normal,
    FakeIp,
    RedirHost,
}

impl EnhancedMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "normal" => Ok(EnhancedMode::Normal),
            "fake-ip" => Ok(EnhancedMode::FakeIp),
            "redir-host" => Ok(EnhancedMode::RedirHost),
            other => anyhow::bail!("invalid enhanced-mode: {}", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancedMode::Normal => "normal",
            EnhancedMode::FakeIp => "fake-ip",
            EnhancedMode::RedirHost => "redir-host",
        }
    }
}

static GLOBAL_RESOLVER: LazyLock<RwLock<Option<Arc<Resolver>>>> =
    LazyLock::new(|| RwLock::new(None));

/// 安装全局解析器。出站适配器直连时经由它解析域名。
pub fn set_global_resolver(resolver: Arc<Resolver>) {
    *GLOBAL_RESOLVER.write().expect("resolver slot poisoned") = Some(resolver);
}

pub fn global_resolver() -> Option<Arc<Resolver>> {
    GLOBAL_RESOLVER.read().expect("resolver slot poisoned").clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_mode_parse() {
        assert_eq!(EnhancedMode::parse("normal").unwrap(), EnhancedMode::Normal);
        assert_eq!(EnhancedMode::parse("").unwrap(), EnhancedMode::Normal);
        assert_eq!(EnhancedMode::parse("fake-ip").unwrap(), EnhancedMode::FakeIp);
        assert_eq!(
            EnhancedMode::parse("redir-host").unwrap(),
            EnhancedMode::RedirHost
        );
        assert!(EnhancedMode::parse("hosts").is_err());
    }
}
