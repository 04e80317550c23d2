use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::proxy::provider::ProviderSnapshot;
use crate::proxy::{
    AdapterDialer, AdapterKind, ChainedStream, ContextDialer, DialCtx, OutboundHandler, Session,
};

/// 链式中继组。
///
/// 把子节点折叠成嵌套拨号器：第一个子节点直接拨号，之后每个子节点都
/// 经由前一个的隧道连接自己的服务器，最后一个子节点携带真实目标。
/// UDP 不保证可用，不提供。
pub struct RelayGroup {
    name: String,
    snapshot: ProviderSnapshot,
}

impl RelayGroup {
    pub fn new(name: String, snapshot: ProviderSnapshot) -> Self {
        Self { name, snapshot }
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.snapshot
            .proxies(false)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

#[async_trait]
impl OutboundHandler for RelayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Relay
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let proxies = self.snapshot.proxies(true);
        if proxies.is_empty() {
            anyhow::bail!("relay '{}' has no proxies", self.name);
        }

        // 从外层传入的拨号器（若有）开始向右折叠
        let mut dialer: Option<Arc<dyn ContextDialer>> = ctx.dialer.clone();
        for proxy in proxies.iter() {
            let child_ctx = DialCtx { dialer };
            dialer = Some(Arc::new(AdapterDialer::new(
                proxy.clone() as Arc<dyn OutboundHandler>,
                child_ctx,
            )));
        }

        // 折叠结果必然存在（proxies 非空）
        let dialer = dialer.expect("relay fold yielded no dialer");
        debug!(group = self.name.as_str(), hops = proxies.len(), "relay dialing");
        let mut stream = dialer.dial(session.network, &session.target).await?;
        stream.push_outer_hop(&self.name);
        Ok(stream)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
