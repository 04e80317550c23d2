use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::Error;
use crate::proxy::probe::ProxyHandle;
use crate::proxy::provider::ProviderSnapshot;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 故障转移组：按声明顺序取第一个存活的子节点
pub struct FallbackGroup {
    name: String,
    snapshot: ProviderSnapshot,
    disable_udp: bool,
}

impl FallbackGroup {
    pub fn new(name: String, snapshot: ProviderSnapshot, disable_udp: bool) -> Self {
        Self {
            name,
            snapshot,
            disable_udp,
        }
    }

    /// 第一个存活的子节点；全部死亡时退回第一个（让失败显式暴露）
    fn first_available(&self, touch: bool) -> Option<Arc<ProxyHandle>> {
        let proxies = self.snapshot.proxies(touch);
        proxies
            .iter()
            .find(|p| p.alive())
            .cloned()
            .or_else(|| proxies.first().cloned())
    }

    pub fn now(&self) -> Option<String> {
        Some(self.first_available(false)?.name().to_string())
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
impl OutboundHandler for FallbackGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Fallback
    }

    fn support_udp(&self) -> bool {
        if self.disable_udp {
            return false;
        }
        self.first_available(false)
            .map(|p| p.support_udp())
            .unwrap_or(false)
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let child = self
            .first_available(true)
            .ok_or_else(|| anyhow::anyhow!("fallback '{}' has no proxies", self.name))?;
        debug!(group = self.name.as_str(), selected = child.name(), "fallback dialing");
        let mut stream = child.connect(ctx, session).await?;
        stream.push_outer_hop(&self.name);
        Ok(stream)
    }

    async fn connect_udp(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        if self.disable_udp {
            return Err(Error::UnsupportedNetwork {
                adapter: self.name.clone(),
                network: "udp".to_string(),
            }
            .into());
        }
        let child = self
            .first_available(true)
            .ok_or_else(|| anyhow::anyhow!("fallback '{}' has no proxies", self.name))?;
        let mut datagram = child.connect_udp(ctx, session).await?;
        datagram.push_outer_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
