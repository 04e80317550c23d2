use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::common::Error;
use crate::proxy::probe::ProxyHandle;
use crate::proxy::provider::ProviderSnapshot;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 手动选择组
pub struct SelectorGroup {
    name: String,
    snapshot: ProviderSnapshot,
    selected: Mutex<Option<String>>,
    disable_udp: bool,
}

impl SelectorGroup {
    pub fn new(name: String, snapshot: ProviderSnapshot, disable_udp: bool) -> Self {
        Self {
            name,
            snapshot,
            selected: Mutex::new(None),
            disable_udp,
        }
    }

    /// 切换选中代理；名字不在成员里返回 false
    pub fn select(&self, proxy_name: &str) -> bool {
        let proxies = self.snapshot.proxies(false);
        if !proxies.iter().any(|p| p.name() == proxy_name) {
            return false;
        }
        *self.selected.lock().expect("selector lock poisoned") = Some(proxy_name.to_string());
        // 切换后作废快照，让所有调用方立即看到新的选择
        self.snapshot.invalidate();
        info!(group = self.name.as_str(), selected = proxy_name, "selector switched");
        true
    }

    /// 当前生效的子节点
    pub fn now(&self) -> Option<String> {
        Some(self.current()?.name().to_string())
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.snapshot
            .proxies(false)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn current(&self) -> Option<Arc<ProxyHandle>> {
        let proxies = self.snapshot.proxies(true);
        let selected = self.selected.lock().expect("selector lock poisoned").clone();
        match selected {
            Some(name) => proxies
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .or_else(|| proxies.first().cloned()),
            None => proxies.first().cloned(),
        }
    }
}

#[async_trait]
impl OutboundHandler for SelectorGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Selector
    }

    fn support_udp(&self) -> bool {
        if self.disable_udp {
            return false;
        }
        self.current().map(|p| p.support_udp()).unwrap_or(false)
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let child = self
            .current()
            .ok_or_else(|| anyhow::anyhow!("selector '{}' has no proxies", self.name))?;
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
            .current()
            .ok_or_else(|| anyhow::anyhow!("selector '{}' has no proxies", self.name))?;
        let mut datagram = child.connect_udp(ctx, session).await?;
        datagram.push_outer_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
