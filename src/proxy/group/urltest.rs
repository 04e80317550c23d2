use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::common::Error;
use crate::proxy::probe::{ProxyHandle, DEAD_DELAY};
use crate::proxy::provider::ProviderSnapshot;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 自动测速组：按最近 URLTest 延迟选最快的存活子节点
pub struct UrlTestGroup {
    name: String,
    snapshot: ProviderSnapshot,
    /// 延迟差超过容差才切换，避免在两个接近的节点间抖动
    tolerance: u64,
    current: Mutex<Option<String>>,
    disable_udp: bool,
}

impl UrlTestGroup {
    pub fn new(
        name: String,
        snapshot: ProviderSnapshot,
        tolerance: u64,
        disable_udp: bool,
    ) -> Self {
        Self {
            name,
            snapshot,
            tolerance,
            current: Mutex::new(None),
            disable_udp,
        }
    }

    pub fn now(&self) -> Option<String> {
        Some(self.best(false)?.name().to_string())
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.snapshot
            .proxies(false)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn best(&self, touch: bool) -> Option<Arc<ProxyHandle>> {
        let proxies = self.snapshot.proxies(touch);
        if proxies.is_empty() {
            return None;
        }

        let fastest = proxies
            .iter()
            .filter(|p| p.last_delay() != DEAD_DELAY)
            .min_by_key(|p| p.last_delay())
            .cloned();

        let mut current = self.current.lock().expect("urltest lock poisoned");
        let chosen = match fastest {
            Some(fastest) => {
                let keep_current = current.as_deref().and_then(|name| {
                    proxies
                        .iter()
                        .find(|p| p.name() == name && p.last_delay() != DEAD_DELAY)
                        .cloned()
                });
                match keep_current {
                    Some(cur)
                        if (cur.last_delay() as u64)
                            <= fastest.last_delay() as u64 + self.tolerance =>
                    {
                        cur
                    }
                    Some(cur) => {
                        info!(
                            group = self.name.as_str(),
                            from = cur.name(),
                            to = fastest.name(),
                            delay = fastest.last_delay(),
                            "url-test switched"
                        );
                        fastest
                    }
                    None => fastest,
                }
            }
            // 无任何测速数据时退回第一个
            None => proxies.first().cloned()?,
        };

        *current = Some(chosen.name().to_string());
        Some(chosen)
    }
}

#[async_trait]
impl OutboundHandler for UrlTestGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::UrlTest
    }

    fn support_udp(&self) -> bool {
        if self.disable_udp {
            return false;
        }
        self.best(false).map(|p| p.support_udp()).unwrap_or(false)
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let child = self
            .best(true)
            .ok_or_else(|| anyhow::anyhow!("url-test '{}' has no proxies", self.name))?;
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
            .best(true)
            .ok_or_else(|| anyhow::anyhow!("url-test '{}' has no proxies", self.name))?;
        let mut datagram = child.connect_udp(ctx, session).await?;
        datagram.push_outer_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::direct::DirectOutbound;
    use crate::proxy::provider::ProxyProvider;

    fn make_group(names: &[&str], tolerance: u64) -> (UrlTestGroup, Vec<Arc<ProxyHandle>>) {
        let handles: Vec<Arc<ProxyHandle>> = names
            .iter()
            .map(|n| {
                Arc::new(ProxyHandle::new(Arc::new(DirectOutbound::new(
                    n.to_string(),
                ))))
            })
            .collect();
        let provider = ProxyProvider::new("test".to_string(), handles.clone(), String::new());
        let group = UrlTestGroup::new(
            "auto".to_string(),
            ProviderSnapshot::new(vec![provider]),
            tolerance,
            false,
        );
        (group, handles)
    }

    fn feed_delay(handle: &ProxyHandle, delay: u16) {
        handle.set_alive(true);
        handle.record(delay);
    }

    #[tokio::test]
    async fn no_samples_falls_back_to_first() {
        let (group, _handles) = make_group(&["a", "b"], 150);
        assert_eq!(group.now().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn picks_lowest_delay() {
        let (group, handles) = make_group(&["a", "b", "c"], 0);
        feed_delay(&handles[0], 300);
        feed_delay(&handles[1], 80);
        feed_delay(&handles[2], 120);
        assert_eq!(group.now().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn tolerance_prevents_flapping() {
        let (group, handles) = make_group(&["a", "b"], 150);
        feed_delay(&handles[0], 200);
        feed_delay(&handles[1], 500);
        assert_eq!(group.now().as_deref(), Some("a"));

        // b 稍快但差距在容差内：仍保持 a
        feed_delay(&handles[1], 120);
        assert_eq!(group.now().as_deref(), Some("a"));

        // b 快出容差：切换
        feed_delay(&handles[1], 10);
        assert_eq!(group.now().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn dead_current_switches_away() {
        let (group, handles) = make_group(&["a", "b"], 150);
        feed_delay(&handles[0], 50);
        feed_delay(&handles[1], 90);
        assert_eq!(group.now().as_deref(), Some("a"));

        handles[0].set_alive(false);
        assert_eq!(group.now().as_deref(), Some("b"));
    }
}
