use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::hash::{jump_hash, murmur3_32};
use crate::common::{Address, Error};
use crate::proxy::probe::ProxyHandle;
use crate::proxy::provider::ProviderSnapshot;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 一致性哈希选点的重试上限
const MAX_HASH_RETRY: u64 = 5;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    ConsistentHashing,
    RoundRobin,
}

impl LbStrategy {
    pub fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("consistent-hashing") => Ok(LbStrategy::ConsistentHashing),
            Some("round-robin") => Ok(LbStrategy::RoundRobin),
            Some(other) => anyhow::bail!("unsupported load-balance strategy: {}", other),
        }
    }
}

/// 负载均衡组
pub struct LoadBalanceGroup {
    name: String,
    snapshot: ProviderSnapshot,
    strategy: LbStrategy,
    counter: AtomicUsize,
    disable_udp: bool,
}

impl LoadBalanceGroup {
    pub fn new(
        name: String,
        snapshot: ProviderSnapshot,
        strategy: LbStrategy,
        disable_udp: bool,
    ) -> Self {
        Self {
            name,
            snapshot,
            strategy,
            counter: AtomicUsize::new(0),
            disable_udp,
        }
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.snapshot
            .proxies(false)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn pick(&self, target: &Address, touch: bool) -> Result<Arc<ProxyHandle>> {
        let proxies = self.snapshot.proxies(touch);
        if proxies.is_empty() {
            anyhow::bail!("load-balance '{}' has no proxies", self.name);
        }

        let chosen = match self.strategy {
            LbStrategy::RoundRobin => {
                // 共享计数器递增，向前扫描至多 N 步找存活节点
                let length = proxies.len();
                let start = self.counter.fetch_add(1, Ordering::Relaxed);
                (0..length)
                    .map(|i| &proxies[(start + i) % length])
                    .find(|p| p.alive())
                    .unwrap_or(&proxies[0])
                    .clone()
            }
            LbStrategy::ConsistentHashing => {
                let key = murmur3_32(hash_key(target).as_bytes()) as u64;
                let buckets = proxies.len() as i32;
                let mut chosen = None;
                for i in 0..MAX_HASH_RETRY {
                    let idx = jump_hash(key.wrapping_add(i), buckets) as usize;
                    if proxies[idx].alive() {
                        chosen = Some(proxies[idx].clone());
                        break;
                    }
                }
                chosen.unwrap_or_else(|| proxies[0].clone())
            }
        };

        debug!(group = self.name.as_str(), selected = chosen.name(), "load-balance picked");
        Ok(chosen)
    }
}

/// 一致性哈希的目标 key：IP 字面量用 host 串；域名取有效 TLD+1
fn hash_key(target: &Address) -> String {
    match target {
        Address::Ip(addr) => addr.ip().to_string(),
        Address::Domain(domain, _) => effective_tld_plus_one(domain),
    }
}

/// 近似的 eTLD+1：常见多段后缀取三段，其余取两段
fn effective_tld_plus_one(domain: &str) -> String {
    const SHARED_SECOND_LEVEL: [&str; 8] = ["co", "com", "net", "org", "gov", "edu", "ac", "mil"];

    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        return domain.to_string();
    }

    let second = labels[labels.len() - 2];
    let take = if SHARED_SECOND_LEVEL.contains(&second) && labels.len() >= 3 {
        3
    } else {
        2
    };
    labels[labels.len() - take..].join(".")
}

#[async_trait]
impl OutboundHandler for LoadBalanceGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::LoadBalance
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        let child = self.pick(&session.target, true)?;
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
        let child = self.pick(&session.target, true)?;
        let mut datagram = child.connect_udp(ctx, session).await?;
        datagram.push_outer_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
