//! Host Mapper：规则层做 IP→域名 反查的唯一入口。

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{EnhancedMode, FakeIpPool};

/// 反向映射容量
const MAPPING_CAPACITY: usize = 4096;

/// TTL 受限的 ip→域名 LRU
pub struct ReverseMapping {
    inner: Mutex<ReverseInner>,
    capacity: usize,
}

struct ReverseInner {
    entries: HashMap<String, (String, Instant)>,
    order: VecDeque<String>,
}

impl ReverseMapping {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReverseInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn insert(&self, ip: IpAddr, host: String, ttl: Duration) {
        let key = ip.to_string();
        let mut inner = self.inner.lock().expect("mapping lock poisoned");
        inner.entries.insert(key.clone(), (host, Instant::now() + ttl));

        if let Some(pos) = inner.order.iter().position(|k| *k == key) {
            inner.order.remove(pos);
        }
        inner.order.push_back(key);

        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, ip: IpAddr) -> Option<String> {
        let key = ip.to_string();
        let mut inner = self.inner.lock().expect("mapping lock poisoned");
        let expired = match inner.entries.get(&key) {
            Some((_, expires)) => *expires <= Instant::now(),
            None => return None,
        };
        if expired {
            inner.entries.remove(&key);
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
            return None;
        }
        inner.entries.get(&key).map(|(host, _)| host.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mapping lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 规则引擎消费的映射视图：合成 IP 判定与 IP→域名 反查
pub struct HostMapper {
    mode: EnhancedMode,
    fake_pool: Option<Arc<FakeIpPool>>,
    mapping: Option<ReverseMapping>,
}

impl HostMapper {
    pub fn new(mode: EnhancedMode, fake_pool: Option<Arc<FakeIpPool>>) -> Self {
        let mapping = if mode == EnhancedMode::Normal {
            None
        } else {
            Some(ReverseMapping::new(MAPPING_CAPACITY))
        };
        Self {
            mode,
            fake_pool,
            mapping,
        }
    }

    pub fn fake_ip_enabled(&self) -> bool {
        self.mode == EnhancedMode::FakeIp
    }

    pub fn mapping_enabled(&self) -> bool {
        matches!(self.mode, EnhancedMode::FakeIp | EnhancedMode::RedirHost)
    }

    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        if !self.fake_ip_enabled() {
            return false;
        }
        self.fake_pool
            .as_ref()
            .map(|pool| pool.exist(ip))
            .unwrap_or(false)
    }

    /// 先查 fake-ip 池，再查反向映射
    pub fn resolve_host(&self, ip: IpAddr) -> Option<String> {
        if let Some(pool) = &self.fake_pool {
            if let Some(host) = pool.look_back(ip) {
                return Some(host);
            }
        }
        self.mapping.as_ref()?.get(ip)
    }

    /// 记录一条应答 IP → 域名 映射（redir-host 模式的记录器）
    pub fn record(&self, ip: IpAddr, host: &str, ttl: Duration) {
        if let Some(mapping) = &self.mapping {
            mapping.insert(ip, host.trim_end_matches('.').to_string(), ttl);
        }
    }

    pub fn fake_pool(&self) -> Option<&Arc<FakeIpPool>> {
        self.fake_pool.as_ref()
    }
}
