//! Fake-IP 池：域名 ⇔ 合成 IPv4 双向映射，LRU 回收。

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use anyhow::Result;
use ipnet::Ipv4Net;
use tracing::debug;

/// 网络地址与网关各占一个，分配从 base+2 开始
const RESERVED_HEAD: u32 = 2;

/// Fake-IP 池。
///
/// 在配置的 CIDR 内为域名分配合成 IP；地址耗尽时从最久未用的
/// 绑定回收。`filter` 里的域名（后缀匹配）永不合成。
pub struct FakeIpPool {
    base: u32,
    size: u32,
    filter: Vec<String>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    next_offset: u32,
    host_to_ip: HashMap<String, u32>,
    ip_to_host: HashMap<u32, String>,
    // 队尾最新
    order: VecDeque<u32>,
}

impl FakeIpPool {
    pub fn new(cidr: &str, filter: Vec<String>) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid fake-ip-range '{}': {}", cidr, e))?;
        let base = u32::from(net.network());
        let total = if net.prefix_len() >= 31 {
            0
        } else {
            (1u32 << (32 - net.prefix_len())).saturating_sub(RESERVED_HEAD + 1)
        };
        if total == 0 {
            anyhow::bail!("fake-ip-range '{}' is too small", cidr);
        }

        Ok(Self {
            base,
            size: total,
            filter: filter.into_iter().map(|s| s.to_lowercase()).collect(),
            inner: Mutex::new(PoolInner {
                next_offset: 0,
                host_to_ip: HashMap::new(),
                ip_to_host: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    /// 网关地址（池首个可用地址之前的保留位）
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base.wrapping_add(1))
    }

    /// 域名在"永不合成"名单里吗（后缀匹配）
    pub fn is_filtered(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        let host = host.trim_end_matches('.');
        self.filter.iter().any(|suffix| {
            host == suffix || host.ends_with(&format!(".{}", suffix))
        })
    }

    /// 取域名的合成 IP；已有绑定则返回原值并刷新 LRU 位次
    pub fn lookup(&self, host: &str) -> Ipv4Addr {
        let host = host.to_lowercase().trim_end_matches('.').to_string();
        let mut inner = self.inner.lock().expect("fakeip lock poisoned");

        let existing = inner.host_to_ip.get(&host).copied();
        if let Some(offset) = existing {
            touch(&mut inner.order, offset);
            return self.ip_at(offset);
        }

        let offset = if inner.next_offset < self.size {
            let offset = inner.next_offset;
            inner.next_offset += 1;
            offset
        } else {
            // 地址耗尽：回收最久未用的绑定
            let oldest = inner
                .order
                .pop_front()
                .expect("exhausted pool must have live bindings");
            if let Some(old_host) = inner.ip_to_host.remove(&oldest) {
                inner.host_to_ip.remove(&old_host);
                debug!(host = old_host.as_str(), "fake-ip binding recycled");
            }
            oldest
        };

        inner.host_to_ip.insert(host.clone(), offset);
        inner.ip_to_host.insert(offset, host.clone());
        inner.order.push_back(offset);

        let ip = self.ip_at(offset);
        debug!(host = host.as_str(), ip = %ip, "fake-ip allocated");
        ip
    }

    /// 反查：合成 IP → 域名
    pub fn look_back(&self, ip: IpAddr) -> Option<String> {
        let offset = self.offset_of(ip)?;
        let inner = self.inner.lock().expect("fakeip lock poisoned");
        inner.ip_to_host.get(&offset).cloned()
    }

    /// IP 落在池的 CIDR 内吗
    pub fn exist(&self, ip: IpAddr) -> bool {
        self.offset_of(ip).is_some()
    }

    /// 从上一个实例接管已有绑定（配置相同时的热切换）。
    /// 尽力而为：仅迁移本池还未占用的条目。
    pub fn patch(&self, previous: &FakeIpPool) {
        if self.base != previous.base || self.size != previous.size {
            return;
        }

        let prev = previous.inner.lock().expect("fakeip lock poisoned");
        let mut inner = self.inner.lock().expect("fakeip lock poisoned");

        for (&offset, host) in prev.ip_to_host.iter() {
            if inner.ip_to_host.contains_key(&offset) || inner.host_to_ip.contains_key(host) {
                continue;
            }
            inner.host_to_ip.insert(host.clone(), offset);
            inner.ip_to_host.insert(offset, host.clone());
            inner.order.push_back(offset);
            if offset >= inner.next_offset {
                inner.next_offset = offset + 1;
            }
        }
        debug!(count = inner.ip_to_host.len(), "fake-ip pool patched from previous instance");
    }

    fn ip_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.base.wrapping_add(RESERVED_HEAD).wrapping_add(offset))
    }

    fn offset_of(&self, ip: IpAddr) -> Option<u32> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };
        let value = u32::from(v4);
        let first = self.base.wrapping_add(RESERVED_HEAD);
        if value < first || value >= first.wrapping_add(self.size) {
            return None;
        }
        Some(value - first)
    }
}

fn touch(order: &mut VecDeque<u32>, offset: u32) {
    if let Some(pos) = order.iter().position(|&o| o == offset) {
        order.remove(pos);
    }
    order.push_back(offset);
}
