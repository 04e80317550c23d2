use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::{GroupConfig, OutboundConfig};
use crate::proxy::group;
use crate::proxy::group::fallback::FallbackGroup;
use crate::proxy::group::loadbalance::LoadBalanceGroup;
use crate::proxy::group::relay::RelayGroup;
use crate::proxy::group::selector::SelectorGroup;
use crate::proxy::group::urltest::UrlTestGroup;
use crate::proxy::outbound::{build_outbound, direct::DirectOutbound, reject::RejectOutbound};
use crate::proxy::probe::{DelayHistory, ProxyHandle};
use crate::proxy::provider::ProxyProvider;
use crate::proxy::OutboundHandler;

/// 观测面的单代理快照
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<String>>,
    pub history: Vec<DelayHistory>,
}

/// 出站注册表：适配器 + 组，统一经探针句柄暴露
pub struct OutboundManager {
    handlers: HashMap<String, Arc<ProxyHandle>>,
    providers: HashMap<String, Arc<ProxyProvider>>,
}

impl OutboundManager {
    pub fn new(outbounds: &[OutboundConfig], groups: &[GroupConfig]) -> Result<Self> {
        let mut handlers: HashMap<String, Arc<ProxyHandle>> = HashMap::new();

        // 内置出站
        handlers.insert(
            "DIRECT".to_string(),
            Arc::new(ProxyHandle::new(Arc::new(DirectOutbound::new(
                "DIRECT".to_string(),
            )))),
        );
        handlers.insert(
            "REJECT".to_string(),
            Arc::new(ProxyHandle::new(Arc::new(RejectOutbound::new(
                "REJECT".to_string(),
            )))),
        );

        // 配置出站；名字在一份配置里必须唯一
        for config in outbounds {
            if handlers.contains_key(&config.name) {
                anyhow::bail!("duplicate outbound name: '{}'", config.name);
            }
            let handler = build_outbound(config)?;
            handlers.insert(config.name.clone(), Arc::new(ProxyHandle::new(handler)));
        }

        let providers: HashMap<String, Arc<ProxyProvider>> = HashMap::new();

        // 组按声明顺序构建，后面的组可以引用前面的
        let built = group::build_proxy_groups(groups, &handlers, &providers)?;
        for (name, handler) in built {
            if handlers.contains_key(&name) {
                anyhow::bail!("duplicate proxy-group name: '{}'", name);
            }
            info!(name = name.as_str(), "proxy group registered");
            handlers.insert(name, Arc::new(ProxyHandle::new(handler)));
        }

        Ok(Self {
            handlers,
            providers,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyHandle>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn provider(&self, name: &str) -> Option<Arc<ProxyProvider>> {
        self.providers.get(name).cloned()
    }

    /// 切换 selector 组的选中代理
    pub fn select(&self, group_name: &str, proxy_name: &str) -> bool {
        let Some(handle) = self.handlers.get(group_name) else {
            return false;
        };
        match handle.adapter().as_any().downcast_ref::<SelectorGroup>() {
            Some(selector) => selector.select(proxy_name),
            None => false,
        }
    }

    /// 主动对某个代理执行一次 URLTest
    pub async fn url_test(&self, name: &str, url: &str, timeout: Duration) -> Option<u16> {
        let handle = self.handlers.get(name)?;
        handle.url_test(url, timeout).await.ok()
    }

    /// 组的当前生效子节点（load-balance/relay 无固定选中）
    pub fn group_now(&self, name: &str) -> Option<String> {
        let handle = self.handlers.get(name)?;
        let any = handle.adapter().as_any();
        if let Some(selector) = any.downcast_ref::<SelectorGroup>() {
            return selector.now();
        }
        if let Some(fallback) = any.downcast_ref::<FallbackGroup>() {
            return fallback.now();
        }
        if let Some(urltest) = any.downcast_ref::<UrlTestGroup>() {
            return urltest.now();
        }
        None
    }

    fn group_all(&self, handle: &ProxyHandle) -> Option<Vec<String>> {
        let any = handle.adapter().as_any();
        if let Some(group) = any.downcast_ref::<SelectorGroup>() {
            return Some(group.proxy_names());
        }
        if let Some(group) = any.downcast_ref::<FallbackGroup>() {
            return Some(group.proxy_names());
        }
        if let Some(group) = any.downcast_ref::<UrlTestGroup>() {
            return Some(group.proxy_names());
        }
        if let Some(group) = any.downcast_ref::<LoadBalanceGroup>() {
            return Some(group.proxy_names());
        }
        if let Some(group) = any.downcast_ref::<RelayGroup>() {
            return Some(group.proxy_names());
        }
        None
    }

    pub fn snapshot(&self, name: &str) -> Option<ProxySnapshot> {
        let handle = self.handlers.get(name)?;
        Some(ProxySnapshot {
            name: name.to_string(),
            kind: handle.kind().as_str().to_string(),
            udp: handle.support_udp(),
            now: self.group_now(name),
            all: self.group_all(handle),
            history: handle.delay_history(),
        })
    }

    pub fn snapshots(&self) -> Vec<ProxySnapshot> {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }
}
