pub mod fallback;
pub mod loadbalance;
pub mod relay;
pub mod selector;
pub mod urltest;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::config::GroupConfig;
use crate::proxy::probe::ProxyHandle;
use crate::proxy::provider::{ProviderSnapshot, ProxyProvider};
use crate::proxy::OutboundHandler;

/// 构建代理组，返回 (name, handler) 列表。
/// `existing` 含已注册的出站与先前批次建好的组；`providers` 是共享的命名 provider。
pub fn build_proxy_groups(
    configs: &[GroupConfig],
    existing: &HashMap<String, Arc<ProxyHandle>>,
    providers: &HashMap<String, Arc<ProxyProvider>>,
) -> Result<Vec<(String, Arc<dyn OutboundHandler>)>> {
    let mut result: Vec<(String, Arc<dyn OutboundHandler>)> = Vec::new();
    let mut built: HashMap<String, Arc<ProxyHandle>> = HashMap::new();

    for config in configs {
        let mut group_providers: Vec<Arc<ProxyProvider>> = Vec::new();

        // 组内直接引用的代理打包成一个匿名 provider
        if !config.proxies.is_empty() {
            let mut handles: Vec<Arc<ProxyHandle>> = Vec::new();
            for name in &config.proxies {
                let handle = existing
                    .get(name)
                    .or_else(|| built.get(name))
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "proxy-group '{}' references unknown proxy '{}'",
                            config.name,
                            name
                        )
                    })?;
                handles.push(handle.clone());
            }
            group_providers.push(ProxyProvider::new(
                format!("group:{}", config.name),
                handles,
                config.url.clone(),
            ));
        }

        for provider_name in &config.providers {
            let provider = providers.get(provider_name).ok_or_else(|| {
                anyhow::anyhow!(
                    "proxy-group '{}' references unknown provider '{}'",
                    config.name,
                    provider_name
                )
            })?;
            group_providers.push(provider.clone());
        }

        if group_providers.is_empty() {
            anyhow::bail!("proxy-group '{}' has no proxies", config.name);
        }

        let snapshot = ProviderSnapshot::new(group_providers);

        let handler: Arc<dyn OutboundHandler> = match config.group_type.as_str() {
            "select" | "selector" => Arc::new(selector::SelectorGroup::new(
                config.name.clone(),
                snapshot,
                config.disable_udp,
            )),
            "fallback" => Arc::new(fallback::FallbackGroup::new(
                config.name.clone(),
                snapshot,
                config.disable_udp,
            )),
            "load-balance" => {
                let strategy =
                    loadbalance::LbStrategy::parse(config.strategy.as_deref())?;
                Arc::new(loadbalance::LoadBalanceGroup::new(
                    config.name.clone(),
                    snapshot,
                    strategy,
                    config.disable_udp,
                ))
            }
            "url-test" => Arc::new(urltest::UrlTestGroup::new(
                config.name.clone(),
                snapshot,
                config.tolerance,
                config.disable_udp,
            )),
            "relay" => Arc::new(relay::RelayGroup::new(config.name.clone(), snapshot)),
            other => anyhow::bail!(
                "unsupported proxy-group type '{}' for group '{}'",
                other,
                config.name
            ),
        };

        built.insert(
            config.name.clone(),
            Arc::new(ProxyHandle::new(handler.clone())),
        );
        result.push((config.name.clone(), handler));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::direct::DirectOutbound;

    fn handle(name: &str) -> Arc<ProxyHandle> {
        Arc::new(ProxyHandle::new(Arc::new(DirectOutbound::new(
            name.to_string(),
        ))))
    }

    #[tokio::test]
    async fn build_all_group_types() {
        let mut existing = HashMap::new();
        existing.insert("d1".to_string(), handle("d1"));
        existing.insert("d2".to_string(), handle("d2"));

        let configs = vec![
            GroupConfig {
                name: "pick".to_string(),
                group_type: "selector".to_string(),
                proxies: vec!["d1".to_string(), "d2".to_string()],
                ..Default::default()
            },
            GroupConfig {
                name: "fb".to_string(),
                group_type: "fallback".to_string(),
                proxies: vec!["d1".to_string(), "d2".to_string()],
                ..Default::default()
            },
            GroupConfig {
                name: "lb".to_string(),
                group_type: "load-balance".to_string(),
                proxies: vec!["d1".to_string(), "d2".to_string()],
                ..Default::default()
            },
            GroupConfig {
                name: "auto".to_string(),
                group_type: "url-test".to_string(),
                proxies: vec!["d1".to_string(), "d2".to_string()],
                ..Default::default()
            },
            GroupConfig {
                name: "chain".to_string(),
                // 组可以引用先前批次建好的组
                group_type: "relay".to_string(),
                proxies: vec!["d1".to_string(), "pick".to_string()],
                ..Default::default()
            },
        ];

        let groups = build_proxy_groups(&configs, &existing, &HashMap::new()).unwrap();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[0].0, "pick");
        assert_eq!(groups[4].0, "chain");
    }

    #[tokio::test]
    async fn unknown_proxy_reference_fails() {
        let configs = vec![GroupConfig {
            name: "bad".to_string(),
            group_type: "selector".to_string(),
            proxies: vec!["missing".to_string()],
            ..Default::default()
        }];
        assert!(build_proxy_groups(&configs, &HashMap::new(), &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn empty_group_fails() {
        let configs = vec![GroupConfig {
            name: "empty".to_string(),
            group_type: "selector".to_string(),
            ..Default::default()
        }];
        assert!(build_proxy_groups(&configs, &HashMap::new(), &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn unknown_group_type_fails() {
        let mut existing = HashMap::new();
        existing.insert("d1".to_string(), handle("d1"));
        let configs = vec![GroupConfig {
            name: "g".to_string(),
            group_type: "weighted".to_string(),
            proxies: vec!["d1".to_string()],
            ..Default::default()
        }];
        assert!(build_proxy_groups(&configs, &existing, &HashMap::new()).is_err());
    }
}
