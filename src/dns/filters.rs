//! fallback 过滤器：判定主解析组的应答是否可信。

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

/// IP → 国家码来源。MMDB 读取由外部组件提供，这里只消费查询接口。
pub trait CountrySource: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// 任一过滤器命中 ⇒ 弃用主应答、改用 fallback 组的应答
pub trait FallbackIpFilter: Send + Sync {
    fn matches(&self, ip: IpAddr) -> bool;
}

/// 境外判定：国家码既非 "CN" 也非空
pub struct GeoIpFilter {
    source: Arc<dyn CountrySource>,
}

impl GeoIpFilter {
    pub fn new(source: Arc<dyn CountrySource>) -> Self {
        Self { source }
    }
}

impl FallbackIpFilter for GeoIpFilter {
    fn matches(&self, ip: IpAddr) -> bool {
        match self.source.country_code(ip) {
            Some(code) => code != "CN" && !code.is_empty(),
            None => false,
        }
    }
}

/// CIDR 命中判定
pub struct IpCidrFilter {
    nets: Vec<IpNet>,
}

impl IpCidrFilter {
    pub fn new(cidrs: &[String]) -> Self {
        let nets = cidrs.iter().filter_map(|s| s.parse().ok()).collect();
        Self { nets }
    }
}

impl FallbackIpFilter for IpCidrFilter {
    fn matches(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// 域名过滤：命中的问题名无条件只问 fallback 组
pub struct DomainFilter {
    suffixes: Vec<String>,
}

impl DomainFilter {
    pub fn new(domains: &[String]) -> Self {
        Self {
            suffixes: domains
                .iter()
                .map(|d| d.trim_start_matches("+.").to_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.suffixes.is_empty() {
            return false;
        }
        let host = host.to_lowercase();
        let host = host.trim_end_matches('.');
        self.suffixes
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{}", suffix)))
    }
}
