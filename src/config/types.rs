//! 核心行为相关的配置面。
//!
//! 字段命名与 YAML 面向用户的 kebab-case 约定一致；配置文件的加载、
//! 合并、订阅转换等属于外围，不在本 crate 内。

use std::collections::HashMap;

use serde::Deserialize;

use crate::common::dialer::DialerConfig;

/// 顶层配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxies: Vec<OutboundConfig>,
    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<GroupConfig>,
    pub dns: DnsConfig,
}

impl Config {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yml::from_str(text)?)
    }
}

/// 单个出站适配器配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: String,
    pub server: Option<String>,
    pub port: Option<u16>,

    // 协议相关
    pub username: Option<String>,
    pub password: Option<String>,
    pub uuid: Option<String>,
    #[serde(rename = "alter-id")]
    pub alter_id: Option<u16>,
    pub cipher: Option<String>,
    pub psk: Option<String>,
    pub obfs: Option<String>,
    pub udp: bool,

    // TLS
    pub tls: bool,
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    #[serde(rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,

    // 传输层选择（"ws" 等；空为裸 TCP）
    pub network: Option<String>,
    #[serde(rename = "ws-path")]
    pub ws_path: Option<String>,
    #[serde(rename = "ws-headers")]
    pub ws_headers: HashMap<String, String>,

    pub dialer: Option<DialerConfig>,
}

impl OutboundConfig {
    pub fn require_server(&self) -> anyhow::Result<&str> {
        self.server
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("outbound '{}' missing 'server'", self.name))
    }

    pub fn require_port(&self) -> anyhow::Result<u16> {
        self.port
            .ok_or_else(|| anyhow::anyhow!("outbound '{}' missing 'port'", self.name))
    }

    /// 汇总出传输层配置
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            network: self.network.clone().unwrap_or_default(),
            tls: self.tls,
            sni: self.sni.clone(),
            alpn: self.alpn.clone(),
            skip_cert_verify: self.skip_cert_verify,
            ws_path: self.ws_path.clone().unwrap_or_else(|| "/".to_string()),
            ws_headers: self.ws_headers.clone(),
        }
    }
}

/// 传输层配置（TLS + 可插拔流包装）
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub network: String,
    pub tls: bool,
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    pub skip_cert_verify: bool,
    pub ws_path: String,
    pub ws_headers: HashMap<String, String>,
}

/// 代理组配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub proxies: Vec<String>,
    /// 引用的 provider 名称
    #[serde(rename = "use")]
    pub providers: Vec<String>,
    pub url: String,
    pub interval: u64,
    pub tolerance: u64,
    /// load-balance: consistent-hashing | round-robin
    pub strategy: Option<String>,
    #[serde(rename = "disable-udp")]
    pub disable_udp: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            group_type: String::new(),
            proxies: Vec::new(),
            providers: Vec::new(),
            url: "http://www.gstatic.com/generate_204".to_string(),
            interval: 300,
            tolerance: 150,
            strategy: None,
            disable_udp: false,
        }
    }
}

/// DNS 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enable: bool,
    /// DNS 服务监听地址（UDP+TCP），如 "127.0.0.1:1053"
    pub listen: Option<String>,
    pub ipv6: bool,
    /// normal | redir-host | fake-ip
    #[serde(rename = "enhanced-mode")]
    pub enhanced_mode: String,
    #[serde(rename = "fake-ip-range")]
    pub fake_ip_range: String,
    #[serde(rename = "fake-ip-filter")]
    pub fake_ip_filter: Vec<String>,
    /// 引导解析器（解析 DoT/DoH 服务器域名用）
    #[serde(rename = "default-nameserver")]
    pub default_nameserver: Vec<String>,
    pub nameserver: Vec<String>,
    pub fallback: Vec<String>,
    #[serde(rename = "fallback-filter")]
    pub fallback_filter: FallbackFilterConfig,
    /// 按域名定向：domain → nameserver
    #[serde(rename = "nameserver-policy")]
    pub nameserver_policy: HashMap<String, String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: None,
            ipv6: false,
            enhanced_mode: "normal".to_string(),
            fake_ip_range: "198.18.0.1/16".to_string(),
            fake_ip_filter: Vec::new(),
            default_nameserver: Vec::new(),
            nameserver: Vec::new(),
            fallback: Vec::new(),
            fallback_filter: FallbackFilterConfig::default(),
            nameserver_policy: HashMap::new(),
        }
    }
}

/// fallback 过滤器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackFilterConfig {
    pub geoip: bool,
    pub ipcidr: Vec<String>,
    pub domain: Vec<String>,
}

impl Default for FallbackFilterConfig {
    fn default() -> Self {
        Self {
            geoip: true,
            ipcidr: Vec::new(),
            domain: Vec::new(),
        }
    }
}
