//! 规则引擎契约。
//!
//! 规则词表（域名/关键字/GEOIP/CIDR/端口/进程等）由外部提供，
//! 核心只消费这三件事：匹配判定、目标出站名、是否禁止预解析。

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::dns::{ResolveFlags, Resolver};
use crate::proxy::Session;

/// 匹配结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    NotMatched,
    DomainMatched,
    Ipv4Matched,
    Ipv6Matched,
    IpMatched,
    PortMatched,
}

impl RuleVerdict {
    pub fn matched(&self) -> bool {
        !matches!(self, RuleVerdict::NotMatched)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleVerdict::NotMatched => "NotMatched",
            RuleVerdict::DomainMatched => "Domain",
            RuleVerdict::Ipv4Matched => "IPv4",
            RuleVerdict::Ipv6Matched => "IPv6",
            RuleVerdict::IpMatched => "IP",
            RuleVerdict::PortMatched => "Port",
        }
    }
}

/// 单条规则的契约
pub trait Rule: Send + Sync {
    fn matches(&self, metadata: &Session) -> RuleVerdict;

    /// 命中后使用的出站名
    fn adapter(&self) -> &str;

    /// true ⇒ 匹配本条不要求预先把域名解成 IP
    fn no_resolve_ip(&self) -> bool {
        false
    }
}

/// 路由结果
pub struct RouteResult<'a> {
    pub rule: Option<&'a dyn Rule>,
    pub verdict: RuleVerdict,
}

impl RouteResult<'_> {
    pub fn adapter(&self) -> Option<&str> {
        self.rule.map(|r| r.adapter())
    }
}

/// 用规则表给流量选出站。
///
/// 目标是域名且规则表里没有任何一条声明 no-resolve 时，先经解析器
/// 回填 `resolved_ip` 再匹配（IP 类规则依赖它）。
pub async fn route<'a>(
    rules: &'a [Box<dyn Rule>],
    metadata: &mut Session,
    resolver: Option<&Arc<Resolver>>,
) -> Result<RouteResult<'a>> {
    let needs_resolve = metadata.target.is_domain()
        && metadata.resolved_ip.is_none()
        && !rules.iter().any(|r| r.no_resolve_ip());

    if needs_resolve {
        if let Some(resolver) = resolver {
            match resolver
                .resolve_ips(&metadata.target.host(), ResolveFlags::default())
                .await
            {
                Ok(ips) => metadata.resolved_ip = ips.first().copied(),
                Err(e) => debug!(host = metadata.target.host(), error = %e, "pre-match resolution failed"),
            }
        }
    }

    for rule in rules {
        let verdict = rule.matches(metadata);
        if verdict.matched() {
            debug!(
                target = %metadata.target,
                adapter = rule.adapter(),
                verdict = verdict.as_str(),
                "rule matched"
            );
            return Ok(RouteResult {
                rule: Some(rule.as_ref()),
                verdict,
            });
        }
    }

    Ok(RouteResult {
        rule: None,
        verdict: RuleVerdict::NotMatched,
    })
}

/// 流量元数据里参与 IP 匹配的地址
pub fn match_ip(metadata: &Session) -> Option<IpAddr> {
    metadata.target.ip().or(metadata.resolved_ip)
}
