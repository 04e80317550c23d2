//! 解析器编排：按域策略 → 主/备并发竞速 → 并行上游组，
//! 外加报文缓存（陈答后台刷新）与同问题合流。

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::common::dialer::HostResolver;
use crate::common::Error;
use crate::config::DnsConfig;

use super::cache::{CacheHit, CacheKey, MessageCache};
use super::client::{build_client, build_clients, DNS_TIMEOUT};
use super::filters::{CountrySource, DomainFilter, FallbackIpFilter, GeoIpFilter, IpCidrFilter};
use super::NameClient;

/// 缓存容量
const CACHE_SIZE: usize = 4096;
/// 合流等待上限（超时后各自直查，避免 leader 挂死拖住全部调用方）
const INFLIGHT_WAIT: Duration = Duration::from_secs(5);

/// 解析开关：要哪些地址族、偏好哪个
#[derive(Debug, Clone, Copy)]
pub struct ResolveFlags {
    pub v4: bool,
    pub v6: bool,
    pub prefer_v6: bool,
}

impl Default for ResolveFlags {
    fn default() -> Self {
        Self {
            v4: true,
            v6: true,
            prefer_v6: false,
        }
    }
}

/// 按域名定向的策略规则
pub enum PolicyRule {
    Full(String),
    Suffix(String),
    Keyword(String),
    Regex(regex::Regex),
}

impl PolicyRule {
    /// 前缀语法：`full:`、`domain:`、`domain_suffix:`、`domain_keyword:`、
    /// `domain_regex:`、`+.`；无前缀默认后缀匹配
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(val) = s.strip_prefix("full:").or_else(|| s.strip_prefix("domain:")) {
            Ok(PolicyRule::Full(val.to_lowercase()))
        } else if let Some(val) = s.strip_prefix("domain_suffix:") {
            Ok(PolicyRule::Suffix(val.to_lowercase()))
        } else if let Some(val) = s.strip_prefix("domain_keyword:") {
            Ok(PolicyRule::Keyword(val.to_lowercase()))
        } else if let Some(val) = s.strip_prefix("domain_regex:") {
            let re = regex::Regex::new(val)
                .map_err(|e| anyhow::anyhow!("invalid policy regex '{}': {}", val, e))?;
            Ok(PolicyRule::Regex(re))
        } else if let Some(val) = s.strip_prefix("+.") {
            Ok(PolicyRule::Suffix(val.to_lowercase()))
        } else {
            Ok(PolicyRule::Suffix(s.to_lowercase()))
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        let host = host.trim_end_matches('.');
        match self {
            PolicyRule::Full(domain) => host == domain,
            PolicyRule::Suffix(suffix) => {
                host == suffix || host.ends_with(&format!(".{}", suffix))
            }
            PolicyRule::Keyword(keyword) => host.contains(keyword.as_str()),
            PolicyRule::Regex(re) => re.is_match(host),
        }
    }
}

/// 上游交换管线：策略、主备与过滤器。
/// 独立成块是为了让后台刷新任务能廉价共享。
struct Pipeline {
    main: Vec<Arc<dyn NameClient>>,
    fallback: Vec<Arc<dyn NameClient>>,
    ip_filters: Vec<Box<dyn FallbackIpFilter>>,
    fallback_domain: DomainFilter,
    policy: Vec<(PolicyRule, Vec<Arc<dyn NameClient>>)>,
}

impl Pipeline {
    /// 不过缓存的上游交换
    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let query = msg
            .queries()
            .first()
            .ok_or_else(|| anyhow::anyhow!("dns message has no question"))?;
        let host = query.name().to_ascii();
        let host = host.trim_end_matches('.');

        // 1. 按域策略独占
        for (rule, clients) in &self.policy {
            if rule.matches(host) {
                debug!(host = host, "nameserver policy matched");
                return batch_exchange(clients, msg).await;
            }
        }

        // 2. 域名过滤器命中：无条件只问 fallback
        if !self.fallback.is_empty() && self.fallback_domain.matches(host) {
            debug!(host = host, "fallback domain filter matched");
            return batch_exchange(&self.fallback, msg).await;
        }

        // 3. IP 查询且配置了 fallback：主备竞发
        let is_ip_query = matches!(query.query_type(), RecordType::A | RecordType::AAAA);
        if is_ip_query && !self.fallback.is_empty() {
            return self.race_main_fallback(msg).await;
        }

        batch_exchange(&self.main, msg).await
    }

    /// 主备同时出发；主应答通过过滤则用主，否则等备
    async fn race_main_fallback(&self, msg: &Message) -> Result<Message> {
        let main = self.main.clone();
        let fallback = self.fallback.clone();
        let main_msg = msg.clone();
        let fallback_msg = msg.clone();

        let main_task = tokio::spawn(async move { batch_exchange(&main, &main_msg).await });
        let fallback_task =
            tokio::spawn(async move { batch_exchange(&fallback, &fallback_msg).await });

        let main_result = main_task.await.unwrap_or_else(|e| Err(e.into()));

        if let Ok(reply) = &main_result {
            let ips = message_ips(reply);
            if let Some(first) = ips.first() {
                if !self.should_fallback(*first) {
                    fallback_task.abort();
                    return main_result;
                }
                debug!(ip = %first, "main reply rejected by fallback filter");
            }
        }

        fallback_task.await.unwrap_or_else(|e| Err(e.into()))
    }

    fn should_fallback(&self, ip: IpAddr) -> bool {
        self.ip_filters.iter().any(|f| f.matches(ip))
    }
}

/// DNS 解析器
pub struct Resolver {
    ipv6: bool,
    pipeline: Arc<Pipeline>,
    cache: Arc<MessageCache>,
    inflight: Mutex<HashMap<CacheKey, Arc<Notify>>>,
    refreshing: Arc<Mutex<HashSet<CacheKey>>>,
}

impl Resolver {
    /// 按配置构建。`country` 为 GeoIP fallback 过滤提供国家码。
    pub async fn new(
        config: &DnsConfig,
        country: Option<Arc<dyn CountrySource>>,
    ) -> Result<Arc<Self>> {
        let bootstrap = build_clients(&config.default_nameserver, &[]).await?;

        let main = build_clients(&config.nameserver, &bootstrap).await?;
        if main.is_empty() {
            anyhow::bail!("dns: no nameserver configured");
        }
        let fallback = build_clients(&config.fallback, &bootstrap).await?;

        let mut ip_filters: Vec<Box<dyn FallbackIpFilter>> = Vec::new();
        if !fallback.is_empty() {
            if config.fallback_filter.geoip {
                match &country {
                    Some(source) => ip_filters.push(Box::new(GeoIpFilter::new(source.clone()))),
                    None => warn!("fallback-filter.geoip enabled but no country source installed"),
                }
            }
            if !config.fallback_filter.ipcidr.is_empty() {
                ip_filters.push(Box::new(IpCidrFilter::new(&config.fallback_filter.ipcidr)));
            }
        }

        let mut policy = Vec::new();
        for (domain, server) in &config.nameserver_policy {
            let rule = match PolicyRule::parse(domain) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(domain = domain.as_str(), error = %e, "skipping invalid nameserver-policy rule");
                    continue;
                }
            };
            let client = build_client(server, &bootstrap).await?;
            policy.push((rule, vec![client]));
        }

        Ok(Self::assemble(
            config.ipv6,
            main,
            fallback,
            ip_filters,
            DomainFilter::new(&config.fallback_filter.domain),
            policy,
        ))
    }

    /// 测试/内嵌用：直接给定上游
    pub fn with_upstreams(
        ipv6: bool,
        main: Vec<Arc<dyn NameClient>>,
        fallback: Vec<Arc<dyn NameClient>>,
        ip_filters: Vec<Box<dyn FallbackIpFilter>>,
        fallback_domain: DomainFilter,
    ) -> Arc<Self> {
        Self::assemble(ipv6, main, fallback, ip_filters, fallback_domain, Vec::new())
    }

    /// 同上，外加按域策略
    pub fn with_upstreams_and_policy(
        ipv6: bool,
        main: Vec<Arc<dyn NameClient>>,
        fallback: Vec<Arc<dyn NameClient>>,
        ip_filters: Vec<Box<dyn FallbackIpFilter>>,
        fallback_domain: DomainFilter,
        policy: Vec<(PolicyRule, Vec<Arc<dyn NameClient>>)>,
    ) -> Arc<Self> {
        Self::assemble(ipv6, main, fallback, ip_filters, fallback_domain, policy)
    }

    fn assemble(
        ipv6: bool,
        main: Vec<Arc<dyn NameClient>>,
        fallback: Vec<Arc<dyn NameClient>>,
        ip_filters: Vec<Box<dyn FallbackIpFilter>>,
        fallback_domain: DomainFilter,
        policy: Vec<(PolicyRule, Vec<Arc<dyn NameClient>>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ipv6,
            pipeline: Arc::new(Pipeline {
                main,
                fallback,
                ip_filters,
                fallback_domain,
                policy,
            }),
            cache: Arc::new(MessageCache::new(CACHE_SIZE)),
            inflight: Mutex::new(HashMap::new()),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6
    }

    pub fn flush_cache(&self) {
        self.cache.clear();
    }

    /// 交换一问一答；走缓存与合流
    pub async fn exchange(&self, msg: &Message) -> Result<Message> {
        let query = msg
            .queries()
            .first()
            .ok_or_else(|| anyhow::anyhow!("dns message has no question"))?;

        // IPv6 关闭时 AAAA 不碰上游
        if !self.ipv6 && query.query_type() == RecordType::AAAA {
            return Ok(empty_reply(msg));
        }

        let key = CacheKey::from_message(msg)
            .ok_or_else(|| anyhow::anyhow!("dns message has no question"))?;

        match self.cache.get(&key) {
            Some(CacheHit::Fresh(mut reply)) => {
                reply.set_id(msg.id());
                return Ok(reply);
            }
            Some(CacheHit::Stale(mut reply)) => {
                // 陈答直接可用；刷新在后台做，同 key 只允许一个
                self.spawn_refresh(key, msg.clone());
                reply.set_id(msg.id());
                return Ok(reply);
            }
            None => {}
        }

        // 同问题合流：只放一个请求到上游
        let (notify, leader) = {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            match inflight.get(&key) {
                Some(notify) => (notify.clone(), false),
                None => {
                    let notify = Arc::new(Notify::new());
                    inflight.insert(key.clone(), notify.clone());
                    (notify, true)
                }
            }
        };

        if !leader {
            let waited = tokio::time::timeout(INFLIGHT_WAIT, notify.notified()).await;

            match self.cache.get(&key) {
                Some(CacheHit::Fresh(mut reply)) | Some(CacheHit::Stale(mut reply)) => {
                    // 共享应答按调用方改写报文 ID
                    reply.set_id(msg.id());
                    return Ok(reply);
                }
                None => {}
            }

            if waited.is_err() {
                let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
                if let Some(current) = inflight.get(&key) {
                    if Arc::ptr_eq(current, &notify) {
                        inflight.remove(&key);
                    }
                }
            }

            // leader 失败或超时：兜底自己查一次
            return self.pipeline.exchange(msg).await;
        }

        let result = self.pipeline.exchange(msg).await;

        if let Ok(reply) = &result {
            self.cache.put(key.clone(), reply);
        }

        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.remove(&key);
        }
        notify.notify_waiters();

        result
    }

    /// 解析主机名到 IP 列表。
    /// 两个地址族并发查询；一族失败另一族成功时吞掉失败，
    /// 全部落空时优先返回 v4 侧错误。
    pub async fn resolve_ips(&self, host: &str, flags: ResolveFlags) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            let ok = match ip {
                IpAddr::V4(_) => flags.v4,
                IpAddr::V6(_) => flags.v6,
            };
            return if ok {
                Ok(vec![ip])
            } else {
                Err(Error::IpVersionMismatch(host.to_string()).into())
            };
        }

        let want_v4 = flags.v4;
        let want_v6 = flags.v6 && self.ipv6;

        let v4_fut = async {
            if want_v4 {
                Some(self.query_family(host, RecordType::A).await)
            } else {
                None
            }
        };
        let v6_fut = async {
            if want_v6 {
                Some(self.query_family(host, RecordType::AAAA).await)
            } else {
                None
            }
        };
        let (v4_res, v6_res) = tokio::join!(v4_fut, v6_fut);

        let mut v4_err = None;
        let mut v6_err = None;
        let mut v4_ips = Vec::new();
        let mut v6_ips = Vec::new();

        match v4_res {
            Some(Ok(ips)) => v4_ips = ips,
            Some(Err(e)) => v4_err = Some(e),
            None => {}
        }
        match v6_res {
            Some(Ok(ips)) => v6_ips = ips,
            Some(Err(e)) => v6_err = Some(e),
            None => {}
        }

        let mut ips = Vec::with_capacity(v4_ips.len() + v6_ips.len());
        if flags.prefer_v6 {
            ips.extend(v6_ips);
            ips.extend(v4_ips);
        } else {
            ips.extend(v4_ips);
            ips.extend(v6_ips);
        }

        if ips.is_empty() {
            if let Some(e) = v4_err {
                return Err(e);
            }
            if let Some(e) = v6_err {
                return Err(e);
            }
            return Err(Error::IpNotFound(host.to_string()).into());
        }
        Ok(ips)
    }

    pub async fn resolve_v4(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolve_ips(
            host,
            ResolveFlags {
                v4: true,
                v6: false,
                prefer_v6: false,
            },
        )
        .await
    }

    pub async fn resolve_v6(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolve_ips(
            host,
            ResolveFlags {
                v4: false,
                v6: true,
                prefer_v6: true,
            },
        )
        .await
    }

    /// 单地址便捷入口
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        let ips = self.resolve_ips(host, ResolveFlags::default()).await?;
        ips.into_iter()
            .next()
            .ok_or_else(|| Error::IpNotFound(host.to_string()).into())
    }

    async fn query_family(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>> {
        use std::str::FromStr;
        let name = Name::from_str(&format!("{}.", host.trim_end_matches('.')))
            .map_err(|e| anyhow::anyhow!("invalid hostname '{}': {}", host, e))?;

        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, qtype));

        let reply = self.exchange(&query).await?;
        Ok(message_ips(&reply))
    }

    /// 过期条目的后台刷新；同 key 并发下至多一个
    fn spawn_refresh(&self, key: CacheKey, msg: Message) {
        {
            let mut refreshing = self.refreshing.lock().expect("refresh lock poisoned");
            if !refreshing.insert(key.clone()) {
                return;
            }
        }

        let pipeline = self.pipeline.clone();
        let cache = self.cache.clone();
        let refreshing = self.refreshing.clone();
        tokio::spawn(async move {
            match pipeline.exchange(&msg).await {
                Ok(reply) => {
                    cache.put(key.clone(), &reply);
                    debug!("stale dns entry refreshed");
                }
                Err(e) => {
                    // 刷新失败就丢弃过期条目，下次走完整查询
                    cache.remove(&key);
                    debug!(error = %e, "stale dns refresh failed");
                }
            }
            refreshing
                .lock()
                .expect("refresh lock poisoned")
                .remove(&key);
        });
    }
}

/// 拨号层的解析器句柄
pub struct ResolverHandle(pub Arc<Resolver>);

#[async_trait]
impl HostResolver for ResolverHandle {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.0
            .resolve_ips(
                host,
                ResolveFlags {
                    v4: true,
                    v6: self.0.ipv6,
                    prefer_v6: false,
                },
            )
            .await
    }
}

/// 并行上游组：共享截止时间内第一个非错、非 SERVFAIL/REFUSED 的应答获胜
pub async fn batch_exchange(clients: &[Arc<dyn NameClient>], msg: &Message) -> Result<Message> {
    if clients.is_empty() {
        return Err(Error::DnsUpstreamFailure("no upstream configured".to_string()).into());
    }

    let mut set = JoinSet::new();
    for client in clients {
        let client = client.clone();
        let msg = msg.clone();
        set.spawn(async move {
            let address = client.address().to_string();
            (address, client.exchange(&msg).await)
        });
    }

    let result = tokio::time::timeout(DNS_TIMEOUT, race(&mut set)).await;
    // 胜者出线后取消败者
    set.abort_all();

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::DnsTimeout("parallel group".to_string()).into()),
    }
}

async fn race(set: &mut JoinSet<(String, Result<Message>)>) -> Result<Message> {
    let mut first_err: Option<anyhow::Error> = None;

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(reply)))
                if reply.response_code() != ResponseCode::ServFail
                    && reply.response_code() != ResponseCode::Refused =>
            {
                return Ok(reply);
            }
            Ok((address, Ok(reply))) => {
                debug!(server = address.as_str(), rcode = ?reply.response_code(), "upstream refused");
                if first_err.is_none() {
                    first_err = Some(
                        Error::DnsUpstreamFailure(format!("{}: server failure", address)).into(),
                    );
                }
            }
            Ok((address, Err(e))) => {
                debug!(server = address.as_str(), error = %e, "upstream failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(join_err.into());
                }
            }
        }
    }

    Err(match first_err {
        Some(e) => {
            Error::DnsUpstreamFailure(format!("all upstreams failed, first error: {}", e)).into()
        }
        None => Error::DnsUpstreamFailure("all upstreams failed".to_string()).into(),
    })
}

/// 抽出应答里的 A/AAAA 地址
pub fn message_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// 空答 NOERROR（IPv6 关闭、fake-ip 的 AAAA 等场景）
pub fn empty_reply(msg: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(msg.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(msg.op_code());
    reply.set_recursion_desired(msg.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(ResponseCode::NoError);
    for q in msg.queries() {
        reply.add_query(q.clone());
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定应答的 mock 上游
    struct StaticClient {
        address: String,
        ip: IpAddr,
        calls: Arc<AtomicUsize>,
        delay: Duration,
        ttl: u32,
    }

    impl StaticClient {
        fn new(address: &str, ip: &str) -> Arc<Self> {
            Self::with(address, ip, Duration::ZERO, 300)
        }

        fn with(address: &str, ip: &str, delay: Duration, ttl: u32) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                ip: ip.parse().unwrap(),
                calls: Arc::new(AtomicUsize::new(0)),
                delay,
                ttl,
            })
        }
    }

    #[async_trait]
    impl NameClient for StaticClient {
        async fn exchange(&self, msg: &Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let mut reply = Message::new();
            reply.set_id(msg.id());
            reply.set_message_type(MessageType::Response);
            reply.set_response_code(ResponseCode::NoError);
            for q in msg.queries() {
                reply.add_query(q.clone());
                let rdata = match (q.query_type(), self.ip) {
                    (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
                    (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
                    _ => None,
                };
                if let Some(rdata) = rdata {
                    reply.add_answer(Record::from_rdata(q.name().clone(), self.ttl, rdata));
                }
            }
            Ok(reply)
        }

        fn address(&self) -> &str {
            &self.address
        }
    }

    /// 恒错上游
    struct FailingClient;

    #[async_trait]
    impl NameClient for FailingClient {
        async fn exchange(&self, _msg: &Message) -> Result<Message> {
            anyhow::bail!("mock upstream down")
        }

        fn address(&self) -> &str {
            "failing://mock"
        }
    }

    struct CnCountry;

    impl CountrySource for CnCountry {
        fn country_code(&self, ip: IpAddr) -> Option<String> {
            if ip.to_string().starts_with("114.") || ip.to_string().starts_with("223.") {
                Some("CN".to_string())
            } else {
                Some("US".to_string())
            }
        }
    }

    fn a_query(host: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_str(&format!("{}.", host)).unwrap(),
            RecordType::A,
        ));
        msg
    }

    fn aaaa_query(host: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x4243);
        msg.add_query(Query::query(
            Name::from_str(&format!("{}.", host)).unwrap(),
            RecordType::AAAA,
        ));
        msg
    }

    #[tokio::test]
    async fn batch_exchange_fastest_wins() {
        let slow = StaticClient::with("udp://slow", "1.1.1.1", Duration::from_millis(200), 300);
        let fast = StaticClient::with("udp://fast", "2.2.2.2", Duration::from_millis(10), 300);
        let clients: Vec<Arc<dyn NameClient>> = vec![slow, fast];

        let reply = batch_exchange(&clients, &a_query("example.com")).await.unwrap();
        assert_eq!(message_ips(&reply), vec!["2.2.2.2".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn batch_exchange_all_failed_composite_error() {
        let clients: Vec<Arc<dyn NameClient>> =
            vec![Arc::new(FailingClient), Arc::new(FailingClient)];
        let err = batch_exchange(&clients, &a_query("example.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all upstreams failed"));
    }

    #[tokio::test]
    async fn fallback_filter_rejects_foreign_main() {
        // S3：主返回 8.8.8.8（境外），fallback 返回 114.114.114.114
        let main: Vec<Arc<dyn NameClient>> = vec![StaticClient::new("udp://main", "8.8.8.8")];
        let fb: Vec<Arc<dyn NameClient>> =
            vec![StaticClient::new("udp://fallback", "114.114.114.114")];
        let resolver = Resolver::with_upstreams(
            false,
            main,
            fb,
            vec![Box::new(GeoIpFilter::new(Arc::new(CnCountry)))],
            DomainFilter::new(&[]),
        );

        let ips = resolver.resolve_v4("example.com").await.unwrap();
        assert_eq!(ips, vec!["114.114.114.114".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn fallback_filter_accepts_domestic_main() {
        let main: Vec<Arc<dyn NameClient>> = vec![StaticClient::new("udp://main", "223.5.5.5")];
        let fb: Vec<Arc<dyn NameClient>> = vec![StaticClient::new("udp://fallback", "8.8.4.4")];
        let resolver = Resolver::with_upstreams(
            false,
            main,
            fb,
            vec![Box::new(GeoIpFilter::new(Arc::new(CnCountry)))],
            DomainFilter::new(&[]),
        );

        let ips = resolver.resolve_v4("example.cn").await.unwrap();
        assert_eq!(ips, vec!["223.5.5.5".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn fallback_domain_filter_skips_main() {
        let main = StaticClient::new("udp://main", "1.1.1.1");
        let fb = StaticClient::new("udp://fallback", "9.9.9.9");
        let main_calls = main.calls.clone();

        let resolver = Resolver::with_upstreams(
            false,
            vec![main],
            vec![fb],
            vec![],
            DomainFilter::new(&["blocked.example".to_string()]),
        );

        let ips = resolver.resolve_v4("www.blocked.example").await.unwrap();
        assert_eq!(ips, vec!["9.9.9.9".parse::<IpAddr>().unwrap()]);
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ipv6_gate_returns_empty_noerror() {
        let main = StaticClient::new("udp://main", "1.1.1.1");
        let calls = main.calls.clone();
        let resolver =
            Resolver::with_upstreams(false, vec![main], vec![], vec![], DomainFilter::new(&[]));

        let reply = resolver.exchange(&aaaa_query("example.com")).await.unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
        assert_eq!(reply.id(), 0x4243);
        // 未产生上游流量
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_serves_second_query() {
        let main = StaticClient::new("udp://main", "1.2.3.4");
        let calls = main.calls.clone();
        let resolver =
            Resolver::with_upstreams(false, vec![main], vec![], vec![], DomainFilter::new(&[]));

        let first = resolver.exchange(&a_query("cached.example")).await.unwrap();
        assert_eq!(message_ips(&first).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut second_query = a_query("cached.example");
        second_query.set_id(0x9999);
        let second = resolver.exchange(&second_query).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second query must hit cache");
        // 共享应答但保留各自的报文 ID
        assert_eq!(second.id(), 0x9999);
    }

    #[tokio::test]
    async fn stale_entry_served_with_ttl_one_and_refreshed_once() {
        let main = StaticClient::with("udp://main", "1.2.3.4", Duration::from_millis(50), 0);
        let calls = main.calls.clone();
        let resolver =
            Resolver::with_upstreams(false, vec![main], vec![], vec![], DomainFilter::new(&[]));

        resolver.exchange(&a_query("stale.example")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 并发打过期条目：全部陈答 TTL=1，后台刷新只发一次
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolver.exchange(&a_query("stale.example")).await.unwrap()
            }));
        }
        for task in tasks {
            let reply = task.await.unwrap();
            assert_eq!(reply.answers()[0].ttl(), 1);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one background refresh");
    }

    #[tokio::test]
    async fn single_flight_dedupes_concurrent_queries() {
        let main = StaticClient::with("udp://main", "4.3.2.1", Duration::from_millis(80), 300);
        let calls = main.calls.clone();
        let resolver =
            Resolver::with_upstreams(false, vec![main], vec![], vec![], DomainFilter::new(&[]));

        let mut tasks = Vec::new();
        for i in 0..8u16 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                let mut query = a_query("dedup.example");
                query.set_id(0x1000 + i);
                resolver.exchange(&query).await.unwrap()
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let reply = task.await.unwrap();
            assert_eq!(reply.id(), 0x1000 + i as u16);
            assert_eq!(message_ips(&reply).len(), 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn policy_routes_to_dedicated_upstream() {
        let main = StaticClient::new("udp://main", "1.1.1.1");
        let internal = StaticClient::new("udp://internal", "10.0.0.5");
        let main_calls = main.calls.clone();

        let resolver = Resolver::with_upstreams_and_policy(
            false,
            vec![main],
            vec![],
            vec![],
            DomainFilter::new(&[]),
            vec![(
                PolicyRule::parse("+.corp.example").unwrap(),
                vec![internal as Arc<dyn NameClient>],
            )],
        );

        let ips = resolver.resolve_v4("gitlab.corp.example").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolve_ip_literal_short_circuits() {
        let resolver = Resolver::with_upstreams(
            true,
            vec![Arc::new(FailingClient)],
            vec![],
            vec![],
            DomainFilter::new(&[]),
        );

        let ips = resolver
            .resolve_ips("192.0.2.7", ResolveFlags::default())
            .await
            .unwrap();
        assert_eq!(ips, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);

        // 地址族与开关不符
        let err = resolver
            .resolve_ips(
                "192.0.2.7",
                ResolveFlags {
                    v4: false,
                    v6: true,
                    prefer_v6: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::IpVersionMismatch(_))
        ));
    }

    #[tokio::test]
    async fn v6_empty_tolerated_when_v4_succeeds() {
        // v6 侧空答（同一上游只配 A 记录）：不报错，仅返回 v4
        let main = StaticClient::new("udp://main", "5.5.5.5");
        let resolver =
            Resolver::with_upstreams(true, vec![main], vec![], vec![], DomainFilter::new(&[]));

        let ips = resolver
            .resolve_ips("dual.example", ResolveFlags::default())
            .await
            .unwrap();
        assert_eq!(ips, vec!["5.5.5.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn policy_rule_forms() {
        assert!(PolicyRule::parse("full:api.example.com")
            .unwrap()
            .matches("api.example.com"));
        assert!(!PolicyRule::parse("full:api.example.com")
            .unwrap()
            .matches("www.api.example.com"));
        assert!(PolicyRule::parse("+.example.com").unwrap().matches("a.example.com"));
        assert!(PolicyRule::parse("domain_keyword:tracker")
            .unwrap()
            .matches("tracker7.ads.example"));
        assert!(PolicyRule::parse(r"domain_regex:^ads\d+\.")
            .unwrap()
            .matches("ads42.example.com"));
        assert!(PolicyRule::parse("domain_regex:[bad").is_err());
    }
}
