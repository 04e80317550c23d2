//! 适配器探针：存活标记 + 最近 10 次延迟采样 + URLTest。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 探针判定死亡时 `last_delay()` 的哨兵值
pub const DEAD_DELAY: u16 = 0xFFFF;

/// 采样环深度
const HISTORY_DEPTH: usize = 10;

/// 单次延迟采样。死亡采样的 delay 序列化为 0。
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DelayHistory {
    /// Unix 毫秒时间戳
    pub time: u64,
    pub delay: u16,
}

/// 带探针状态的适配器句柄。
///
/// 组策略持有的子节点都是这种句柄：经由它拨号失败会把 alive 置 false，
/// URLTest 则按固定 URL 主动测量往返延迟。
pub struct ProxyHandle {
    adapter: Arc<dyn OutboundHandler>,
    alive: AtomicBool,
    // 仅在更新采样环时短暂持有，绝不跨 I/O
    history: Mutex<VecDeque<DelayHistory>>,
}

impl ProxyHandle {
    pub fn new(adapter: Arc<dyn OutboundHandler>) -> Self {
        Self {
            adapter,
            alive: AtomicBool::new(true),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_DEPTH)),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn OutboundHandler> {
        &self.adapter
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// 最近一次有效延迟；死亡或无有效记录时返回 0xFFFF
    pub fn last_delay(&self) -> u16 {
        if !self.alive() {
            return DEAD_DELAY;
        }
        let history = self.history.lock().expect("history lock poisoned");
        match history.back() {
            Some(sample) if sample.delay != 0 => sample.delay,
            _ => DEAD_DELAY,
        }
    }

    pub fn delay_history(&self) -> Vec<DelayHistory> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().copied().collect()
    }

    pub(crate) fn record(&self, delay: u16) {
        let sample = DelayHistory {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            delay,
        };
        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(sample);
        while history.len() > HISTORY_DEPTH {
            history.pop_front();
        }
    }

    /// 通过本适配器对 URL 发起 HEAD 请求并测量往返毫秒数。
    ///
    /// 成功：记录延迟、alive=true；失败：记录死亡采样、alive=false。
    pub async fn url_test(&self, url: &str, timeout: Duration) -> Result<u16> {
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, self.head_once(url)).await;

        match result {
            Ok(Ok(())) => {
                let delay = start.elapsed().as_millis().min(u16::MAX as u128 - 1) as u16;
                // 亚毫秒往返按 1ms 记，避免与死亡采样混淆
                let delay = delay.max(1);
                self.record(delay);
                self.set_alive(true);
                debug!(proxy = self.name(), delay = delay, "url test ok");
                Ok(delay)
            }
            Ok(Err(e)) => {
                self.record(0);
                self.set_alive(false);
                debug!(proxy = self.name(), error = %e, "url test failed");
                Err(e)
            }
            Err(_) => {
                self.record(0);
                self.set_alive(false);
                debug!(proxy = self.name(), "url test timed out");
                anyhow::bail!("url test timed out for '{}'", self.name())
            }
        }
    }

    async fn head_once(&self, url: &str) -> Result<()> {
        let (https, host, port, path) = parse_url(url);

        let session = Session::tcp(Address::Domain(host.clone(), port));
        let stream = self.adapter.connect(&DialCtx::plain(), &session).await?;

        let mut stream: ProxyStream = if https {
            let options = crate::common::tls::TlsOptions::for_host(host.clone());
            let (connector, server_name) = crate::common::tls::connector(&options)?;
            Box::new(connector.connect(server_name, stream).await?)
        } else {
            Box::new(stream)
        };

        let request = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        stream.write_all(request.as_bytes()).await?;

        // HEAD 无响应体，读到状态行即算一次完整往返；不跟随重定向
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("empty response from '{}'", url);
        }
        if !buf.starts_with(b"HTTP/") {
            anyhow::bail!("malformed response from '{}'", url);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundHandler for ProxyHandle {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn kind(&self) -> AdapterKind {
        self.adapter.kind()
    }

    fn server_addr(&self) -> Option<Address> {
        self.adapter.server_addr()
    }

    fn support_udp(&self) -> bool {
        self.adapter.support_udp()
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        match self.adapter.connect(ctx, session).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.set_alive(false);
                Err(e)
            }
        }
    }

    async fn connect_udp(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        match self.adapter.connect_udp(ctx, session).await {
            Ok(t) => Ok(t),
            Err(e) => {
                self.set_alive(false);
                Err(e)
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// 解析探测 URL 为 (https, host, port, path)
pub fn parse_url(url: &str) -> (bool, String, u16, String) {
    let (https, rest) = if let Some(r) = url.strip_prefix("https://") {
        (true, r)
    } else if let Some(r) = url.strip_prefix("http://") {
        (false, r)
    } else {
        (false, url)
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let default_port: u16 = if https { 443 } else { 80 };

    let (host, port) = match host_port.rfind(':') {
        Some(idx) => {
            let port_str = &host_port[idx + 1..];
            match port_str.parse::<u16>() {
                Ok(p) => (host_port[..idx].to_string(), p),
                Err(_) => (host_port.to_string(), default_port),
            }
        }
        None => (host_port.to_string(), default_port),
    };

    (https, host, port, path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::direct::DirectOutbound;

    #[test]
    fn parse_url_http() {
        let (https, host, port, path) = parse_url("http://www.gstatic.com/generate_204");
        assert!(!https);
        assert_eq!(host, "www.gstatic.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/generate_204");
    }

    #[test]
    fn parse_url_https_default_port() {
        let (https, host, port, path) = parse_url("https://example.com");
        assert!(https);
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert_eq!(path, "/");
    }

    #[test]
    fn parse_url_with_port() {
        let (_, host, port, path) = parse_url("http://localhost:8080/health");
        assert_eq!(host, "localhost");
        assert_eq!(port, 8080);
        assert_eq!(path, "/health");
    }

    #[tokio::test]
    async fn url_test_success_records_delay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let handle = ProxyHandle::new(Arc::new(DirectOutbound::new("DIRECT".to_string())));
        let url = format!("http://127.0.0.1:{}/generate_204", port);
        let delay = handle
            .url_test(&url, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(handle.alive());
        assert!(delay >= 1);
        assert_eq!(handle.last_delay(), delay);
        assert_eq!(handle.delay_history().len(), 1);
    }

    #[tokio::test]
    async fn url_test_failure_marks_dead() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = ProxyHandle::new(Arc::new(DirectOutbound::new("DIRECT".to_string())));
        let url = format!("http://127.0.0.1:{}/generate_204", port);
        assert!(handle.url_test(&url, Duration::from_secs(2)).await.is_err());

        assert!(!handle.alive());
        assert_eq!(handle.last_delay(), DEAD_DELAY);
        // 死亡采样 delay 序列化为 0
        assert_eq!(handle.delay_history().last().unwrap().delay, 0);
    }

    #[tokio::test]
    async fn history_ring_keeps_latest_ten() {
        let handle = ProxyHandle::new(Arc::new(DirectOutbound::new("DIRECT".to_string())));
        for i in 1..=15u16 {
            handle.record(i);
        }
        let history = handle.delay_history();
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().delay, 6);
        assert_eq!(history.last().unwrap().delay, 15);
    }

    #[test]
    fn last_delay_dead_sentinel() {
        let handle = ProxyHandle::new(Arc::new(DirectOutbound::new("DIRECT".to_string())));
        // 无记录
        assert_eq!(handle.last_delay(), DEAD_DELAY);
        handle.record(42);
        assert_eq!(handle.last_delay(), 42);
        handle.set_alive(false);
        assert_eq!(handle.last_delay(), DEAD_DELAY);
    }
}
