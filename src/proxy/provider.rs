//! 代理提供者：命名的适配器句柄集合，以及组策略共享的快照去抖。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::probe::ProxyHandle;

/// 健康检查单次探测的并发上限
const HEALTH_CHECK_CONCURRENCY: usize = 4;
/// 两次 touch 触发的健康刷新之间的最短间隔
const TOUCH_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
/// 单个代理 URLTest 超时
const URL_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 一组命名的适配器句柄。
///
/// `touch()` 是组策略透传下来的维护信号：距上次健康刷新超过间隔时，
/// 在后台对所有句柄跑一轮 URLTest。
pub struct ProxyProvider {
    name: String,
    proxies: Vec<Arc<ProxyHandle>>,
    health_url: String,
    last_refresh: Mutex<Option<Instant>>,
    limiter: Arc<Semaphore>,
}

impl ProxyProvider {
    pub fn new(name: String, proxies: Vec<Arc<ProxyHandle>>, health_url: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            proxies,
            health_url,
            last_refresh: Mutex::new(None),
            limiter: Arc::new(Semaphore::new(HEALTH_CHECK_CONCURRENCY)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proxies(&self) -> &[Arc<ProxyHandle>] {
        &self.proxies
    }

    /// 维护信号：必要时在后台触发一轮健康检查
    pub fn touch(&self) {
        let due = {
            let mut last = self.last_refresh.lock().expect("refresh lock poisoned");
            match *last {
                Some(at) if at.elapsed() < TOUCH_REFRESH_INTERVAL => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };

        if due {
            let name = self.name.clone();
            let proxies = self.proxies.clone();
            let url = self.health_url.clone();
            let limiter = self.limiter.clone();
            tokio::spawn(async move {
                run_health_check(name, proxies, url, limiter).await;
            });
        }
    }

    /// 对全部句柄跑一轮 URLTest（受并发上限约束）
    pub async fn health_check(&self) {
        run_health_check(
            self.name.clone(),
            self.proxies.clone(),
            self.health_url.clone(),
            self.limiter.clone(),
        )
        .await;
    }
}

async fn run_health_check(
    name: String,
    proxies: Vec<Arc<ProxyHandle>>,
    url: String,
    limiter: Arc<Semaphore>,
) {
    debug!(provider = name.as_str(), "health check round started");
    let mut tasks = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        let url = url.clone();
        let limiter = limiter.clone();
        tasks.push(tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire().await else {
                return;
            };
            let _ = proxy.url_test(&url, URL_TEST_TIMEOUT).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    info!(provider = name.as_str(), "health check round finished");
}

/// 组策略的子节点快照去抖。
///
/// 去抖窗口内的所有调用者拿到同一份子节点列表；窗口过期后第一个
/// 读者重算并（touch 模式下）顺带触发各 provider 的健康维护。
pub struct ProviderSnapshot {
    window: Duration,
    providers: Vec<Arc<ProxyProvider>>,
    cached: Mutex<Option<(Instant, Arc<Vec<Arc<ProxyHandle>>>)>>,
}

impl ProviderSnapshot {
    /// 组共用的默认去抖窗口
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

    pub fn new(providers: Vec<Arc<ProxyProvider>>) -> Self {
        Self::with_window(providers, Self::DEFAULT_WINDOW)
    }

    pub fn with_window(providers: Vec<Arc<ProxyProvider>>, window: Duration) -> Self {
        Self {
            window,
            providers,
            cached: Mutex::new(None),
        }
    }

    /// 取子节点列表；`touch` 表示允许做后台维护
    pub fn proxies(&self, touch: bool) -> Arc<Vec<Arc<ProxyHandle>>> {
        {
            let cached = self.cached.lock().expect("snapshot lock poisoned");
            if let Some((at, list)) = cached.as_ref() {
                if at.elapsed() < self.window {
                    return list.clone();
                }
            }
        }

        if touch {
            for provider in &self.providers {
                provider.touch();
            }
        }

        let list: Arc<Vec<Arc<ProxyHandle>>> = Arc::new(
            self.providers
                .iter()
                .flat_map(|p| p.proxies().iter().cloned())
                .collect(),
        );

        let mut cached = self.cached.lock().expect("snapshot lock poisoned");
        *cached = Some((Instant::now(), list.clone()));
        list
    }

    /// 作废当前快照（selector 切换后调用）
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().expect("snapshot lock poisoned");
        *cached = None;
    }
}
