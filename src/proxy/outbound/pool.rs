//! 长连接干道池。
//!
//! gRPC、多路复用类传输共享一条长寿命会话（干道），每个流从干道上
//! 派生。池惰性建立干道；干道拒绝新流后被弃置并在下次取用时重建。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::{Address, ProxyStream};

/// 可复用的多路复用会话
#[async_trait]
pub trait Trunk: Send + Sync {
    /// 还能派生新流吗（false ⇒ 干道作废）
    fn can_take_new_request(&self) -> bool;

    /// 在干道上为目标派生一条流
    async fn open_stream(&self, target: &Address) -> Result<ProxyStream>;
}

/// 干道构造器
#[async_trait]
pub trait TrunkFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Trunk>>;
}

/// 惰性单干道池
pub struct TrunkPool {
    factory: Box<dyn TrunkFactory>,
    current: Mutex<Option<Arc<dyn Trunk>>>,
}

impl TrunkPool {
    pub fn new(factory: Box<dyn TrunkFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// 取当前干道；不存在或已拒绝新流时重建
    pub async fn get_trunk(&self) -> Result<Arc<dyn Trunk>> {
        let mut current = self.current.lock().await;

        if let Some(trunk) = current.as_ref() {
            if trunk.can_take_new_request() {
                return Ok(trunk.clone());
            }
            debug!("trunk refuses new requests, discarding");
            *current = None;
        }

        let trunk = self.factory.create().await?;
        *current = Some(trunk.clone());
        Ok(trunk)
    }

    /// 在干道上开流的便捷入口
    pub async fn open_stream(&self, target: &Address) -> Result<ProxyStream> {
        let trunk = self.get_trunk().await?;
        trunk.open_stream(target).await
    }
}
