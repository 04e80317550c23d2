//! 连接跟踪：每条流一份记录，读写两侧计量，开关进出管理器。

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::proxy::{Chain, ChainedStream, InboundKind, Session};

/// 计量通道容量；消费端堵住时丢增量，绝不阻塞 I/O
const COUNTER_CHANNEL_CAPACITY: usize = 512;

/// 单条连接的跟踪记录
pub struct TrackerInfo {
    pub id: Uuid,
    pub metadata: Session,
    pub start_millis: u64,
    pub chain: Chain,
    pub rule: String,
    pub upload: AtomicU64,
    pub download: AtomicU64,
}

/// 观测面用的连接快照
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub metadata: MetadataSnapshot,
    pub upload: u64,
    pub download: u64,
    pub start: u64,
    pub chains: Vec<String>,
    pub rule: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataSnapshot {
    pub network: String,
    #[serde(rename = "type")]
    pub inbound: String,
    #[serde(rename = "sourceIP")]
    pub source: String,
    pub host: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: u16,
}

impl TrackerInfo {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.to_string(),
            metadata: MetadataSnapshot {
                network: self.metadata.network.to_string(),
                inbound: match self.metadata.inbound {
                    InboundKind::Http => "HTTP".to_string(),
                    InboundKind::Socks => "Socks5".to_string(),
                    InboundKind::Redir => "Redir".to_string(),
                },
                source: self
                    .metadata
                    .source
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                host: self.metadata.target.host(),
                destination_port: self.metadata.target.port(),
            },
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
            start: self.start_millis,
            chains: self.chain.hops(),
            rule: self.rule.clone(),
        }
    }
}

/// 连接管理器。
///
/// 接入时登记记录并发放跟踪流；每个通过读/写面的字节计入对应方向的
/// 计数器，同时推给全局上/下行通道供面板消费。
pub struct Manager {
    connections: Arc<RwLock<HashMap<Uuid, Arc<TrackerInfo>>>>,
    upload_tx: mpsc::Sender<u64>,
    download_tx: mpsc::Sender<u64>,
}

impl Manager {
    /// 返回 (管理器, 上行增量接收端, 下行增量接收端)
    pub fn new() -> (Arc<Self>, mpsc::Receiver<u64>, mpsc::Receiver<u64>) {
        let (upload_tx, upload_rx) = mpsc::channel(COUNTER_CHANNEL_CAPACITY);
        let (download_tx, download_rx) = mpsc::channel(COUNTER_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                connections: Arc::new(RwLock::new(HashMap::new())),
                upload_tx,
                download_tx,
            }),
            upload_rx,
            download_rx,
        )
    }

    /// 接入一条 TCP 流：登记并包上计量层。
    /// 链路在此刻定格到记录里。
    pub fn track(&self, stream: ChainedStream, metadata: Session, rule: &str) -> TrackedStream {
        let info = Arc::new(TrackerInfo {
            id: Uuid::new_v4(),
            start_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            chain: stream.chain().clone(),
            metadata,
            rule: rule.to_string(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        });

        self.join(info.clone());

        TrackedStream {
            inner: stream,
            info,
            connections: self.connections.clone(),
            upload_tx: self.upload_tx.clone(),
            download_tx: self.download_tx.clone(),
            left: AtomicBool::new(false),
        }
    }

    fn join(&self, info: Arc<TrackerInfo>) {
        debug!(
            conn_id = %info.id,
            target = %info.metadata.target,
            chain = %info.chain,
            rule = info.rule.as_str(),
            "connection joined"
        );
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(info.id, info);
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全部活动连接的快照
    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .values()
            .map(|info| info.snapshot())
            .collect()
    }

    pub fn snapshot_of(&self, id: &Uuid) -> Option<ConnectionSnapshot> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(id)
            .map(|info| info.snapshot())
    }

}

/// 计量流：包住出站返回的链路流
pub struct TrackedStream {
    inner: ChainedStream,
    info: Arc<TrackerInfo>,
    connections: Arc<RwLock<HashMap<Uuid, Arc<TrackerInfo>>>>,
    upload_tx: mpsc::Sender<u64>,
    download_tx: mpsc::Sender<u64>,
    left: AtomicBool,
}

impl TrackedStream {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.info
    }

    fn leave_once(&self) {
        if !self.left.swap(true, Ordering::SeqCst) {
            if let Some(info) = self
                .connections
                .write()
                .expect("connections lock poisoned")
                .remove(&self.info.id)
            {
                debug!(
                    conn_id = %info.id,
                    upload = info.upload.load(Ordering::Relaxed),
                    download = info.download.load(Ordering::Relaxed),
                    "connection left"
                );
            }
        }
    }

    fn push_upload(&self, n: u64) {
        // 满了就丢：计量增量对面板是尽力而为的
        let _ = self.upload_tx.try_send(n);
    }

    fn push_download(&self, n: u64) {
        let _ = self.download_tx.try_send(n);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n > 0 {
                    this.info.download.fetch_add(n, Ordering::Relaxed);
                    this.push_download(n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.info.upload.fetch_add(n as u64, Ordering::Relaxed);
                    this.push_upload(n as u64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        if matches!(result, Poll::Ready(_)) {
            this.leave_once();
        }
        result
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.leave_once();
    }
}
