//! 链路标记：记录一条流穿过出站图的 hop 序列。
//!
//! 顺序约定（全库统一）：链首是离载荷最近的编码层，链尾是最外层的
//! 组合组。线路适配器用 `push_inner` 把自己放到链首（它的编码最贴近
//! 载荷）；组策略用 `push_outer` 把自己追加到链尾。
//! 于是 `R(G(A))` 得到 `[A, G, R]`，relay `R[sA, sB]` 得到 `[sB, sA, R]`。

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{BoxUdpTransport, ProxyStream, UdpPacket};

/// 有序 hop 列表
#[derive(Debug, Clone, Default)]
pub struct Chain(VecDeque<String>);

impl Chain {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    /// 置入链首（载荷内侧）
    pub fn push_inner(&mut self, name: impl Into<String>) {
        self.0.push_front(name.into());
    }

    /// 追加到链尾（组合外侧）
    pub fn push_outer(&mut self, name: impl Into<String>) {
        self.0.push_back(name.into());
    }

    pub fn hops(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.front().map(|s| s.as_str())
    }

    pub fn last(&self) -> Option<&str> {
        self.0.back().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for hop in &self.0 {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", hop)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Chain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// 带链路标记的字节流（route-hop 装饰器）。
///
/// 每经过一个适配器/组，其名字被记入 chain；I/O 直接委托内层流。
pub struct ChainedStream {
    inner: ProxyStream,
    chain: Chain,
}

impl fmt::Debug for ChainedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedStream")
            .field("chain", &self.chain)
            .finish()
    }
}

impl ChainedStream {
    /// 包装一条尚无 hop 记录的裸流
    pub fn new(inner: ProxyStream) -> Self {
        Self {
            inner,
            chain: Chain::new(),
        }
    }

    pub fn with_chain(inner: ProxyStream, chain: Chain) -> Self {
        Self { inner, chain }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn push_inner_hop(&mut self, name: impl Into<String>) {
        self.chain.push_inner(name);
    }

    pub fn push_outer_hop(&mut self, name: impl Into<String>) {
        self.chain.push_outer(name);
    }

    /// 在保留链路记录的前提下替换内层流（套编码层时用）
    pub fn map<F>(self, f: F) -> Self
    where
        F: FnOnce(ProxyStream) -> ProxyStream,
    {
        Self {
            inner: f(self.inner),
            chain: self.chain,
        }
    }

    /// 同 map，但编码层包装可能失败；失败时内层连接已被消费掉
    pub fn try_map<F>(self, f: F) -> Result<Self>
    where
        F: FnOnce(ProxyStream) -> Result<ProxyStream>,
    {
        Ok(Self {
            inner: f(self.inner)?,
            chain: self.chain,
        })
    }

    pub fn into_inner(self) -> ProxyStream {
        self.inner
    }

    pub fn into_parts(self) -> (ProxyStream, Chain) {
        (self.inner, self.chain)
    }
}

impl AsyncRead for ChainedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChainedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// 带链路标记的 UDP 传输
pub struct ChainedDatagram {
    inner: BoxUdpTransport,
    chain: Chain,
}

impl fmt::Debug for ChainedDatagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedDatagram")
            .field("chain", &self.chain)
            .finish()
    }
}

impl ChainedDatagram {
    pub fn new(inner: BoxUdpTransport) -> Self {
        Self {
            inner,
            chain: Chain::new(),
        }
    }

    pub fn with_chain(inner: BoxUdpTransport, chain: Chain) -> Self {
        Self { inner, chain }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn push_inner_hop(&mut self, name: impl Into<String>) {
        self.chain.push_inner(name);
    }

    pub fn push_outer_hop(&mut self, name: impl Into<String>) {
        self.chain.push_outer(name);
    }

    pub async fn send(&self, packet: UdpPacket) -> Result<()> {
        self.inner.send(packet).await
    }

    pub async fn recv(&self) -> Result<UdpPacket> {
        self.inner.recv().await
    }
}
