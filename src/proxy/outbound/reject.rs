use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tracing::debug;

use crate::common::Error;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

/// 拒绝出站：不建立任何真实连接
pub struct RejectOutbound {
    name: String,
    /// 读侧在 EOF 前停留的时长；None 表示立即 EOF
    delay: Option<Duration>,
}

impl RejectOutbound {
    pub fn new(name: String) -> Self {
        Self { name, delay: None }
    }

    pub fn with_delay(name: String, delay: Duration) -> Self {
        Self {
            name,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl OutboundHandler for RejectOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Reject
    }

    async fn connect(&self, _ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, "reject: synthetic stream");
        let mut stream = ChainedStream::new(Box::new(RejectStream::new(self.delay)));
        stream.push_inner_hop(&self.name);
        Ok(stream)
    }

    async fn connect_udp(&self, _ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        debug!(target = %session.target, "reject: udp association refused");
        Err(Error::Rejected(self.name.clone()).into())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// 合成流：读侧等到延迟结束（或流被关闭）后给出 EOF，写侧成功但丢弃
struct RejectStream {
    delay: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl RejectStream {
    fn new(delay: Option<Duration>) -> Self {
        Self {
            delay: delay.map(|d| Box::pin(sleep(d))),
            closed: false,
        }
    }
}

impl AsyncRead for RejectStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if let Some(delay) = this.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Ready(()) => {}
                Poll::Pending => return Poll::Pending,
            }
        }
        // 不填充任何字节即 EOF
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for RejectStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // 写成功但丢弃
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().closed = true;
        Poll::Ready(Ok(()))
    }
}
