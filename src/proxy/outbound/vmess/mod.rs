pub mod protocol;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::common::dialer::Dialer;
use crate::common::{Address, ProxyStream, UdpPacket, UdpTransport};
use crate::config::OutboundConfig;
use crate::proxy::transport::StreamTransform;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

use protocol::{ChunkCipher, SecurityType, MAX_CHUNK, VMESS_TAG_LEN};

/// VMess 出站（AEAD 头）
pub struct VmessOutbound {
    name: String,
    server: Address,
    uuid: [u8; 16],
    security: SecurityType,
    udp: bool,
    transform: StreamTransform,
    dialer: Dialer,
}

impl VmessOutbound {
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        let server = Address::Domain(config.require_server()?.to_string(), config.require_port()?);
        let uuid_str = config
            .uuid
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("vmess '{}' missing 'uuid'", config.name))?;
        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|e| anyhow::anyhow!("vmess '{}' invalid uuid: {}", config.name, e))?;

        let security = SecurityType::parse(config.cipher.as_deref().unwrap_or("auto"));
        let transform = StreamTransform::from_config(&server.host(), &config.transport())?;

        Ok(Self {
            name: config.name.clone(),
            server,
            uuid: *uuid.as_bytes(),
            security,
            udp: config.udp,
            transform,
            dialer: super::outbound_dialer(config),
        })
    }

    async fn open(&self, ctx: &DialCtx, target: &Address, cmd: u8) -> Result<ChainedStream> {
        let transport = super::dial_server(ctx, &self.dialer, &self.server).await?;
        let (inner, chain) = transport.into_parts();
        let mut stream = self.transform.apply(inner).await?;

        let mut req_body_key = [0u8; 16];
        let mut req_body_iv = [0u8; 16];
        let resp_auth: u8 = {
            let mut rng = rand::thread_rng();
            rng.fill(&mut req_body_key);
            rng.fill(&mut req_body_iv);
            rng.gen()
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let header = protocol::encode_request_header(
            &self.uuid,
            self.security,
            cmd,
            target,
            &req_body_iv,
            &req_body_key,
            resp_auth,
            timestamp,
        )?;
        stream.write_all(&header).await?;

        let (resp_key, resp_iv) = protocol::derive_response_key_iv(&req_body_key, &req_body_iv);
        let vmess = VmessStream::new(
            stream,
            ChunkCipher::new(self.security, &req_body_key, &req_body_iv),
            ChunkCipher::new(self.security, &resp_key, &resp_iv),
            resp_key,
            resp_iv,
            resp_auth,
        );

        Ok(ChainedStream::with_chain(Box::new(vmess), chain))
    }
}

#[async_trait]
impl OutboundHandler for VmessOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Vmess
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, server = %self.server, "vmess connecting");
        let mut stream = self.open(ctx, &session.target, protocol::CMD_TCP).await?;
        stream.push_inner_hop(&self.name);
        debug!(target = %session.target, "vmess tunnel established");
        Ok(stream)
    }

    async fn connect_udp(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        debug!(target = %session.target, server = %self.server, "vmess udp");
        let stream = self.open(ctx, &session.target, protocol::CMD_UDP).await?;
        let (inner, chain) = stream.into_parts();

        let transport = VmessUdpTransport {
            stream: Mutex::new(inner),
            target: session.target.clone(),
        };
        let mut datagram = ChainedDatagram::with_chain(Box::new(transport), chain);
        datagram.push_inner_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// VMess UDP：每个数据报对应一个 chunk；目标地址在请求头里固定
struct VmessUdpTransport {
    stream: Mutex<ProxyStream>,
    target: Address,
}

#[async_trait]
impl UdpTransport for VmessUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(&packet.data).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        use tokio::io::AsyncReadExt;
        let mut stream = self.stream.lock().await;
        let mut buf = vec![0u8; 65535];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: self.target.clone(),
            data: buf.into(),
        })
    }
}

/// 读状态机：响应头（两段）→ 分块循环
enum ReadState {
    RespLength { buf: [u8; 18], read: usize },
    RespHeader { buf: Vec<u8>, read: usize },
    ChunkLength { buf: [u8; 2], read: usize },
    ChunkPayload { buf: Vec<u8>, read: usize },
}

enum WriteState {
    Ready,
    Writing { data: Vec<u8>, written: usize, consumed: usize },
}

/// VMess 分块流
pub struct VmessStream {
    inner: ProxyStream,
    write_cipher: ChunkCipher,
    read_cipher: ChunkCipher,
    resp_key: [u8; 16],
    resp_iv: [u8; 16],
    resp_auth: u8,
    buffered: Vec<u8>,
    buffered_pos: usize,
    read_state: ReadState,
    write_state: WriteState,
}

impl VmessStream {
    fn new(
        inner: ProxyStream,
        write_cipher: ChunkCipher,
        read_cipher: ChunkCipher,
        resp_key: [u8; 16],
        resp_iv: [u8; 16],
        resp_auth: u8,
    ) -> Self {
        Self {
            inner,
            write_cipher,
            read_cipher,
            resp_key,
            resp_iv,
            resp_auth,
            buffered: Vec::new(),
            buffered_pos: 0,
            read_state: ReadState::RespLength {
                buf: [0u8; 18],
                read: 0,
            },
            write_state: WriteState::Ready,
        }
    }
}

fn poll_fill(
    inner: &mut ProxyStream,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    read: &mut usize,
) -> Poll<io::Result<()>> {
    while *read < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*read..]);
        match Pin::new(&mut *inner).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => {
                let n = rb.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
                *read += n;
            }
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(()))
}

impl AsyncRead for VmessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.buffered_pos < this.buffered.len() {
                let remaining = &this.buffered[this.buffered_pos..];
                let n = remaining.len().min(out.remaining());
                out.put_slice(&remaining[..n]);
                this.buffered_pos += n;
                if this.buffered_pos >= this.buffered.len() {
                    this.buffered.clear();
                    this.buffered_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::RespLength { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let header_len =
                        protocol::open_response_length(&this.resp_key, &this.resp_iv, buf)
                            .map_err(io::Error::other)?;
                    this.read_state = ReadState::RespHeader {
                        buf: vec![0u8; header_len + VMESS_TAG_LEN],
                        read: 0,
                    };
                }
                ReadState::RespHeader { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    protocol::open_response_header(
                        &this.resp_key,
                        &this.resp_iv,
                        buf,
                        this.resp_auth,
                    )
                    .map_err(io::Error::other)?;
                    this.read_state = ReadState::ChunkLength {
                        buf: [0u8; 2],
                        read: 0,
                    };
                }
                ReadState::ChunkLength { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let chunk_len = this.read_cipher.open_length(*buf);
                    if chunk_len == 0 {
                        // 空分块表示流结束
                        return Poll::Ready(Ok(()));
                    }
                    this.read_state = ReadState::ChunkPayload {
                        buf: vec![0u8; chunk_len],
                        read: 0,
                    };
                }
                ReadState::ChunkPayload { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    this.buffered = this.read_cipher.open_chunk(buf).map_err(io::Error::other)?;
                    this.buffered_pos = 0;
                    this.read_state = ReadState::ChunkLength {
                        buf: [0u8; 2],
                        read: 0,
                    };
                }
            }
        }
    }
}

impl AsyncWrite for VmessStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let chunk_len = buf.len().min(MAX_CHUNK - VMESS_TAG_LEN);
                    let data = this
                        .write_cipher
                        .seal_chunk(&buf[..chunk_len])
                        .map_err(io::Error::other)?;
                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        consumed: chunk_len,
                    };
                }
                WriteState::Writing {
                    data,
                    written,
                    consumed,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let n = *consumed;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_uuid() {
        let config = OutboundConfig {
            name: "v".to_string(),
            protocol: "vmess".to_string(),
            server: Some("example.com".to_string()),
            port: Some(443),
            ..Default::default()
        };
        assert!(VmessOutbound::new(&config).is_err());
    }

    #[test]
    fn config_invalid_uuid_rejected() {
        let config = OutboundConfig {
            name: "v".to_string(),
            protocol: "vmess".to_string(),
            server: Some("example.com".to_string()),
            port: Some(443),
            uuid: Some("not-a-uuid".to_string()),
            ..Default::default()
        };
        assert!(VmessOutbound::new(&config).is_err());
    }

    #[tokio::test]
    async fn vmess_stream_roundtrip_over_duplex() {
        // 客户端侧密钥
        let req_key = [0x10u8; 16];
        let req_iv = [0x20u8; 16];
        let resp_auth = 0x77u8;
        let (resp_key, resp_iv) = protocol::derive_response_key_iv(&req_key, &req_iv);

        let (client_io, mut server_io) = tokio::io::duplex(65536);

        // 服务端：发响应头 + 回显一个分块
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let sealed = protocol::seal_response_header(&resp_key, &resp_iv, resp_auth).unwrap();
            server_io.write_all(&sealed).await.unwrap();

            // 读客户端分块
            let mut open_cipher = ChunkCipher::new(SecurityType::Aes128Gcm, &req_key, &req_iv);
            let mut len_buf = [0u8; 2];
            server_io.read_exact(&mut len_buf).await.unwrap();
            let chunk_len = open_cipher.open_length(len_buf);
            let mut chunk = vec![0u8; chunk_len];
            server_io.read_exact(&mut chunk).await.unwrap();
            let plain = open_cipher.open_chunk(&chunk).unwrap();
            assert_eq!(&plain, b"hello vmess");

            // 回显
            let mut seal_cipher = ChunkCipher::new(SecurityType::Aes128Gcm, &resp_key, &resp_iv);
            let frame = seal_cipher.seal_chunk(&plain).unwrap();
            server_io.write_all(&frame).await.unwrap();
        });

        let mut stream = VmessStream::new(
            Box::new(client_io),
            ChunkCipher::new(SecurityType::Aes128Gcm, &req_key, &req_iv),
            ChunkCipher::new(SecurityType::Aes128Gcm, &resp_key, &resp_iv),
            resp_key,
            resp_iv,
            resp_auth,
        );

        stream.write_all(b"hello vmess").await.unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello vmess");

        server.await.unwrap();
    }
}
