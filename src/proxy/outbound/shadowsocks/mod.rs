pub mod crypto;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, Error, ProxyStream, UdpPacket, UdpTransport};
use crate::config::OutboundConfig;
use crate::proxy::transport::StreamTransform;
use crate::proxy::{
    AdapterKind, ChainedDatagram, ChainedStream, DialCtx, OutboundHandler, Session,
};

use crypto::{derive_subkey, evp_bytes_to_key, AeadCipher, CipherKind};

/// 单个 AEAD 帧的最大载荷（0x3FFF）
const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Shadowsocks 出站（AEAD 族）
pub struct ShadowsocksOutbound {
    name: String,
    server: Address,
    cipher: CipherKind,
    key: Vec<u8>,
    udp: bool,
    transform: StreamTransform,
    dialer: Dialer,
}

impl ShadowsocksOutbound {
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        let server = Address::Domain(config.require_server()?.to_string(), config.require_port()?);
        let password = config
            .password
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("shadowsocks '{}' missing 'password'", config.name))?;
        let method = config
            .cipher
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("shadowsocks '{}' missing 'cipher'", config.name))?;

        let cipher = CipherKind::parse(method)?;
        let key = evp_bytes_to_key(password.as_bytes(), cipher.key_len());
        let transform = StreamTransform::from_config(&server.host(), &config.transport())?;

        Ok(Self {
            name: config.name.clone(),
            server,
            cipher,
            key,
            udp: config.udp,
            transform,
            dialer: super::outbound_dialer(config),
        })
    }
}

#[async_trait]
impl OutboundHandler for ShadowsocksOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Shadowsocks
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, server = %self.server, "shadowsocks connecting");

        let transport = super::dial_server(ctx, &self.dialer, &self.server).await?;
        let (inner, chain) = transport.into_parts();
        let mut stream = self.transform.apply(inner).await?;

        // 发送方向：随机 salt + 子密钥
        let mut salt = vec![0u8; self.cipher.salt_len()];
        rand::thread_rng().fill(&mut salt[..]);
        let subkey = derive_subkey(&self.key, &salt, self.cipher.key_len())?;
        let mut encoder = AeadCipher::new(self.cipher, subkey);

        stream.write_all(&salt).await?;

        // 首帧：目标地址
        let mut addr_buf = BytesMut::new();
        session.target.encode_socks5(&mut addr_buf);
        let len_frame = encoder.encrypt(&(addr_buf.len() as u16).to_be_bytes())?;
        let payload_frame = encoder.encrypt(&addr_buf)?;
        stream.write_all(&len_frame).await?;
        stream.write_all(&payload_frame).await?;

        debug!(target = %session.target, "shadowsocks handshake complete");

        let aead = AeadStream::new(stream, encoder, self.cipher, self.key.clone());
        let mut stream = ChainedStream::with_chain(Box::new(aead), chain);
        stream.push_inner_hop(&self.name);
        Ok(stream)
    }

    async fn connect_udp(&self, _ctx: &DialCtx, session: &Session) -> Result<ChainedDatagram> {
        if !self.udp {
            return Err(Error::UnsupportedNetwork {
                adapter: self.name.clone(),
                network: "udp".to_string(),
            }
            .into());
        }

        let server_addr: SocketAddr = match self.server.ip() {
            Some(ip) => SocketAddr::new(ip, self.server.port()),
            None => tokio::net::lookup_host(format!("{}:{}", self.server.host(), self.server.port()))
                .await?
                .next()
                .ok_or_else(|| Error::IpNotFound(self.server.host()))?,
        };

        let bind = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        debug!(target = %session.target, server = %server_addr, "shadowsocks udp bound");

        let transport = ShadowsocksUdpTransport {
            socket: Arc::new(socket),
            server_addr,
            cipher: self.cipher,
            key: self.key.clone(),
        };
        let mut datagram = ChainedDatagram::new(Box::new(transport));
        datagram.push_inner_hop(&self.name);
        Ok(datagram)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Shadowsocks UDP：每包独立 salt，载荷为 [SOCKS5 地址][数据] 的 AEAD 密文
struct ShadowsocksUdpTransport {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    cipher: CipherKind,
    key: Vec<u8>,
}

#[async_trait]
impl UdpTransport for ShadowsocksUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let mut salt = vec![0u8; self.cipher.salt_len()];
        rand::thread_rng().fill(&mut salt[..]);
        let subkey = derive_subkey(&self.key, &salt, self.cipher.key_len())?;

        let mut plain = BytesMut::new();
        packet.addr.encode_socks5(&mut plain);
        plain.extend_from_slice(&packet.data);

        let sealed = crypto::seal_packet(self.cipher, &subkey, &plain)?;

        let mut dgram = Vec::with_capacity(salt.len() + sealed.len());
        dgram.extend_from_slice(&salt);
        dgram.extend_from_slice(&sealed);
        self.socket.send_to(&dgram, self.server_addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        loop {
            let mut buf = vec![0u8; 65535];
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.server_addr {
                continue;
            }
            let data = &buf[..n];
            let salt_len = self.cipher.salt_len();
            if data.len() <= salt_len + self.cipher.tag_len() {
                continue;
            }
            let subkey = derive_subkey(&self.key, &data[..salt_len], self.cipher.key_len())?;
            let plain = match crypto::open_packet(self.cipher, &subkey, &data[salt_len..]) {
                Ok(p) => p,
                Err(_) => continue, // 无法解密的包丢弃
            };
            let (addr, consumed) = Address::parse_socks5(&plain)?;
            return Ok(UdpPacket {
                addr,
                data: Bytes::copy_from_slice(&plain[consumed..]),
            });
        }
    }
}

/// 读状态机
enum ReadState {
    Salt { buf: Vec<u8>, read: usize },
    Length { buf: Vec<u8>, read: usize },
    Payload { buf: Vec<u8>, read: usize },
}

/// 写状态机
enum WriteState {
    Ready,
    Writing { data: Vec<u8>, written: usize, consumed: usize },
}

/// AEAD 流：写侧按帧加密，读侧先读服务端 salt 再按帧解密
pub struct AeadStream {
    inner: ProxyStream,
    encoder: AeadCipher,
    decoder: Option<AeadCipher>,
    cipher: CipherKind,
    key: Vec<u8>,
    buffered: Vec<u8>,
    buffered_pos: usize,
    read_state: ReadState,
    write_state: WriteState,
}

impl AeadStream {
    fn new(inner: ProxyStream, encoder: AeadCipher, cipher: CipherKind, key: Vec<u8>) -> Self {
        Self {
            inner,
            encoder,
            decoder: None,
            cipher,
            key,
            buffered: Vec::new(),
            buffered_pos: 0,
            read_state: ReadState::Salt {
                buf: vec![0u8; cipher.salt_len()],
                read: 0,
            },
            write_state: WriteState::Ready,
        }
    }
}

/// 从内层流读满 buf；EOF 报 UnexpectedEof
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

impl AsyncRead for AeadStream {
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
                ReadState::Salt { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        other => return other,
                    }
                    let subkey = derive_subkey(&this.key, buf, this.cipher.key_len())
                        .map_err(io::Error::other)?;
                    this.decoder = Some(AeadCipher::new(this.cipher, subkey));
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + this.cipher.tag_len()],
                        read: 0,
                    };
                }
                ReadState::Length { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        other => return other,
                    }
                    let decoder = this
                        .decoder
                        .as_mut()
                        .ok_or_else(|| io::Error::other("decoder not initialized"))?;
                    let plain = decoder.decrypt(buf).map_err(io::Error::other)?;
                    let payload_len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if payload_len > MAX_PAYLOAD_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("payload length {} exceeds maximum", payload_len),
                        )));
                    }
                    this.read_state = ReadState::Payload {
                        buf: vec![0u8; payload_len + this.cipher.tag_len()],
                        read: 0,
                    };
                }
                ReadState::Payload { buf, read } => {
                    match poll_fill(&mut this.inner, cx, buf, read) {
                        Poll::Ready(Ok(())) => {}
                        other => return other,
                    }
                    let decoder = this
                        .decoder
                        .as_mut()
                        .ok_or_else(|| io::Error::other("decoder not initialized"))?;
                    this.buffered = decoder.decrypt(buf).map_err(io::Error::other)?;
                    this.buffered_pos = 0;
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + this.cipher.tag_len()],
                        read: 0,
                    };
                }
            }
        }
    }
}

impl AsyncWrite for AeadStream {
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
                    let chunk_len = buf.len().min(MAX_PAYLOAD_SIZE);
                    let len_frame = this
                        .encoder
                        .encrypt(&(chunk_len as u16).to_be_bytes())
                        .map_err(io::Error::other)?;
                    let payload_frame = this
                        .encoder
                        .encrypt(&buf[..chunk_len])
                        .map_err(io::Error::other)?;

                    let mut data = Vec::with_capacity(len_frame.len() + payload_frame.len());
                    data.extend_from_slice(&len_frame);
                    data.extend_from_slice(&payload_frame);
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_config(port: u16) -> OutboundConfig {
        OutboundConfig {
            name: "ss-out".to_string(),
            protocol: "ss".to_string(),
            server: Some("127.0.0.1".to_string()),
            port: Some(port),
            cipher: Some("aes-128-gcm".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_fields_rejected() {
        let mut config = make_config(1);
        config.password = None;
        assert!(ShadowsocksOutbound::new(&config).is_err());

        let mut config = make_config(1);
        config.cipher = None;
        assert!(ShadowsocksOutbound::new(&config).is_err());
    }

    /// 最小 shadowsocks 服务端：解出首帧地址，随后把流量按帧回显
    async fn run_mock_server(listener: tokio::net::TcpListener, key: Vec<u8>, cipher: CipherKind) {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut salt = vec![0u8; cipher.salt_len()];
        sock.read_exact(&mut salt).await.unwrap();
        let subkey = derive_subkey(&key, &salt, cipher.key_len()).unwrap();
        let mut decoder = AeadCipher::new(cipher, subkey);

        // 依次读两帧：地址帧 + 数据帧
        let mut frames = Vec::new();
        for _ in 0..2 {
            let mut len_buf = vec![0u8; 2 + cipher.tag_len()];
            sock.read_exact(&mut len_buf).await.unwrap();
            let len_plain = decoder.decrypt(&len_buf).unwrap();
            let payload_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
            let mut payload_buf = vec![0u8; payload_len + cipher.tag_len()];
            sock.read_exact(&mut payload_buf).await.unwrap();
            frames.push(decoder.decrypt(&payload_buf).unwrap());
        }

        let (addr, _) = Address::parse_socks5(&frames[0]).unwrap();
        assert_eq!(addr, Address::Domain("echo.test".to_string(), 7777));

        // 回写：自己的 salt + 回显数据帧
        let mut server_salt = vec![0u8; cipher.salt_len()];
        rand::thread_rng().fill(&mut server_salt[..]);
        let server_subkey = derive_subkey(&key, &server_salt, cipher.key_len()).unwrap();
        let mut encoder = AeadCipher::new(cipher, server_subkey);

        sock.write_all(&server_salt).await.unwrap();
        let len_frame = encoder.encrypt(&(frames[1].len() as u16).to_be_bytes()).unwrap();
        let data_frame = encoder.encrypt(&frames[1]).unwrap();
        sock.write_all(&len_frame).await.unwrap();
        sock.write_all(&data_frame).await.unwrap();
    }

    #[tokio::test]
    async fn shadowsocks_stream_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cipher = CipherKind::Aes128Gcm;
        let key = evp_bytes_to_key(b"secret", cipher.key_len());
        let server = tokio::spawn(run_mock_server(listener, key, cipher));

        let outbound = ShadowsocksOutbound::new(&make_config(port)).unwrap();
        let session = Session::tcp(Address::Domain("echo.test".to_string(), 7777));
        let mut stream = outbound.connect(&DialCtx::plain(), &session).await.unwrap();

        assert_eq!(crate::proxy::ChainedStream::chain(&stream).hops(), vec!["ss-out"]);

        stream.write_all(b"ss payload").await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ss payload");

        server.await.unwrap();
    }
}
