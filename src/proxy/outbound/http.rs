use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, Error, ProxyStream};
use crate::config::OutboundConfig;
use crate::proxy::transport::tls::TlsWrapper;
use crate::proxy::{AdapterKind, ChainedStream, DialCtx, OutboundHandler, Session};

/// HTTP CONNECT 出站（仅 TCP）
pub struct HttpOutbound {
    name: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
    tls: Option<Arc<TlsWrapper>>,
    dialer: Dialer,
}

impl HttpOutbound {
    pub fn new(config: &OutboundConfig) -> Result<Self> {
        let server = Address::Domain(config.require_server()?.to_string(), config.require_port()?);

        let tls = if config.tls {
            let sni = config
                .sni
                .clone()
                .unwrap_or_else(|| server.host());
            Some(Arc::new(TlsWrapper::new(
                sni,
                config.alpn.clone(),
                config.skip_cert_verify,
            )?))
        } else {
            None
        };

        Ok(Self {
            name: config.name.clone(),
            server,
            username: config.username.clone(),
            password: config.password.clone(),
            tls,
            dialer: super::outbound_dialer(config),
        })
    }

    async fn handshake(&self, stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let mut stream = stream;
        let target_str = format!("{}:{}", target.host(), target.port());

        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
            target_str, target_str
        );
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let cred = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;

        let code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid CONNECT response: {}", status_line.trim())))?;

        match code {
            200 => {}
            407 => return Err(Error::AuthRequired.into()),
            405 => return Err(Error::MethodNotAllowed.into()),
            c if c >= 500 => return Err(Error::RemoteCode(c).into()),
            c => return Err(Error::RemoteCode(c).into()),
        }

        // 吃掉剩余响应头
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        Ok(Box::new(reader.into_inner()))
    }
}

#[async_trait]
impl OutboundHandler for HttpOutbound {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Http
    }

    fn server_addr(&self) -> Option<Address> {
        Some(self.server.clone())
    }

    async fn connect(&self, ctx: &DialCtx, session: &Session) -> Result<ChainedStream> {
        debug!(target = %session.target, server = %self.server, "http CONNECT");

        let transport = super::dial_server(ctx, &self.dialer, &self.server).await?;

        let tls = self.tls.clone();
        let target = session.target.clone();

        let transport = match tls {
            Some(wrapper) => {
                let (inner, chain) = transport.into_parts();
                let wrapped = wrapper.wrap(inner).await?;
                ChainedStream::with_chain(wrapped, chain)
            }
            None => transport,
        };

        let (inner, chain) = transport.into_parts();
        let stream = self.handshake(inner, &target).await?;
        let mut stream = ChainedStream::with_chain(stream, chain);
        stream.push_inner_hop(&self.name);

        debug!(target = %session.target, "http CONNECT tunnel established");
        Ok(stream)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
