//! 可插拔的流包装传输层。
//!
//! 传输层是纯粹的流变换：拿到一条已建立的字节流，包出另一条字节流，
//! 在其上再跑协议握手。TLS 与 WebSocket 在树内实现；h2/gRPC 帧层由
//! 外部组件按同一契约提供。

pub mod tls;
pub mod ws;

use anyhow::Result;

use crate::common::ProxyStream;
use crate::config::TransportConfig;

/// 按配置组合出流变换链：先 TLS（如启用），再可选的流包装
pub struct StreamTransform {
    tls: Option<tls::TlsWrapper>,
    ws: Option<ws::WsWrapper>,
}

impl StreamTransform {
    pub fn from_config(server_host: &str, config: &TransportConfig) -> Result<Self> {
        let tls = if config.tls {
            let sni = config
                .sni
                .clone()
                .unwrap_or_else(|| server_host.to_string());
            let alpn = config.alpn.clone();
            Some(tls::TlsWrapper::new(sni, alpn, config.skip_cert_verify)?)
        } else {
            None
        };

        let ws = match config.network.as_str() {
            "ws" => Some(ws::WsWrapper::new(
                server_host.to_string(),
                config.ws_path.clone(),
                config.ws_headers.clone(),
            )),
            "" | "tcp" => None,
            other => anyhow::bail!("unsupported transport network: {}", other),
        };

        Ok(Self { tls, ws })
    }

    /// 对已建立的底层流依次应用各包装层
    pub async fn apply(&self, stream: ProxyStream) -> Result<ProxyStream> {
        let stream = match &self.tls {
            Some(tls) => tls.wrap(stream).await?,
            None => stream,
        };
        let stream = match &self.ws {
            Some(ws) => ws.wrap(stream).await?,
            None => stream,
        };
        Ok(stream)
    }
}
