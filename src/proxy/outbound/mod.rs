pub mod direct;
pub mod http;
pub mod pool;
pub mod reject;
pub mod shadowsocks;
pub mod socks5;
pub mod trojan;
pub mod vmess;

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::common::dialer::Dialer;
use crate::common::{Address, Error};
use crate::config::OutboundConfig;
use crate::proxy::{ChainedStream, DialCtx, Network, OutboundHandler};

/// 按协议标签构建出站适配器
pub fn build_outbound(config: &OutboundConfig) -> Result<Arc<dyn OutboundHandler>> {
    let handler: Arc<dyn OutboundHandler> = match config.protocol.as_str() {
        "direct" => Arc::new(direct::DirectOutbound::new(config.name.clone())),
        "reject" => Arc::new(reject::RejectOutbound::new(config.name.clone())),
        "http" => Arc::new(http::HttpOutbound::new(config)?),
        "socks5" => Arc::new(socks5::Socks5Outbound::new(config)?),
        "ss" | "shadowsocks" => Arc::new(shadowsocks::ShadowsocksOutbound::new(config)?),
        "vmess" => Arc::new(vmess::VmessOutbound::new(config)?),
        "trojan" => Arc::new(trojan::TrojanOutbound::new(config)?),
        // ShadowsocksR / Snell 的线缆编解码由外部组件提供，
        // 核心侧不落地这两个协议的握手实现
        other => {
            return Err(Error::UnsupportedProtocol(other.to_string()).into());
        }
    };
    debug!(name = config.name.as_str(), protocol = config.protocol.as_str(), "outbound registered");
    Ok(handler)
}

/// 构造线路适配器使用的拨号器，注入全局解析器（若已安装）
pub(crate) fn outbound_dialer(config: &OutboundConfig) -> Dialer {
    let dialer_config = config.dialer.clone().unwrap_or_default();
    match crate::dns::global_resolver() {
        Some(resolver) => Dialer::with_resolver(
            dialer_config,
            Arc::new(crate::dns::ResolverHandle(resolver)),
        ),
        None => Dialer::new(dialer_config),
    }
}

/// 建立到代理服务器的底层传输。
///
/// 上下文槽里有嵌套拨号器（组下发）时必须经由它；否则解析并直连。
pub(crate) async fn dial_server(
    ctx: &DialCtx,
    dialer: &Dialer,
    server: &Address,
) -> Result<ChainedStream> {
    match &ctx.dialer {
        Some(nested) => nested.dial(Network::Tcp, server).await,
        None => {
            let stream = dialer.connect_host(&server.host(), server.port()).await?;
            Ok(ChainedStream::new(Box::new(stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_known_protocols() {
        let direct = OutboundConfig {
            name: "DIRECT".to_string(),
            protocol: "direct".to_string(),
            ..Default::default()
        };
        assert!(build_outbound(&direct).is_ok());

        let reject = OutboundConfig {
            name: "REJECT".to_string(),
            protocol: "reject".to_string(),
            ..Default::default()
        };
        assert!(build_outbound(&reject).is_ok());
    }

    #[test]
    fn build_unknown_protocol_fails_typed() {
        let config = OutboundConfig {
            name: "x".to_string(),
            protocol: "snell".to_string(),
            ..Default::default()
        };
        let err = match build_outbound(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected build_outbound to fail"),
        };
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedProtocol(_))
        ));
    }
}
