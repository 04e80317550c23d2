use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use opengate::app::OutboundManager;
use opengate::config::Config;
use opengate::dns::{self, EnhancedMode, FakeIpPool, HostMapper, Resolver};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let text = std::fs::read_to_string(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot read config '{}': {}", config_path, e))?;
    let config = Config::from_yaml(&text)?;

    let manager = Arc::new(OutboundManager::new(&config.proxies, &config.proxy_groups)?);
    info!(outbounds = manager.names().len(), "outbound graph ready");

    let mut dns_server = None;
    if config.dns.enable {
        let resolver = Resolver::new(&config.dns, None).await?;
        dns::set_global_resolver(resolver.clone());

        let mode = EnhancedMode::parse(&config.dns.enhanced_mode)?;
        let pool = if mode == EnhancedMode::FakeIp {
            Some(Arc::new(FakeIpPool::new(
                &config.dns.fake_ip_range,
                config.dns.fake_ip_filter.clone(),
            )?))
        } else {
            None
        };
        let mapper = Arc::new(HostMapper::new(mode, pool));

        if let Some(listen) = &config.dns.listen {
            let handler = dns::server::ServerHandler::new(resolver, mapper);
            dns_server = Some(dns::server::serve(listen, handler).await?);
        }
    }

    info!("opengate core running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    drop(dns_server);
    info!("bye");
    Ok(())
}
