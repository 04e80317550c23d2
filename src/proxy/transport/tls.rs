use anyhow::Result;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::tls::TlsOptions;
use crate::common::{Error, ProxyStream};

/// TLS 流包装层
pub struct TlsWrapper {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    sni: String,
}

impl TlsWrapper {
    pub fn new(sni: String, alpn: Option<Vec<String>>, skip_cert_verify: bool) -> Result<Self> {
        let mut options = TlsOptions::for_host(sni.clone()).insecure(skip_cert_verify);
        if let Some(alpn) = alpn {
            options.alpn = alpn;
        }
        let (connector, server_name) = crate::common::tls::connector(&options)?;

        Ok(Self {
            connector,
            server_name,
            sni,
        })
    }

    pub async fn wrap(&self, stream: ProxyStream) -> Result<ProxyStream> {
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| Error::TlsFailure(e.to_string()))?;
        debug!(sni = self.sni.as_str(), "tls handshake completed");
        Ok(Box::new(tls_stream))
    }
}
