//! 出站 TLS 的公共层。
//!
//! DoT、各线路适配器的 TLS 包装和探针的 HTTPS 探测共用同一套选项：
//! SNI（可被配置覆盖，IP 字面量走 IpAddress 形态）、ALPN 与
//! skip-cert-verify。这里统一把选项折算成 connector + ServerName，
//! 上层只管拿去握手。

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use super::error::Error;

/// 一次出站 TLS 握手的全部选项
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// 发往对端的 server name；IP 字面量也接受
    pub sni: String,
    pub alpn: Vec<String>,
    pub skip_cert_verify: bool,
}

impl TlsOptions {
    pub fn for_host(sni: impl Into<String>) -> Self {
        Self {
            sni: sni.into(),
            alpn: Vec::new(),
            skip_cert_verify: false,
        }
    }

    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn insecure(mut self, skip_cert_verify: bool) -> Self {
        self.skip_cert_verify = skip_cert_verify;
        self
    }
}

/// 把 SNI 串折算成 rustls 的 ServerName（域名或 IP 形态）
pub fn server_name(sni: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = sni.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(sni.to_string())
        .map_err(|e| Error::TlsFailure(format!("invalid server name '{}': {}", sni, e)).into())
}

/// 按选项构建 connector 与握手用的 ServerName
pub fn connector(options: &TlsOptions) -> Result<(TlsConnector, ServerName<'static>)> {
    let name = server_name(&options.sni)?;
    let config = client_config(options)?;
    Ok((TlsConnector::from(Arc::new(config)), name))
}

/// 按选项构建 ClientConfig
pub fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let provider = Arc::new(ring_provider::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsFailure(format!("tls config: {}", e)))?;

    let mut config = if options.skip_cert_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(system_roots())
            .with_no_client_auth()
    };

    config.alpn_protocols = options.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

fn system_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// skip-cert-verify 的证书校验器。
///
/// 只放过证书链；握手签名仍交给 provider 的算法表校验，
/// 支持的签名方案也从 provider 取，不另维护清单。
#[derive(Debug)]
pub struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
