use thiserror::Error;

/// 核心错误分类。
///
/// 所有 I/O 路径仍以 `anyhow::Result` 传播；需要按类别分流的调用方
/// （组策略重试、探针标记、入站日志）通过 `downcast_ref::<Error>()` 识别。
#[derive(Error, Debug)]
pub enum Error {
    // --- 域名解析 ---
    #[error("DNS resolution failed: no address found for {0}")]
    IpNotFound(String),

    #[error("DNS resolution failed: IP version mismatch for {0}")]
    IpVersionMismatch(String),

    #[error("DNS query timed out for {0}")]
    DnsTimeout(String),

    #[error("all DNS requests failed: {0}")]
    DnsUpstreamFailure(String),

    // --- 拨号 ---
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("TLS failure: {0}")]
    TlsFailure(String),

    #[error("proxy authentication required")]
    AuthRequired,

    #[error("method not allowed by upstream")]
    MethodNotAllowed,

    #[error("upstream returned code {0}")]
    RemoteCode(u16),

    // --- 协议 ---
    #[error("protocol error: {0}")]
    Protocol(String),

    // --- 策略 ---
    #[error("adapter '{adapter}' does not support network {network}")]
    UnsupportedNetwork { adapter: String, network: String },

    #[error("unsupported outbound protocol: {0}")]
    UnsupportedProtocol(String),

    // --- 拒绝 ---
    #[error("connection rejected by adapter '{0}'")]
    Rejected(String),

    // --- 取消 ---
    #[error("operation cancelled")]
    Cancelled,
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
