pub mod types;

pub use types::{
    Config, DnsConfig, FallbackFilterConfig, GroupConfig, OutboundConfig, TransportConfig,
};
