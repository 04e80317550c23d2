pub mod addr;
pub mod dialer;
pub mod error;
pub mod hash;
pub mod stream;
pub mod tls;
pub mod udp;

pub use addr::Address;
pub use error::Error;
pub use stream::{AsyncStream, ProxyStream};
pub use udp::{BoxUdpTransport, DatagramStream, UdpPacket, UdpTransport};
