use anyhow::Result;
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Address, Error};

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Trojan 密码散列：hex(SHA224(password))，56 个 ASCII 字符
pub fn password_hash(password: &str) -> String {
    let digest = Sha224::digest(password.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn encode_addr(addr: &Address) -> Vec<u8> {
    let mut buf = bytes::BytesMut::with_capacity(32);
    addr.encode_socks5(&mut buf);
    buf.to_vec()
}

/// 写请求头：
/// [hex hash 56B][CRLF][CMD 1B][ATYP+ADDR+PORT][CRLF]
pub async fn write_request(
    stream: &mut (impl AsyncWrite + Unpin),
    password_hash: &str,
    target: &Address,
    command: u8,
) -> Result<()> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(password_hash.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.push(command);
    buf.extend_from_slice(&encode_addr(target));
    buf.extend_from_slice(b"\r\n");
    stream.write_all(&buf).await?;
    Ok(())
}

/// UDP 帧：[ATYP+ADDR+PORT][LENGTH 2B BE][CRLF][PAYLOAD]
pub async fn write_udp_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    addr: &Address,
    payload: &[u8],
) -> Result<()> {
    let addr_bytes = encode_addr(addr);
    let mut buf = Vec::with_capacity(addr_bytes.len() + 4 + payload.len());
    buf.extend_from_slice(&addr_bytes);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

/// 读一个 UDP 帧，返回 (来源地址, 载荷)
pub async fn read_udp_frame(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<(Address, Vec<u8>)> {
    let atyp = stream.read_u8().await?;

    let addr = match atyp {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Ip((std::net::Ipv4Addr::from(ip), port).into())
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            Address::Domain(String::from_utf8(domain)?, port)
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Ip((std::net::Ipv6Addr::from(ip), port).into())
        }
        other => {
            return Err(
                Error::Protocol(format!("trojan: unsupported address type 0x{:02x}", other)).into(),
            );
        }
    };

    let length = stream.read_u16().await? as usize;
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    Ok((addr, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_sha224_hex() {
        let hash = password_hash("password123");
        assert_eq!(hash.len(), 56);
        assert_eq!(password_hash("password123"), hash);
        assert_ne!(password_hash("other"), hash);
    }

    #[tokio::test]
    async fn udp_frame_roundtrip() {
        let addr = Address::Domain("dns.test".to_string(), 53);
        let mut buf = Vec::new();
        write_udp_frame(&mut buf, &addr, b"query-bytes").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (parsed, payload) = read_udp_frame(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(payload, b"query-bytes");
    }

    #[tokio::test]
    async fn request_header_layout() {
        let mut buf = Vec::new();
        let hash = password_hash("pw");
        write_request(&mut buf, &hash, &Address::Ip("1.2.3.4:443".parse().unwrap()), CMD_CONNECT)
            .await
            .unwrap();

        assert_eq!(&buf[..56], hash.as_bytes());
        assert_eq!(&buf[56..58], b"\r\n");
        assert_eq!(buf[58], CMD_CONNECT);
        assert_eq!(buf[59], 0x01); // IPv4 atyp
        assert_eq!(&buf[buf.len() - 2..], b"\r\n");
    }
}
