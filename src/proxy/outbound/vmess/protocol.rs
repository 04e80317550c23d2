//! VMess AEAD 协议原语：认证 ID、KDF、请求/响应头、分块流加密。

use aes_gcm::{aead::Aead, Aes128Gcm, KeyInit, Nonce};
use anyhow::Result;
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest as Md5Digest, Md5};
use sha2::Sha256;

use crate::common::{Address, Error};

type HmacMd5 = Hmac<Md5>;
type HmacSha256 = Hmac<Sha256>;

pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;

/// 请求选项：chunk stream + chunk masking
const OPT_CHUNK_STREAM_MASKED: u8 = 0x05;

/// VMess 安全类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Aes128Gcm,
    Chacha20Poly1305,
    None,
}

impl SecurityType {
    pub fn parse(s: &str) -> Self {
        match s {
            "chacha20-poly1305" => SecurityType::Chacha20Poly1305,
            "none" => SecurityType::None,
            _ => SecurityType::Aes128Gcm,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SecurityType::Aes128Gcm => 0x03,
            SecurityType::Chacha20Poly1305 => 0x04,
            SecurityType::None => 0x05,
        }
    }
}

/// cmd_key = MD5(UUID)
pub fn uuid_to_cmd_key(uuid: &[u8; 16]) -> [u8; 16] {
    let digest = Md5::digest(uuid);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

/// 认证 ID：HMAC-MD5(cmd_key, 时间戳大端)
pub fn create_auth_id(cmd_key: &[u8; 16], timestamp: u64) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(cmd_key).expect("hmac accepts any key length");
    mac.update(&timestamp.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// VMess KDF：HMAC-SHA256 链
pub fn kdf(key: &[u8], paths: &[&[u8]]) -> Vec<u8> {
    let mut current = key.to_vec();
    for path in paths {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&current).expect("hmac accepts any key length");
        mac.update(path);
        current = mac.finalize().into_bytes().to_vec();
    }
    current
}

fn kdf16(key: &[u8], paths: &[&[u8]]) -> [u8; 16] {
    let material = kdf(key, paths);
    let mut out = [0u8; 16];
    out.copy_from_slice(&material[..16]);
    out
}

fn kdf12(key: &[u8], paths: &[&[u8]]) -> [u8; 12] {
    let material = kdf(key, paths);
    let mut out = [0u8; 12];
    out.copy_from_slice(&material[..12]);
    out
}

pub fn fnv1a_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn encode_address(buf: &mut BytesMut, addr: &Address) {
    match addr {
        Address::Ip(socket_addr) => {
            buf.put_u16(socket_addr.port());
            match socket_addr.ip() {
                std::net::IpAddr::V4(v4) => {
                    buf.put_u8(0x01);
                    buf.put_slice(&v4.octets());
                }
                std::net::IpAddr::V6(v6) => {
                    buf.put_u8(0x03);
                    buf.put_slice(&v6.octets());
                }
            }
        }
        Address::Domain(domain, port) => {
            buf.put_u16(*port);
            buf.put_u8(0x02);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
        }
    }
}

/// 编码并加封 AEAD 请求头。
///
/// 输出布局: auth_id(16) + sealed_length(2+16) + nonce(8) + sealed_header
pub fn encode_request_header(
    uuid: &[u8; 16],
    security: SecurityType,
    cmd: u8,
    target: &Address,
    req_body_iv: &[u8; 16],
    req_body_key: &[u8; 16],
    resp_auth: u8,
    timestamp: u64,
) -> Result<Vec<u8>> {
    let mut header = BytesMut::with_capacity(64);
    header.put_u8(1); // 版本
    header.put_slice(req_body_iv);
    header.put_slice(req_body_key);
    header.put_u8(resp_auth);
    header.put_u8(OPT_CHUNK_STREAM_MASKED);
    header.put_u8(security.to_byte() & 0x0f); // P=0 无 padding
    header.put_u8(0x00); // 保留
    header.put_u8(cmd);
    encode_address(&mut header, target);
    let checksum = fnv1a_hash(&header);
    header.put_u32(checksum);

    let cmd_key = uuid_to_cmd_key(uuid);
    let auth_id = create_auth_id(&cmd_key, timestamp);

    let mut nonce = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);

    let header_key = kdf16(&cmd_key, &[b"VMess Header AEAD Key", &auth_id, &nonce]);
    let header_nonce = kdf12(&cmd_key, &[b"VMess Header AEAD Nonce", &auth_id, &nonce]);
    let sealed_header = Aes128Gcm::new_from_slice(&header_key)
        .expect("16-byte key")
        .encrypt(Nonce::from_slice(&header_nonce), header.as_ref())
        .map_err(|e| Error::Protocol(format!("vmess header seal: {}", e)))?;

    let length_key = kdf16(&cmd_key, &[b"VMess Header AEAD Key Length", &auth_id, &nonce]);
    let length_nonce = kdf12(&cmd_key, &[b"VMess Header AEAD Nonce Length", &auth_id, &nonce]);
    let sealed_length = Aes128Gcm::new_from_slice(&length_key)
        .expect("16-byte key")
        .encrypt(
            Nonce::from_slice(&length_nonce),
            (sealed_header.len() as u16).to_be_bytes().as_ref(),
        )
        .map_err(|e| Error::Protocol(format!("vmess length seal: {}", e)))?;

    let mut out = Vec::with_capacity(16 + sealed_length.len() + 8 + sealed_header.len());
    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&sealed_length);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed_header);
    Ok(out)
}

/// 响应 key/iv = SHA256(请求 key/iv) 截断 16 字节
pub fn derive_response_key_iv(
    req_body_key: &[u8; 16],
    req_body_iv: &[u8; 16],
) -> ([u8; 16], [u8; 16]) {
    let key_digest = Sha256::digest(req_body_key);
    let iv_digest = Sha256::digest(req_body_iv);
    let mut resp_key = [0u8; 16];
    let mut resp_iv = [0u8; 16];
    resp_key.copy_from_slice(&key_digest[..16]);
    resp_iv.copy_from_slice(&iv_digest[..16]);
    (resp_key, resp_iv)
}

/// 加封响应头（服务端侧 / 测试用）。布局: sealed_length(2+16) + sealed_header
pub fn seal_response_header(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    resp_auth: u8,
) -> Result<Vec<u8>> {
    let header = [resp_auth, 0x00, 0x00, 0x00];

    let len_key = kdf16(resp_key, &[b"AEAD Resp Header Len Key"]);
    let len_nonce = kdf12(resp_iv, &[b"AEAD Resp Header Len IV"]);
    let sealed_length = Aes128Gcm::new_from_slice(&len_key)
        .expect("16-byte key")
        .encrypt(
            Nonce::from_slice(&len_nonce),
            (header.len() as u16).to_be_bytes().as_ref(),
        )
        .map_err(|e| Error::Protocol(format!("vmess resp length seal: {}", e)))?;

    let header_key = kdf16(resp_key, &[b"AEAD Resp Header Key"]);
    let header_nonce = kdf12(resp_iv, &[b"AEAD Resp Header IV"]);
    let sealed_header = Aes128Gcm::new_from_slice(&header_key)
        .expect("16-byte key")
        .encrypt(Nonce::from_slice(&header_nonce), header.as_ref())
        .map_err(|e| Error::Protocol(format!("vmess resp header seal: {}", e)))?;

    let mut out = Vec::with_capacity(sealed_length.len() + sealed_header.len());
    out.extend_from_slice(&sealed_length);
    out.extend_from_slice(&sealed_header);
    Ok(out)
}

/// 解开响应头长度段（前 18 字节），返回密文头长度
pub fn open_response_length(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    sealed: &[u8],
) -> Result<usize> {
    let len_key = kdf16(resp_key, &[b"AEAD Resp Header Len Key"]);
    let len_nonce = kdf12(resp_iv, &[b"AEAD Resp Header Len IV"]);
    let plain = Aes128Gcm::new_from_slice(&len_key)
        .expect("16-byte key")
        .decrypt(Nonce::from_slice(&len_nonce), sealed)
        .map_err(|_| Error::Protocol("vmess response length open failed".to_string()))?;
    Ok(u16::from_be_bytes([plain[0], plain[1]]) as usize)
}

/// 解开响应头并校验 resp_auth
pub fn open_response_header(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    sealed: &[u8],
    expected_auth: u8,
) -> Result<()> {
    let header_key = kdf16(resp_key, &[b"AEAD Resp Header Key"]);
    let header_nonce = kdf12(resp_iv, &[b"AEAD Resp Header IV"]);
    let plain = Aes128Gcm::new_from_slice(&header_key)
        .expect("16-byte key")
        .decrypt(Nonce::from_slice(&header_nonce), sealed)
        .map_err(|_| Error::Protocol("vmess response header open failed".to_string()))?;

    if plain.is_empty() {
        return Err(Error::Protocol("empty vmess response header".to_string()).into());
    }
    if plain[0] != expected_auth {
        return Err(Error::Protocol(format!(
            "vmess response auth mismatch: expected 0x{:02x}, got 0x{:02x}",
            expected_auth, plain[0]
        ))
        .into());
    }
    Ok(())
}

/// Shake128 长度掩码流
pub struct ShakeSizeParser {
    buffer: Vec<u8>,
    pos: usize,
}

impl ShakeSizeParser {
    pub fn new(nonce: &[u8]) -> Self {
        use sha3::digest::{ExtendableOutput, Update, XofReader};
        use sha3::Shake128;

        let mut hasher = Shake128::default();
        hasher.update(nonce);
        let mut reader = hasher.finalize_xof();
        let mut buffer = vec![0u8; 32768];
        reader.read(&mut buffer);
        Self { buffer, pos: 0 }
    }

    fn next_mask(&mut self) -> u16 {
        if self.pos + 2 > self.buffer.len() {
            self.pos = 0;
        }
        let mask = u16::from_be_bytes([self.buffer[self.pos], self.buffer[self.pos + 1]]);
        self.pos += 2;
        mask
    }

    pub fn encode_size(&mut self, size: u16) -> u16 {
        size ^ self.next_mask()
    }

    pub fn decode_size(&mut self, masked: u16) -> u16 {
        masked ^ self.next_mask()
    }
}

pub const VMESS_TAG_LEN: usize = 16;
pub const MAX_CHUNK: usize = 16384;

/// 数据流分块加解密器
pub struct ChunkCipher {
    security: SecurityType,
    key: Vec<u8>,
    nonce_tail: [u8; 10],
    count: u16,
    size_parser: ShakeSizeParser,
}

impl ChunkCipher {
    pub fn new(security: SecurityType, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let mut nonce_tail = [0u8; 10];
        nonce_tail.copy_from_slice(&iv[2..12]);
        Self {
            security,
            key: key.to_vec(),
            nonce_tail,
            count: 0,
            size_parser: ShakeSizeParser::new(iv),
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.nonce_tail);
        self.count = self.count.wrapping_add(1);
        nonce
    }

    fn chacha_key(&self) -> [u8; 32] {
        // ChaCha20 密钥扩展：MD5(key) || MD5(MD5(key))
        let mut ck = [0u8; 32];
        let first = Md5::digest(&self.key);
        ck[..16].copy_from_slice(&first);
        ck[16..].copy_from_slice(&Md5::digest(first));
        ck
    }

    /// 加密一个分块，输出 [masked_len 2B][密文+tag]
    pub fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();

        let sealed = match self.security {
            SecurityType::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .expect("16-byte key")
                .encrypt(Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| Error::Protocol(format!("vmess chunk seal: {}", e)))?,
            SecurityType::Chacha20Poly1305 => {
                use chacha20poly1305::{aead::Aead as ChaAead, ChaCha20Poly1305, KeyInit as ChaKeyInit};
                ChaCha20Poly1305::new_from_slice(&self.chacha_key())
                    .expect("32-byte key")
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| Error::Protocol(format!("vmess chunk seal: {}", e)))?
            }
            SecurityType::None => plaintext.to_vec(),
        };

        let masked = self.size_parser.encode_size(sealed.len() as u16);
        let mut out = Vec::with_capacity(2 + sealed.len());
        out.extend_from_slice(&masked.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open_length(&mut self, raw: [u8; 2]) -> usize {
        self.size_parser.decode_size(u16::from_be_bytes(raw)) as usize
    }

    pub fn open_chunk(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();

        match self.security {
            SecurityType::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .expect("16-byte key")
                .decrypt(Nonce::from_slice(&nonce), ciphertext)
                .map_err(|_| Error::Protocol("vmess chunk open failed".to_string()).into()),
            SecurityType::Chacha20Poly1305 => {
                use chacha20poly1305::{aead::Aead as ChaAead, ChaCha20Poly1305, KeyInit as ChaKeyInit};
                ChaCha20Poly1305::new_from_slice(&self.chacha_key())
                    .expect("32-byte key")
                    .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
                    .map_err(|_| Error::Protocol("vmess chunk open failed".to_string()).into())
            }
            SecurityType::None => Ok(ciphertext.to_vec()),
        }
    }
}
