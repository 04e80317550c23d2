use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use anyhow::{bail, Result};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use sha1::Sha1;

use crate::common::Error;

/// Shadowsocks AEAD 加密方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => bail!(Error::Protocol(format!(
                "unsupported shadowsocks cipher: {}",
                other
            ))),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// salt 长度与 key 长度一致
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    pub fn tag_len(&self) -> usize {
        16
    }
}

/// EVP_BytesToKey（OpenSSL 兼容）：迭代 MD5 从密码推导主密钥
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref p) = prev {
            hasher.update(p);
        }
        hasher.update(password);
        let digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// HKDF-SHA1 子密钥派生，info = "ss-subkey"
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
    Ok(subkey)
}

/// 带递增 nonce 的 AEAD 流加密器
pub struct AeadCipher {
    kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            key: subkey,
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        nonce
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let mut buf = plaintext.to_vec();

        let tag = match self.kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf),
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf)
            }
        }
        .map_err(|e| Error::Protocol(format!("aead encrypt failed: {}", e)))?;

        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            bail!(Error::Protocol(format!(
                "ciphertext too short: {} bytes",
                ciphertext_with_tag.len()
            )));
        }

        let nonce = self.next_nonce();
        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = GenericArray::from_slice(&ciphertext_with_tag[ct_len..]);

        let result = match self.kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag),
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .decrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buf, tag)
            }
        };
        // HMAC 校验失败按协议错误上抛
        result.map_err(|_| Error::Protocol("aead tag mismatch".to_string()))?;

        Ok(buf)
    }
}

/// 一次性（零 nonce）AEAD，用于 UDP 的单包加解密
pub fn seal_packet(kind: CipherKind, subkey: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    AeadCipher::new(kind, subkey.to_vec()).encrypt(plaintext)
}

pub fn open_packet(kind: CipherKind, subkey: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    AeadCipher::new(kind, subkey.to_vec()).decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_kind_parse() {
        assert_eq!(CipherKind::parse("aes-128-gcm").unwrap(), CipherKind::Aes128Gcm);
        assert_eq!(CipherKind::parse("AES-256-GCM").unwrap(), CipherKind::Aes256Gcm);
        assert_eq!(
            CipherKind::parse("chacha20-ietf-poly1305").unwrap(),
            CipherKind::ChaCha20Poly1305
        );
        assert!(CipherKind::parse("rc4-md5").is_err());
    }

    #[test]
    fn evp_bytes_to_key_known_vector() {
        // MD5("test") = 098f6bcd4621d373cade4e832627b4f6
        let key = evp_bytes_to_key(b"test", 16);
        assert_eq!(
            key,
            [0x09, 0x8f, 0x6b, 0xcd, 0x46, 0x21, 0xd3, 0x73, 0xca, 0xde, 0x4e, 0x83, 0x26, 0x27,
             0xb4, 0xf6]
        );
    }

    #[test]
    fn evp_bytes_to_key_extends_to_32() {
        let key = evp_bytes_to_key(b"password", 32);
        assert_eq!(key.len(), 32);
        // 前 16 字节必须等于单轮 MD5
        assert_eq!(&key[..16], &evp_bytes_to_key(b"password", 16)[..]);
    }

    #[test]
    fn aead_roundtrip_all_kinds() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20Poly1305,
        ] {
            let subkey = vec![0x42u8; kind.key_len()];
            let mut enc = AeadCipher::new(kind, subkey.clone());
            let mut dec = AeadCipher::new(kind, subkey);

            let ciphertext = enc.encrypt(b"hello world").unwrap();
            assert_eq!(ciphertext.len(), 11 + kind.tag_len());
            let plaintext = dec.decrypt(&ciphertext).unwrap();
            assert_eq!(&plaintext, b"hello world");
        }
    }

    #[test]
    fn aead_nonce_advances() {
        let subkey = vec![0x42u8; 16];
        let mut cipher = AeadCipher::new(CipherKind::Aes128Gcm, subkey);
        let c1 = cipher.encrypt(b"a").unwrap();
        let c2 = cipher.encrypt(b"a").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn aead_tampered_tag_fails() {
        let subkey = vec![0x42u8; 16];
        let mut enc = AeadCipher::new(CipherKind::Aes128Gcm, subkey.clone());
        let mut dec = AeadCipher::new(CipherKind::Aes128Gcm, subkey);

        let mut ciphertext = enc.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(dec.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn packet_seal_open_roundtrip() {
        let subkey = vec![0x11u8; 32];
        let sealed = seal_packet(CipherKind::Aes256Gcm, &subkey, b"dgram").unwrap();
        let opened = open_packet(CipherKind::Aes256Gcm, &subkey, &sealed).unwrap();
        assert_eq!(&opened, b"dgram");
    }
}
