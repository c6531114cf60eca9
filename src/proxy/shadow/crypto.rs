use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use sha1::Sha1;

use crate::common::error::{ProxyError, Result};

/// AEAD nonce length shared by every supported cipher.
pub const NONCE_LEN: usize = 12;

const AEAD_AES_128_GCM: &str = "AEAD_AES_128_GCM";
const AEAD_AES_256_GCM: &str = "AEAD_AES_256_GCM";
const AEAD_CHACHA20_POLY1305: &str = "AEAD_CHACHA20_POLY1305";

/// Supported AEAD cipher kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    /// Pass-through for testing: no salt, no framing, no encryption.
    Dummy,
}

impl CipherKind {
    /// Parse a cipher method name. Accepts the canonical AEAD_* names and
    /// the legacy aliases, case-insensitive.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DUMMY" => Ok(CipherKind::Dummy),
            "AEAD_AES_128_GCM" | "AES-128-GCM" => Ok(CipherKind::Aes128Gcm),
            "AEAD_AES_256_GCM" | "AES-256-GCM" => Ok(CipherKind::Aes256Gcm),
            "AEAD_CHACHA20_POLY1305" | "CHACHA20-IETF-POLY1305" => {
                Ok(CipherKind::ChaCha20Poly1305)
            }
            other => Err(ProxyError::CipherNotSupported(other.to_string())),
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::Dummy => 0,
        }
    }

    /// Salt length in bytes: key length, floored at 16
    pub fn salt_len(&self) -> usize {
        match self {
            CipherKind::Dummy => 0,
            _ => self.key_len().max(16),
        }
    }

    /// AEAD tag length in bytes (always 16 for all supported ciphers)
    pub fn tag_len(&self) -> usize {
        match self {
            CipherKind::Dummy => 0,
            _ => 16,
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, CipherKind::Dummy)
    }
}

/// Canonical cipher names, sorted alphabetically.
pub fn list_ciphers() -> Vec<&'static str> {
    vec![AEAD_AES_128_GCM, AEAD_AES_256_GCM, AEAD_CHACHA20_POLY1305]
}

/// Derive key from password (EVP_BytesToKey, OpenSSL compatible).
///
/// D_0 = MD5(password), D_i = MD5(D_{i-1} || password), concatenated
/// until key_len bytes are available. Retained for wire compatibility
/// with the Shadowsocks key schedule.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev_hash: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref prev) = prev_hash {
            hasher.update(prev);
        }
        hasher.update(password);
        let hash = hasher.finalize().to_vec();
        key.extend_from_slice(&hash);
        prev_hash = Some(hash);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-connection subkey: HKDF-SHA1 over (psk, salt) with
/// info = b"ss-subkey".
pub fn derive_subkey(psk: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), psk);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|_| ProxyError::KeySize(key_len))?;
    Ok(subkey)
}

/// A cipher selection plus its pre-shared key. Immutable after startup;
/// per-connection AEAD state lives in [`AeadCipher`].
#[derive(Clone)]
pub struct CipherSpec {
    kind: CipherKind,
    psk: Vec<u8>,
}

impl CipherSpec {
    /// Build from config fields. An explicit key (base64) wins; with no
    /// key, the PSK is derived from the password.
    pub fn from_config(method: &str, key_b64: &str, password: &str) -> Result<Self> {
        let kind = CipherKind::parse(method)?;
        if kind.is_dummy() {
            return Ok(Self {
                kind,
                psk: Vec::new(),
            });
        }

        let psk = if key_b64.is_empty() {
            evp_bytes_to_key(password.as_bytes(), kind.key_len())
        } else {
            base64::engine::general_purpose::STANDARD
                .decode(key_b64.trim())
                .map_err(|_| ProxyError::KeySize(kind.key_len()))?
        };

        if psk.len() != kind.key_len() {
            return Err(ProxyError::KeySize(kind.key_len()));
        }

        Ok(Self { kind, psk })
    }

    pub fn from_psk(kind: CipherKind, psk: Vec<u8>) -> Result<Self> {
        if !kind.is_dummy() && psk.len() != kind.key_len() {
            return Err(ProxyError::KeySize(kind.key_len()));
        }
        Ok(Self { kind, psk })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Derive the sealing/opening state for one direction of a connection.
    pub fn session_cipher(&self, salt: &[u8]) -> Result<AeadCipher> {
        if self.kind.is_dummy() {
            return Err(ProxyError::CipherNotSupported("DUMMY".to_string()));
        }
        let subkey = derive_subkey(&self.psk, salt, self.kind.key_len())?;
        Ok(AeadCipher::new(self.kind, subkey))
    }
}

/// increment little-endian encoded unsigned integer b. Wrap around on overflow.
fn increment(nonce: &mut [u8]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}

/// AEAD state for one direction of one connection: subkey plus a nonce
/// that advances by little-endian +1 after every seal/open.
pub struct AeadCipher {
    kind: CipherKind,
    key: Vec<u8>,
    nonce: [u8; NONCE_LEN],
}

impl AeadCipher {
    pub fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            key: subkey,
            nonce: [0u8; NONCE_LEN],
        }
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Seal plaintext with the current nonce, returning ciphertext + tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = plaintext.to_vec();
        let nonce = GenericArray::from_slice(&self.nonce);

        let seal_failed = || ProxyError::Io(std::io::Error::other("AEAD seal failed"));
        let tag = match self.kind {
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                cipher
                    .encrypt_in_place_detached(nonce, b"", &mut buf)
                    .map_err(|_| seal_failed())?
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                cipher
                    .encrypt_in_place_detached(nonce, b"", &mut buf)
                    .map_err(|_| seal_failed())?
            }
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                cipher
                    .encrypt_in_place_detached(nonce, b"", &mut buf)
                    .map_err(|_| seal_failed())?
            }
            CipherKind::Dummy => unreachable!("dummy cipher has no AEAD state"),
        };

        buf.extend_from_slice(&tag);
        increment(&mut self.nonce);
        Ok(buf)
    }

    /// Open ciphertext (with appended tag) with the current nonce. Any
    /// failure here is fatal for the connection.
    pub fn open(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            return Err(ProxyError::ShortRead);
        }

        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = GenericArray::from_slice(&ciphertext_with_tag[ct_len..]);
        let nonce = GenericArray::from_slice(&self.nonce);

        let opened = match self.kind {
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&self.key));
                cipher.decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
            CipherKind::Dummy => unreachable!("dummy cipher has no AEAD state"),
        };
        opened.map_err(|_| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "AEAD open failed",
            ))
        })?;

        increment(&mut self.nonce);
        Ok(buf)
    }
}
