//! AES-128 payload encryption for the local protocol.
//!
//! Two modes are supported:
//!
//! - **ECB** with PKCS7 padding, used by every version up to 3.4. Each
//!   16-byte block is encrypted independently, so identical plaintext blocks
//!   produce identical ciphertext blocks. Devices require this exact
//!   behavior; do not rely on ECB to hide repeating plaintext.
//! - **GCM** with a 12-byte nonce and a 16-byte tag, used by 3.5. A failed
//!   tag check is always reported as [`ProtocolError::Authentication`].
//!
//! Output can optionally be base64 encoded, and decryption accepts the same
//! encoding when asked to.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// AES-128 key length in bytes.
pub const KEY_LENGTH: usize = 16;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-GCM nonce length in bytes.
pub const GCM_NONCE_LENGTH: usize = 12;

/// AES-GCM tag length in bytes.
pub const GCM_TAG_LENGTH: usize = 16;

/// A 16-byte symmetric key (device local key or negotiated session key).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LocalKey([u8; KEY_LENGTH]);

impl LocalKey {
    /// Creates a key from exactly 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Creates a key from arbitrary key material.
    ///
    /// Shorter material is zero padded and longer material truncated to
    /// 16 bytes, matching how device inventories hand out local keys.
    pub fn from_material(material: &[u8]) -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let len = material.len().min(KEY_LENGTH);
        key[..len].copy_from_slice(&material[..len]);
        Self(key)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl From<[u8; KEY_LENGTH]> for LocalKey {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKey([REDACTED])")
    }
}

/// Block cipher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ecb,
    Gcm,
}

/// Options selecting how a payload is encrypted or decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherOptions<'a> {
    pub mode: Mode,
    /// Apply (and on decrypt, verify and strip) PKCS7 padding.
    pub pad: bool,
    /// Base64 encode the output; on decrypt, base64 decode the input.
    pub encode_base64: bool,
    /// GCM only: prepend the nonce to the output; on decrypt, read it from
    /// the first 12 input bytes.
    pub include_iv: bool,
    /// GCM nonce. Generated randomly on encrypt when absent.
    pub nonce: Option<[u8; GCM_NONCE_LENGTH]>,
    /// GCM associated data.
    pub aad: &'a [u8],
}

impl<'a> CipherOptions<'a> {
    /// ECB with PKCS7 padding, raw bytes.
    pub fn ecb() -> Self {
        Self {
            mode: Mode::Ecb,
            pad: true,
            encode_base64: false,
            include_iv: false,
            nonce: None,
            aad: &[],
        }
    }

    /// GCM without padding, nonce prepended to the output.
    pub fn gcm(nonce: Option<[u8; GCM_NONCE_LENGTH]>) -> Self {
        Self {
            mode: Mode::Gcm,
            pad: false,
            encode_base64: false,
            include_iv: true,
            nonce,
            aad: &[],
        }
    }

    pub fn with_base64(mut self, encode_base64: bool) -> Self {
        self.encode_base64 = encode_base64;
        self
    }

    pub fn with_padding(mut self, pad: bool) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_iv(mut self, include_iv: bool) -> Self {
        self.include_iv = include_iv;
        self
    }

    pub fn with_aad(mut self, aad: &'a [u8]) -> Self {
        self.aad = aad;
        self
    }
}

/// AES-128 cipher bound to one key.
///
/// A `Cipher` holds no mutable state and can be shared between threads.
#[derive(Clone)]
pub struct Cipher {
    key: LocalKey,
}

impl Cipher {
    /// Creates a cipher from exactly 16 key bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            key: LocalKey::from_bytes(key)?,
        })
    }

    /// Creates a cipher from an already validated key.
    pub fn from_key(key: LocalKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &LocalKey {
        &self.key
    }

    /// Encrypts `plaintext` according to `options`.
    pub fn encrypt(&self, plaintext: &[u8], options: &CipherOptions<'_>) -> Result<Vec<u8>> {
        let data = if options.pad {
            pkcs7_pad(plaintext, BLOCK_SIZE)
        } else {
            plaintext.to_vec()
        };

        let encrypted = match options.mode {
            Mode::Ecb => self.ecb_encrypt(data)?,
            Mode::Gcm => {
                let nonce = options.nonce.unwrap_or_else(random_nonce);
                let sealed = self.gcm_seal(&nonce, &data, options.aad)?;
                if options.include_iv {
                    let mut out = Vec::with_capacity(GCM_NONCE_LENGTH + sealed.len());
                    out.extend_from_slice(&nonce);
                    out.extend_from_slice(&sealed);
                    out
                } else {
                    sealed
                }
            }
        };

        tracing::trace!(
            mode = ?options.mode,
            plaintext_len = plaintext.len(),
            ciphertext_len = encrypted.len(),
            "encrypted payload"
        );

        if options.encode_base64 {
            Ok(BASE64.encode(encrypted).into_bytes())
        } else {
            Ok(encrypted)
        }
    }

    /// Decrypts `ciphertext` according to `options`.
    pub fn decrypt(&self, ciphertext: &[u8], options: &CipherOptions<'_>) -> Result<Vec<u8>> {
        let raw = if options.encode_base64 {
            BASE64.decode(strip_ascii_whitespace(ciphertext))?
        } else {
            ciphertext.to_vec()
        };

        let decrypted = match options.mode {
            Mode::Ecb => self.ecb_decrypt(raw)?,
            Mode::Gcm => {
                let (nonce, body) = if options.include_iv {
                    if raw.len() < GCM_NONCE_LENGTH + GCM_TAG_LENGTH {
                        return Err(ProtocolError::Authentication(format!(
                            "sealed payload too short: {} bytes",
                            raw.len()
                        )));
                    }
                    let mut nonce = [0u8; GCM_NONCE_LENGTH];
                    nonce.copy_from_slice(&raw[..GCM_NONCE_LENGTH]);
                    (nonce, &raw[GCM_NONCE_LENGTH..])
                } else {
                    let nonce = options.nonce.ok_or_else(|| {
                        ProtocolError::Authentication("no nonce supplied".to_string())
                    })?;
                    (nonce, &raw[..])
                };
                self.gcm_open(&nonce, body, options.aad)?
            }
        };

        if options.pad {
            pkcs7_unpad(&decrypted, BLOCK_SIZE).map(<[u8]>::to_vec)
        } else {
            Ok(decrypted)
        }
    }

    fn ecb_encrypt(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(ProtocolError::Padding(format!(
                "plaintext of {} bytes is not block aligned",
                data.len()
            )));
        }
        let aes = Aes128::new(GenericArray::from_slice(self.key.as_bytes()));
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            aes.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(data)
    }

    fn ecb_decrypt(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(ProtocolError::Padding(format!(
                "invalid length: {} bytes",
                data.len()
            )));
        }
        let aes = Aes128::new(GenericArray::from_slice(self.key.as_bytes()));
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            aes.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(data)
    }

    fn gcm_seal(&self, nonce: &[u8; GCM_NONCE_LENGTH], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let gcm = Aes128Gcm::new(GenericArray::from_slice(self.key.as_bytes()));
        gcm.encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
            .map_err(|_| ProtocolError::Authentication("failed to seal payload".to_string()))
    }

    fn gcm_open(&self, nonce: &[u8; GCM_NONCE_LENGTH], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let gcm = Aes128Gcm::new(GenericArray::from_slice(self.key.as_bytes()));
        gcm.decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
            .map_err(|_| ProtocolError::Authentication("tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &self.key).finish()
    }
}

/// Encrypts `plaintext` with a 16-byte `key`.
pub fn encrypt(plaintext: &[u8], key: &[u8], options: &CipherOptions<'_>) -> Result<Vec<u8>> {
    Cipher::new(key)?.encrypt(plaintext, options)
}

/// Decrypts `ciphertext` with a 16-byte `key`.
pub fn decrypt(ciphertext: &[u8], key: &[u8], options: &CipherOptions<'_>) -> Result<Vec<u8>> {
    Cipher::new(key)?.decrypt(ciphertext, options)
}

/// Appends PKCS7 padding up to a multiple of `block_size`.
///
/// Block aligned input gains a full block of padding.
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - (data.len() % block_size);
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Verifies and strips PKCS7 padding.
pub fn pkcs7_unpad(data: &[u8], block_size: usize) -> Result<&[u8]> {
    let pad_len = match data.last() {
        Some(&last) => last as usize,
        None => return Err(ProtocolError::Padding("empty input".to_string())),
    };
    if pad_len == 0 || pad_len > block_size || pad_len > data.len() {
        return Err(ProtocolError::Padding(format!(
            "pad length {} out of range",
            pad_len
        )));
    }
    let (body, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b as usize != pad_len) {
        return Err(ProtocolError::Padding("inconsistent pad bytes".to_string()));
    }
    Ok(body)
}

fn random_nonce() -> [u8; GCM_NONCE_LENGTH] {
    let mut nonce = [0u8; GCM_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn strip_ascii_whitespace(data: &[u8]) -> Vec<u8> {
    data.iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect()
}
