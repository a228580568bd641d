//! Transport security for sdwan
//!
//! Optional authenticated encryption of envelope payloads. The working key is
//! the SHA-256 digest of the configured key material, so operators may supply
//! passphrases of any length. Every sealed payload carries its own random
//! nonce: `nonce || ciphertext || tag`.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::SecurityConfig;
use crate::error::{CryptoError, Error};

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// ChaCha20-Poly1305 with a 96-bit nonce
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with a 192-bit nonce
    XChaCha20Poly1305,
    /// AES-256-GCM with a 96-bit nonce
    Aes256Gcm,
}

impl Algorithm {
    /// Nonce length prepended to every ciphertext
    pub fn nonce_len(&self) -> usize {
        match self {
            Algorithm::ChaCha20Poly1305 | Algorithm::Aes256Gcm => 12,
            Algorithm::XChaCha20Poly1305 => 24,
        }
    }

    /// Authentication tag length appended by the AEAD
    pub fn tag_len(&self) -> usize {
        16
    }

    /// Bytes added to a plaintext by `encrypt`
    pub fn overhead(&self) -> usize {
        self.nonce_len() + self.tag_len()
    }
}

impl FromStr for Algorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            "xchacha20-poly1305" | "xchacha20poly1305" => Ok(Algorithm::XChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
            Algorithm::XChaCha20Poly1305 => write!(f, "xchacha20-poly1305"),
            Algorithm::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

enum Cipher {
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
    Aes(Aes256Gcm),
}

/// Process-wide encryption state. Immutable after construction.
pub struct CryptoContext {
    algorithm: Algorithm,
    cipher: Option<Cipher>,
    /// First bytes of SHA-256(key), safe to log
    fingerprint: String,
}

impl CryptoContext {
    /// A context that passes payloads through untouched
    pub fn disabled() -> Self {
        Self {
            algorithm: Algorithm::ChaCha20Poly1305,
            cipher: None,
            fingerprint: String::new(),
        }
    }

    /// Build an enabled context from raw key material
    pub fn new(algorithm: Algorithm, key_material: &[u8]) -> Self {
        let key = derive_key(key_material);
        let fingerprint = hex::encode(&Sha256::digest(key)[..4]);
        let key = Key::from_slice(&key);
        let cipher = match algorithm {
            Algorithm::ChaCha20Poly1305 => Cipher::ChaCha(ChaCha20Poly1305::new(key)),
            Algorithm::XChaCha20Poly1305 => Cipher::XChaCha(XChaCha20Poly1305::new(key)),
            Algorithm::Aes256Gcm => Cipher::Aes(Aes256Gcm::new(key)),
        };
        debug!("Crypto context created ({}, key id {})", algorithm, fingerprint);
        Self {
            algorithm,
            cipher: Some(cipher),
            fingerprint,
        }
    }

    /// Build a context from the `[security]` configuration section
    pub fn from_config(config: &SecurityConfig) -> Result<Self, Error> {
        if !config.encryption {
            return Ok(Self::disabled());
        }
        let algorithm: Algorithm = config.algorithm.parse()?;
        let key = config
            .key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Config("security.key is required when encryption is enabled".into()))?;
        Ok(Self::new(algorithm, &key_material(key)))
    }

    /// Whether payloads are sealed
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Short hex identifier of the working key
    pub fn key_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Seal a payload under a fresh random nonce. Identity when disabled.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return Ok(plaintext.to_vec()),
        };

        let mut nonce = vec![0u8; self.algorithm.nonce_len()];
        OsRng.fill_bytes(&mut nonce);

        let sealed = match cipher {
            Cipher::ChaCha(c) => c.encrypt(Nonce::from_slice(&nonce), plaintext),
            Cipher::XChaCha(c) => c.encrypt(XNonce::from_slice(&nonce), plaintext),
            Cipher::Aes(c) => c.encrypt(Nonce::from_slice(&nonce), plaintext),
        }
        .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = nonce;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a payload produced by `encrypt`. Identity when disabled.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return Ok(data.to_vec()),
        };

        let nonce_len = self.algorithm.nonce_len();
        if data.len() < nonce_len {
            return Err(CryptoError::CiphertextTooShort {
                len: data.len(),
                nonce: nonce_len,
            });
        }
        let (nonce, ciphertext) = data.split_at(nonce_len);

        match cipher {
            Cipher::ChaCha(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            Cipher::XChaCha(c) => c.decrypt(XNonce::from_slice(nonce), ciphertext),
            Cipher::Aes(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("enabled", &self.is_enabled())
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.fingerprint)
            .finish()
    }
}

/// Hash arbitrary key material down to a 256-bit working key
pub fn derive_key(material: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(material);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    key
}

/// Interpret a configured key: base64 if it decodes, the raw passphrase otherwise
pub fn key_material(configured: &str) -> Vec<u8> {
    let trimmed = configured.trim();
    match BASE64.decode(trimmed) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => trimmed.as_bytes().to_vec(),
    }
}

/// Generate `size` random bytes of key material, base64 encoded
pub fn generate_key(size: usize) -> Result<String, CryptoError> {
    if !(16..=64).contains(&size) {
        return Err(CryptoError::InvalidKeySize(size));
    }
    let mut key = vec![0u8; size];
    OsRng.fill_bytes(&mut key);
    Ok(BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contexts() -> Vec<CryptoContext> {
        vec![
            CryptoContext::new(Algorithm::ChaCha20Poly1305, b"correct horse battery staple"),
            CryptoContext::new(Algorithm::XChaCha20Poly1305, b"correct horse battery staple"),
            CryptoContext::new(Algorithm::Aes256Gcm, b"correct horse battery staple"),
        ]
    }

    #[test]
    fn test_disabled_is_identity() {
        let ctx = CryptoContext::disabled();
        assert!(!ctx.is_enabled());
        assert_eq!(ctx.encrypt(b"packet").unwrap(), b"packet");
        assert_eq!(ctx.decrypt(b"packet").unwrap(), b"packet");
    }

    #[test]
    fn test_encrypt_decrypt() {
        for ctx in contexts() {
            let sealed = ctx.encrypt(b"hello overlay").unwrap();
            assert_eq!(sealed.len(), 13 + ctx.algorithm().overhead());
            assert_eq!(ctx.decrypt(&sealed).unwrap(), b"hello overlay");
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let ctx = CryptoContext::new(Algorithm::ChaCha20Poly1305, b"k");
        let a = ctx.encrypt(b"same plaintext").unwrap();
        let b = ctx.encrypt(b"same plaintext").unwrap();
        assert_ne!(a[..12], b[..12]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_bit_flip_is_rejected() {
        for ctx in contexts() {
            let sealed = ctx.encrypt(b"integrity matters").unwrap();
            for i in 0..sealed.len() * 8 {
                let mut tampered = sealed.clone();
                tampered[i / 8] ^= 1 << (i % 8);
                assert_eq!(ctx.decrypt(&tampered), Err(CryptoError::AuthenticationFailed));
            }
        }
    }

    #[test]
    fn test_too_short() {
        let ctx = CryptoContext::new(Algorithm::ChaCha20Poly1305, b"k");
        assert_eq!(
            ctx.decrypt(&[0u8; 5]),
            Err(CryptoError::CiphertextTooShort { len: 5, nonce: 12 })
        );
        // Nonce present but no tag
        assert_eq!(ctx.decrypt(&[0u8; 12]), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_wrong_key() {
        let a = CryptoContext::new(Algorithm::ChaCha20Poly1305, b"alpha");
        let b = CryptoContext::new(Algorithm::ChaCha20Poly1305, b"bravo");
        assert_ne!(a.key_fingerprint(), b.key_fingerprint());
        let sealed = a.encrypt(b"secret").unwrap();
        assert_eq!(b.decrypt(&sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("chacha20-poly1305".parse::<Algorithm>().unwrap(), Algorithm::ChaCha20Poly1305);
        assert_eq!("XChaCha20-Poly1305".parse::<Algorithm>().unwrap(), Algorithm::XChaCha20Poly1305);
        assert_eq!("aes-256-gcm".parse::<Algorithm>().unwrap(), Algorithm::Aes256Gcm);
        assert_eq!(Algorithm::Aes256Gcm.to_string(), "aes-256-gcm");
        assert_eq!(
            "aes-128-cbc".parse::<Algorithm>(),
            Err(CryptoError::UnsupportedAlgorithm("aes-128-cbc".into()))
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = SecurityConfig::default();
        assert!(!CryptoContext::from_config(&config).unwrap().is_enabled());

        config.encryption = true;
        assert!(CryptoContext::from_config(&config).is_err());

        config.key = Some(generate_key(32).unwrap());
        let ctx = CryptoContext::from_config(&config).unwrap();
        assert!(ctx.is_enabled());
        assert_eq!(ctx.algorithm(), Algorithm::ChaCha20Poly1305);

        config.algorithm = "aes-256-gcm".into();
        let ctx = CryptoContext::from_config(&config).unwrap();
        assert_eq!(ctx.algorithm(), Algorithm::Aes256Gcm);
        let sealed = ctx.encrypt(b"packet").unwrap();
        assert_eq!(ctx.decrypt(&sealed).unwrap(), b"packet");
    }

    #[test]
    fn test_algorithms_do_not_interoperate() {
        let aes = CryptoContext::new(Algorithm::Aes256Gcm, b"shared");
        let chacha = CryptoContext::new(Algorithm::ChaCha20Poly1305, b"shared");
        let sealed = aes.encrypt(b"secret").unwrap();
        assert_eq!(chacha.decrypt(&sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key(32).unwrap();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 32);
        assert_ne!(key, generate_key(32).unwrap());
        assert_eq!(generate_key(4), Err(CryptoError::InvalidKeySize(4)));
    }

    #[test]
    fn test_key_material() {
        assert_eq!(key_material("AAEC"), vec![0, 1, 2]);
        assert_eq!(key_material("not base64!"), b"not base64!".to_vec());
    }
}
