//! Compress-then-encrypt transform for every stored object
//!
//! Chunks, chunk lists and state snapshots all pass through the same
//! transform before they leave the machine.
//!
//! ## Format
//!
//! ```text
//! [4-byte magic "ARI1"][12-byte nonce][AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The plaintext fed to AES-GCM is the LZ4 block with its size prepended. The
//! key is derived once per repository from the passphrase with Argon2id, so
//! per-object work is only LZ4 plus one AEAD pass.
//!
//! ## Examples
//!
//! ```rust
//! use arius::crypto::CryptoTransform;
//!
//! let crypto = CryptoTransform::new("correct horse battery staple").unwrap();
//! let sealed = crypto.encrypt(b"hello").unwrap();
//! assert_eq!(crypto.decrypt(&sealed).unwrap(), b"hello");
//! ```

use crate::error::{ArchiveError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use rand::RngCore;
use tracing::trace;

/// Magic header identifying a sealed object
pub const MAGIC: &[u8; 4] = b"ARI1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_SALT: &[u8] = b"arius.repository.key.v1";

/// Cost parameters for deriving the repository key
///
/// Every client of a repository must use the same values; changing them
/// derives a different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Argon2 memory cost in KiB
    pub memory_kib: u32,
    /// Argon2 iteration count
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests and throwaway repositories
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
        }
    }
}

/// Symmetric transform bound to one repository passphrase
#[derive(Clone)]
pub struct CryptoTransform {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CryptoTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoTransform").finish_non_exhaustive()
    }
}

impl CryptoTransform {
    /// Derive the repository key from `passphrase` with default cost
    pub fn new(passphrase: &str) -> Result<Self> {
        Self::with_params(passphrase, KdfParams::default())
    }

    /// Derive the repository key from `passphrase`
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvalidConfiguration`] for an empty passphrase
    /// - [`ArchiveError::Crypto`] if key derivation fails
    pub fn with_params(passphrase: &str, kdf: KdfParams) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(ArchiveError::InvalidConfiguration(
                "passphrase must not be empty".to_string(),
            ));
        }

        let params = Params::new(kdf.memory_kib, kdf.iterations, 1, Some(32))
            .map_err(|e| ArchiveError::crypto(format!("invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| ArchiveError::crypto(format!("key derivation failed: {}", e)))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ArchiveError::crypto("invalid key length"))?;
        Ok(Self { cipher })
    }

    /// Compress and encrypt `plain`
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress_prepend_size(plain);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), compressed.as_slice())
            .map_err(|e| ArchiveError::crypto(format!("AES-GCM encrypt: {}", e)))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        trace!("Sealed {} bytes into {} bytes", plain.len(), out.len());
        Ok(out)
    }

    /// Decrypt and decompress a sealed object
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::Crypto`] for a foreign frame, a wrong key, or tampering
    /// - [`ArchiveError::Decompression`] if the authenticated payload is not LZ4
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < MAGIC.len() + NONCE_LEN + TAG_LEN {
            return Err(ArchiveError::crypto(format!(
                "sealed object too short ({} bytes)",
                sealed.len()
            )));
        }
        let (magic, rest) = sealed.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(ArchiveError::crypto("unrecognized object header"));
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let compressed = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ArchiveError::crypto("decryption failed (wrong passphrase or corrupt data)"))?;

        decompress_size_prepended(&compressed)
            .map_err(|e| ArchiveError::Decompression(format!("LZ4 decompression failed: {}", e)))
    }

    /// Whether `data` starts with the sealed-object header
    pub fn is_sealed(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() + NONCE_LEN + TAG_LEN && &data[..MAGIC.len()] == MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transform(passphrase: &str) -> CryptoTransform {
        CryptoTransform::with_params(passphrase, KdfParams::insecure_fast()).unwrap()
    }

    #[test]
    fn test_roundtrip_and_compression() {
        let crypto = transform("secret");
        let data = b"Hello, world! ".repeat(1000);

        let sealed = crypto.encrypt(&data).unwrap();
        assert!(CryptoTransform::is_sealed(&sealed));
        assert!(sealed.len() < data.len());
        assert_eq!(crypto.decrypt(&sealed).unwrap(), data);
    }

    #[test]
    fn test_nonce_makes_output_unique() {
        let crypto = transform("secret");
        let a = crypto.encrypt(b"same").unwrap();
        let b = crypto.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_passphrase_is_crypto_error() {
        let sealed = transform("one").encrypt(b"data").unwrap();
        let err = transform("two").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, ArchiveError::Crypto(_)));
    }

    #[test]
    fn test_tampering_detected() {
        let crypto = transform("secret");
        let mut sealed = crypto.encrypt(b"payload that matters").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(crypto.decrypt(&sealed).is_err());

        assert!(crypto.decrypt(b"short").is_err());
        assert!(CryptoTransform::new("").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_decrypt_reverses_encrypt(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let crypto = transform("property");
            let sealed = crypto.encrypt(&data).unwrap();
            prop_assert_eq!(crypto.decrypt(&sealed).unwrap(), data);
        }
    }
}
