//! Content fingerprinting
//!
//! Every chunk and binary is addressed by a salted SHA-256 digest. The salt is
//! the repository passphrase, so two repositories with different passphrases
//! never reveal that they hold the same content.
//!
//! Files are hashed with a fixed 64 KiB buffer and never loaded whole.

use crate::error::Result;
use crate::types::{BinaryHash, ChunkHash, Hash};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::trace;

const READ_BUFFER: usize = 64 * 1024;

/// Salted SHA-256 hasher shared by the archive and restore pipelines
#[derive(Clone)]
pub struct Hasher {
    salt: Vec<u8>,
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hasher").field("salted", &!self.salt.is_empty()).finish()
    }
}

impl Hasher {
    /// Create a hasher salted with `passphrase`
    pub fn new(passphrase: &str) -> Self {
        Self {
            salt: passphrase.as_bytes().to_vec(),
        }
    }

    fn digest(&self) -> Sha256 {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher
    }

    /// Hash an in-memory chunk
    pub fn hash_chunk(&self, data: &[u8]) -> ChunkHash {
        let mut hasher = self.digest();
        hasher.update(data);
        ChunkHash(Hash::from_bytes(hasher.finalize().into()))
    }

    /// Hash everything readable from `reader`
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> Result<Hash> {
        let mut hasher = self.digest();
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Hash::from_bytes(hasher.finalize().into()))
    }

    /// Start an incremental binary hash
    pub fn streaming(&self) -> StreamingHash {
        StreamingHash {
            digest: self.digest(),
        }
    }

    /// Hash the full content of a file
    pub fn hash_file(&self, path: &Path) -> Result<BinaryHash> {
        let hash = BinaryHash(self.hash_reader(File::open(path)?)?);
        trace!("Hashed {:?} -> {}", path, hash.short());
        Ok(hash)
    }
}

/// Binary hash computed while the content streams past
pub struct StreamingHash {
    digest: Sha256,
}

impl StreamingHash {
    /// Feed the next bytes
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Finish and return the binary hash
    pub fn finish(self) -> BinaryHash {
        BinaryHash(Hash::from_bytes(self.digest.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_and_chunk_hash_agree() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let hasher = Hasher::new("secret");
        let file_hash = hasher.hash_file(&path).unwrap();
        let chunk_hash = hasher.hash_chunk(&content);

        assert_eq!(ChunkHash::from(file_hash), chunk_hash);

        let mut streaming = hasher.streaming();
        for part in content.chunks(7_000) {
            streaming.update(part);
        }
        assert_eq!(streaming.finish(), file_hash);
    }

    #[test]
    fn test_salt_changes_hash() {
        let a = Hasher::new("one").hash_chunk(b"same content");
        let b = Hasher::new("two").hash_chunk(b"same content");
        assert_ne!(a, b);
        assert_eq!(a, Hasher::new("one").hash_chunk(b"same content"));
    }
}
