//! Splitting binaries into chunks and merging them back
//!
//! Two modes are supported:
//!
//! - **Whole file**: the binary is exactly one chunk. Its chunk hash equals its
//!   binary hash, so no chunk list is stored.
//! - **Content defined**: boundaries come from FastCDC's rolling gear hash,
//!   bounded by [`ChunkerConfig`]. Identical byte runs produce identical chunks
//!   wherever they appear, which is what makes cross-file dedup work.
//!
//! Content-defined chunking reads through a [`StreamCDC`], so at most one
//! maximum-size chunk is held in memory at a time.
//!
//! ## Example
//!
//! ```rust
//! use arius::chunker::{merge, Chunker, ChunkerConfig};
//!
//! let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 253) as u8).collect();
//! let chunker = Chunker::new(ChunkerConfig::default(), true);
//!
//! let chunks = chunker.chunk_bytes(&data).unwrap();
//! let mut restored = Vec::new();
//! merge(chunks.iter().map(|c| c.as_slice()), &mut restored).unwrap();
//! assert_eq!(restored, data);
//! ```

use crate::error::{ArchiveError, Result};
use fastcdc::v2020::{self, StreamCDC};
use std::io::{Read, Write};
use tracing::trace;

/// Bounds for content-defined chunking, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Smallest chunk emitted, except for the tail of a binary
    pub min_size: u32,
    /// Target average chunk size
    pub avg_size: u32,
    /// Hard upper bound
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Check the bounds against what FastCDC accepts
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvalidConfiguration`] if a bound is out of range or
    ///   the bounds are not ordered `min <= avg <= max`
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ArchiveError::InvalidConfiguration(msg));

        if !(v2020::MINIMUM_MIN..=v2020::MINIMUM_MAX).contains(&self.min_size) {
            return invalid(format!("chunk min_size {} out of range", self.min_size));
        }
        if !(v2020::AVERAGE_MIN..=v2020::AVERAGE_MAX).contains(&self.avg_size) {
            return invalid(format!("chunk avg_size {} out of range", self.avg_size));
        }
        if !(v2020::MAXIMUM_MIN..=v2020::MAXIMUM_MAX).contains(&self.max_size) {
            return invalid(format!("chunk max_size {} out of range", self.max_size));
        }
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return invalid(format!(
                "chunk sizes must satisfy min <= avg <= max ({} / {} / {})",
                self.min_size, self.avg_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// Splits one binary into an ordered sequence of chunks
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    content_defined: bool,
}

impl Chunker {
    /// Create a chunker; `dedup` selects content-defined chunking
    pub fn new(config: ChunkerConfig, dedup: bool) -> Self {
        Self {
            config,
            content_defined: dedup,
        }
    }

    /// Whether this chunker splits by content
    pub fn is_content_defined(&self) -> bool {
        self.content_defined
    }

    /// Feed every chunk of `reader` to `sink`, strictly in order
    ///
    /// Returns the number of chunks emitted. An empty input yields one empty
    /// chunk so that every binary consists of at least one chunk.
    ///
    /// # Errors
    ///
    /// Read errors, and any error returned by `sink` (which stops chunking).
    pub fn chunk_reader<R, F>(&self, mut reader: R, mut sink: F) -> Result<usize>
    where
        R: Read,
        F: FnMut(Vec<u8>) -> Result<()>,
    {
        if !self.content_defined {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            sink(data)?;
            return Ok(1);
        }

        let stream = StreamCDC::new(
            reader,
            self.config.min_size,
            self.config.avg_size,
            self.config.max_size,
        );

        let mut count = 0usize;
        for chunk in stream {
            let chunk = chunk.map_err(|e| match e {
                v2020::Error::IoError(io) => ArchiveError::Io(io),
                other => ArchiveError::internal(format!("chunker failed: {}", other)),
            })?;
            trace!("Chunk {} at offset {} ({} bytes)", count, chunk.offset, chunk.length);
            sink(chunk.data)?;
            count += 1;
        }

        if count == 0 {
            sink(Vec::new())?;
            count = 1;
        }
        Ok(count)
    }

    /// Chunk an in-memory buffer
    pub fn chunk_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut chunks = Vec::new();
        self.chunk_reader(data, |chunk| {
            chunks.push(chunk);
            Ok(())
        })?;
        Ok(chunks)
    }
}

/// Concatenate chunks into `writer` in the given order
///
/// Returns the number of bytes written.
pub fn merge<'a, I, W>(chunks: I, writer: &mut W) -> Result<u64>
where
    I: IntoIterator<Item = &'a [u8]>,
    W: Write,
{
    let mut written = 0u64;
    for chunk in chunks {
        writer.write_all(chunk)?;
        written += chunk.len() as u64;
    }
    writer.flush()?;
    Ok(written)
}
