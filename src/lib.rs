//! # Arius - deduplicated, encrypted archives on tiered object storage
//!
//! Arius archives a directory tree into an object store so that each distinct
//! content is stored once, encrypted, and restorable as of any earlier run.
//!
//! ## Overview
//!
//! - Every file (a *binary*) is split into chunks, either one chunk per file
//!   or content-defined chunks with deduplication enabled
//! - Chunks are identified by a salted SHA-256 hash, compressed, encrypted
//!   with AES-256-GCM and written once under `chunks/<hash>`
//! - Next to each archived binary a small *pointer file*
//!   (`<name>.pointer.arius`) records its hash, so the local binary can be
//!   removed and restored later
//! - Repository state lives in a SQLite database that is published as an
//!   encrypted snapshot under `states/<version>` after each archive run
//! - Each path is tracked as a log of versioned entries with tombstones,
//!   which makes point-in-time restores possible
//! - Chunks in the archive tier are hydrated into a staging copy before
//!   they can be read; restores request hydration and report what is pending
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arius::{ArchiveOptions, RepositoryBuilder, RestoreOptions};
//!
//! # async fn example() -> arius::Result<()> {
//! let repository = RepositoryBuilder::new()
//!     .local_store("/mnt/backup/arius")?
//!     .passphrase("correct horse battery staple")
//!     .open()
//!     .await?;
//!
//! let mut archive = ArchiveOptions::new("/home/me/photos");
//! archive.dedup = true;
//! archive.remove_local = true;
//! let summary = repository.archive(archive).await?;
//! println!("uploaded {} binaries", summary.binaries_uploaded);
//!
//! let mut restore = RestoreOptions::new("/home/me/photos");
//! restore.download = true;
//! let summary = repository.restore(restore).await?;
//! if !summary.is_complete() {
//!     println!("{} binaries waiting for hydration", summary.binaries_pending);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`chunker`]: fixed and content-defined chunking
//! - [`hashing`]: salted content hashes
//! - [`crypto`]: compression and authenticated encryption
//! - [`store`]: the object store abstraction and its implementations
//! - [`state`]: the versioned state database and its snapshots
//! - [`repository`]: chunk, chunk list and binary storage
//! - [`filesystem`]: pointer files and directory scans
//! - [`types`]: common types and data structures
//! - [`error`]: error types and handling

pub mod chunker;
pub mod crypto;
pub mod error;
pub mod filesystem;
pub mod hashing;
pub mod repository;
pub mod single_flight;
pub mod state;
pub mod store;
pub mod types;
pub mod utils;

mod archive;
mod restore;

pub use chunker::{Chunker, ChunkerConfig};
pub use crypto::{CryptoTransform, KdfParams};
pub use error::{ArchiveError, Result};
pub use hashing::Hasher;
pub use repository::{BinaryUpload, ChunkRepository, Repository, RepositoryBuilder};
pub use state::{StateDb, StateManager};
pub use store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use types::*;
