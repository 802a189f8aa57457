//! Chunked Upload Module
//!
//! Implements large file uploads sent as independent chunks:
//! - Chunk staging keyed by file hash and chunk key
//! - Ordered, single-writer reassembly with per-upload merge exclusion
//! - Instant upload when a matching artifact already exists
//! - Streaming SHA-256 verification of assembled artifacts
//!
//! Protocol Flow:
//! 1. Client checks whether the file already exists (instant upload)
//! 2. Client uploads chunks in any order, retrying freely
//! 3. Client requests a merge; chunks are assembled in key order
//! 4. Client optionally verifies the artifact against its hash

pub mod artifacts;
pub mod chunk_store;
pub mod dedup;
pub mod hash;
pub mod merge;
pub mod types;

pub use artifacts::ArtifactStore;
pub use chunk_store::{ChunkStorage, ChunkStore, LocalChunkStorage};
pub use dedup::DedupIndex;
pub use hash::{compute_hash, digest_file, digest_reader, verify};
pub use merge::{MergeCoordinator, MergeGuard, MergeLocks};
pub use types::*;
