//! GlacierSync - Concurrent multipart uploads to archival object stores
//!
//! This library uploads large files in fixed-size parts with a bounded number
//! of parts in flight, and verifies every archive with a SHA-256 tree hash
//! reassembled from the part hashes.
//!
//! # Features
//!
//! - **Bounded Concurrency**: A FIFO job queue never lets more than `max_active` parts upload at once
//! - **Automatic Retry**: Each part gets a bounded number of attempts before it is marked failed
//! - **Tree Hash Verification**: Parts may finish in any order; the whole-file digest is only computed once they tile the file
//! - **Pluggable Stores**: Any [`ArchiveStore`] can receive the parts; a directory-backed [`LocalVault`] is included
//! - **Progress Tracking**: Every job transition is streamed as a [`Status`]
//!
//! # Example
//!
//! ```no_run
//! use glaciersync::{LocalVault, UploadConfig, Uploader};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UploadConfig::default();
//! let uploader = Uploader::new(config, Arc::new(LocalVault::new("vault")));
//!
//! let pb = indicatif::ProgressBar::hidden();
//! for receipt in uploader.upload_target(Path::new("backups"), &pb).await? {
//!     println!("{} -> {}", receipt.path.display(), receipt.archive_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod chunker;
pub mod drain;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod types;

pub use buffer::{
    tree_hash_file, tree_hash_root, ChunkBuffer, FileChunk, FileHash, ReadAt, Sha256Digest,
};
pub use chunker::{chunk_file, collect_file_paths, split_ranges, FileSizer, OsFileSizer};
pub use drain::{Drain, DrainStreams, UploadAction};
pub use error::{BufferError, QueueError, UploadError};
pub use pipeline::{ArchiveReceipt, Uploader};
pub use queue::{Job, JobQueue};
pub use store::{ArchiveRecord, ArchiveStore, DryRunStore, LocalVault, Part, VaultInventory};
pub use types::{
    part_size_from_mib, Chunk, JobState, Status, UploadConfig, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PART_SIZE,
};
