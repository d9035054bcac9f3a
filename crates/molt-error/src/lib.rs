#![forbid(unsafe_code)]
//! Error types for moltfs.
//!
//! Defines `MoltError` and a `Result<T>` alias used throughout the
//! workspace. Every conversion error is fatal: the pipeline has no retry or
//! rollback path, so errors propagate straight up to the CLI, which maps
//! them to an exit code.

use molt_types::ParseError;
use thiserror::Error;

/// Unified error type for all moltfs operations.
#[derive(Debug, Error)]
pub enum MoltError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Parse(#[from] ParseError),

    #[error("unsupported FAT geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("block group {group} overhead is {overhead} blocks, which does not fit a 16-bit extent length")]
    OverheadTooLarge { group: u32, overhead: u32 },

    #[error("filesystem too small to hold the ext4 metadata and relocated payload")]
    NoSpace,

    #[error("not enough inodes: {needed} required but only {available} allocatable")]
    NoInodes { needed: u64, available: u64 },

    #[error("not enough free blocks: {needed} required but only {available} available")]
    NoBlocks { needed: u64, available: u64 },

    #[error("file name '{0}' exceeds 255 bytes when encoded as UTF-8")]
    NameTooLong(String),

    #[error("corrupt FAT structure: {0}")]
    CorruptFat(String),
}

impl MoltError {
    /// Process exit code reported by the CLI for this error.
    ///
    /// Rejections that leave the FAT intact (bad geometry, unreadable
    /// image, the pre-flight resource check) exit with 2; allocator
    /// exhaustion, which can strike mid-pipeline and corrupt the volume,
    /// exits with 3 so scripts can distinguish the two.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_)
            | Self::Parse(_)
            | Self::UnsupportedGeometry(_)
            | Self::OverheadTooLarge { .. }
            | Self::NoInodes { .. }
            | Self::NoBlocks { .. }
            | Self::NameTooLong(_)
            | Self::CorruptFat(_) => 2,
            Self::NoSpace => 3,
        }
    }
}

/// Result alias using `MoltError`.
pub type Result<T> = std::result::Result<T, MoltError>;
