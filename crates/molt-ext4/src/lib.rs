#![forbid(unsafe_code)]
//! Write-side ext4 structures.
//!
//! Synthesizes a mountable ext4 volume over the byte image previously
//! occupied by FAT32: superblock (plus sparse_super2 backups), 64-byte
//! group descriptors, block/inode bitmaps, inode tables, extent trees, and
//! directory blocks. Only the features the converter needs are produced:
//! `sparse_super2 | 64bit | extents`, dynamic revision, 256-byte inodes.
//!
//! Everything is written through the bounds-checked little-endian codec in
//! `molt-types`; there are no casts of image bytes into structs.

mod dir;
mod extent;
mod group;
mod inode;
mod sb;

pub use dir::{
    encode_dentry, record_len, write_full_block_entry, DirBuilder, DOT_DENTRY_SIZE, EXT4_NAME_MAX,
};
pub use extent::{last_extent, register_extent, required_tree_blocks, BlockExtent};
pub use group::{
    add_inode, add_reserved_inode, finalize, init_groups, inode_record_offset, mark_data_blocks,
    GroupDesc,
};
pub use inode::{Inode, InodeSlot, S_IFDIR, S_IFREG};
pub use sb::Superblock;

/// Reserved inode of the root directory.
pub const EXT4_ROOT_INODE: molt_types::InodeNo = 2;
/// Reserved inode conventionally used for `lost+found`.
pub const EXT4_LOST_FOUND_INODE: molt_types::InodeNo = 11;
/// First inode number available for ordinary files.
pub const EXT4_FIRST_NON_RSV_INODE: molt_types::InodeNo = 11;

pub(crate) const EXT4_MAGIC: u16 = 0xEF53;
pub(crate) const EXTENT_MAGIC: u16 = 0xF30A;

/// Longest extent the converter emits (`ee_len` for initialized extents).
pub const EXT4_MAX_INIT_EXTENT_LEN: u16 = 32768;

/// Size of one on-disk inode record.
pub const INODE_SIZE: u32 = 256;
/// Size of one group descriptor with the 64bit feature.
pub const DESC_SIZE: u32 = 64;
/// One inode per this many bytes of volume, as mke2fs defaults.
pub(crate) const INODE_RATIO: u32 = 16384;
