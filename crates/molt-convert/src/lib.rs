#![forbid(unsafe_code)]
//! The moltfs conversion engine.
//!
//! Converts a FAT32 volume into ext4 in place over a borrowed byte image.
//! Payload stays where it lies; only clusters colliding with the ext4
//! metadata footprint are relocated. The pipeline has two phases bridged
//! by an on-medium scratch log:
//!
//! 1. **Phase R** walks the FAT directory tree, relocates colliding
//!    payload, and serializes every entry into the stream archiver.
//! 2. **Phase W** drains the archiver in the same order, synthesizing
//!    inodes, extent trees, and directory blocks, then finalizes the
//!    superblock and group descriptors.
//!
//! A resource check between the phases aborts, with the FAT still
//! mountable, if the geometry cannot hold the ext4 tree. Once Phase W
//! begins, failure leaves the volume corrupt; there is no rollback.

mod deserializer;
mod dryrun;
mod records;
mod serializer;

pub use deserializer::{TreeBuilder, WriteStats};
pub use dryrun::ResourceEstimate;
pub use serializer::ReadStats;

use molt_alloc::ExtentAllocator;
use molt_archive::StreamWriter;
use molt_error::{MoltError, Result};
use molt_ext4::{finalize, init_groups, Superblock};
use molt_fat::{BootSector, FatGeometry};
use serde::Serialize;

/// Host-supplied parameters the conversion cannot derive from the image.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Owner of every produced inode (`lost+found` stays root's).
    pub owner_uid: u32,
    pub owner_gid: u32,
    /// Current time in Unix seconds, for `s_mkfs_time` and fresh inodes.
    pub now: u32,
    /// Volume UUID; generate random bytes with RFC 4122 v4 bits.
    pub uuid: [u8; 16],
}

/// Summary of a completed conversion.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub files: u64,
    pub directories: u64,
    pub relocated_clusters: u64,
    pub archive_pages: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub block_groups: u32,
    pub inode_count: u32,
    pub free_blocks: u64,
    pub free_inodes: u32,
    pub volume_name: String,
}

/// Convert the FAT32 volume in `image` to ext4, in place.
///
/// On success the image holds a mountable ext4 filesystem. Errors raised
/// before Phase W leave the FAT intact; later errors corrupt the volume.
pub fn convert(image: &mut [u8], options: &ConvertOptions) -> Result<Report> {
    let boot = BootSector::parse(image)?;
    let geom = FatGeometry::new(&boot)?;
    if geom.partition_bytes > image.len() as u64 {
        return Err(MoltError::CorruptFat(format!(
            "boot sector claims {} bytes but the image holds {}",
            geom.partition_bytes,
            image.len()
        )));
    }

    let mut sb = Superblock::new(&geom, boot.volume_label(), options.uuid, options.now)?;
    let blocked = sb.blocked_cluster_ranges(&geom);
    let mut alloc = ExtentAllocator::new(image, &geom, blocked)?;

    tracing::info!(
        cluster_size = geom.cluster_size.get(),
        data_clusters = geom.data_cluster_count,
        block_groups = sb.group_count(),
        "starting in-place conversion"
    );

    // Phase R: the FAT is still authoritative.
    let mut writer = StreamWriter::new(image, &geom, &mut alloc)?;
    let read_stats = serializer::serialize_fat_tree(image, &geom, &mut alloc, &mut writer)?;

    // Last point of no return: verify resources before overwriting FAT
    // structures.
    dryrun::check(image, &geom, &sb, &alloc, writer.head())?;

    // Phase W: destructive from here on.
    let mut descs = init_groups(image, &sb)?;
    let builder = TreeBuilder::new(options.owner_uid, options.owner_gid, options.now);
    builder.build(image, &geom, &sb, &mut descs, &mut alloc, writer.head())?;
    finalize(image, &mut sb, &descs)?;

    let volume_name = String::from_utf8_lossy(&sb.volume_name)
        .trim_end_matches('\0')
        .to_string();
    Ok(Report {
        files: read_stats.files,
        directories: read_stats.directories,
        relocated_clusters: read_stats.relocated_clusters,
        archive_pages: writer.pages(),
        block_size: sb.block_size().get(),
        block_count: sb.blocks_count,
        block_groups: sb.group_count(),
        inode_count: sb.inodes_count,
        free_blocks: sb.free_blocks_count,
        free_inodes: sb.free_inodes_count,
        volume_name,
    })
}
