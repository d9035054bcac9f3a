//! Pre-flight resource check between the two phases.
//!
//! Phase R leaves the FAT intact; Phase W destroys it with its first
//! superblock write. Replaying the archive here, counting the inodes and
//! the directory and extent-tree blocks the build will need, lets the
//! conversion abort with a clean volume instead of mid-write.

use molt_alloc::ExtentAllocator;
use molt_archive::StreamReader;
use molt_error::{MoltError, Result};
use molt_ext4::{record_len, required_tree_blocks, Superblock, DOT_DENTRY_SIZE};
use molt_fat::{FatDentry, FatGeometry};
use molt_types::ClusterNo;

use crate::records::{
    decode_extent, read_child_count, read_name, read_single_run, DENTRY_RECORD_SIZE,
    EXTENT_RECORD_SIZE, NAME_SLOT_SIZE,
};

/// Blocks reserved on top of the walk's estimate for `lost+found` (its dot
/// block and a possible extra root directory block).
const LOST_FOUND_CUSHION: u64 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceEstimate {
    pub inodes: u64,
    pub blocks: u64,
}

/// Replay the archive and verify the geometry can hold the tree.
pub fn check(
    image: &[u8],
    geom: &FatGeometry,
    sb: &Superblock,
    alloc: &ExtentAllocator,
    head: ClusterNo,
) -> Result<ResourceEstimate> {
    let mut reader = StreamReader::new(image, geom, head)?;
    reader.skip_run(image, geom, DENTRY_RECORD_SIZE)?;
    reader.skip_run(image, geom, NAME_SLOT_SIZE)?;

    let mut estimate = ResourceEstimate::default();
    visit_dir(image, geom, sb, &mut reader, &mut estimate)?;
    estimate.blocks += LOST_FOUND_CUSHION;

    let available_inodes = u64::from(sb.allocatable_inode_count());
    if estimate.inodes > available_inodes {
        return Err(MoltError::NoInodes {
            needed: estimate.inodes,
            available: available_inodes,
        });
    }
    let available_blocks = alloc.free_cluster_count();
    if estimate.blocks > available_blocks {
        return Err(MoltError::NoBlocks {
            needed: estimate.blocks,
            available: available_blocks,
        });
    }

    tracing::debug!(
        inodes = estimate.inodes,
        blocks = estimate.blocks,
        available_inodes,
        available_blocks,
        "pre-flight resource check passed"
    );
    Ok(estimate)
}

fn visit_dir(
    image: &[u8],
    geom: &FatGeometry,
    sb: &Superblock,
    reader: &mut StreamReader,
    estimate: &mut ResourceEstimate,
) -> Result<()> {
    // the directory's own clusters serve as its first blocks
    let mut own_clusters = 0u64;
    while let Some(bytes) = reader.next(image, geom, EXTENT_RECORD_SIZE)? {
        own_clusters += u64::from(decode_extent(&bytes).length);
    }
    let child_count = read_child_count(reader, image, geom)?;

    let block_size = sb.block_size().as_usize();
    let mut dir_blocks = 1u64;
    let mut position = 2 * DOT_DENTRY_SIZE;

    for _ in 0..child_count {
        let dentry_bytes = read_single_run(reader, image, geom, DENTRY_RECORD_SIZE)?;
        let fat_dentry = FatDentry::parse(&dentry_bytes, 0)?;
        let name = read_name(reader, image, geom)?;
        estimate.inodes += 1;

        let rec_len = usize::from(record_len(name.as_bytes())?);
        if rec_len > block_size - position {
            dir_blocks += 1;
            position = 0;
        }
        position += rec_len;

        if fat_dentry.is_dir() {
            visit_dir(image, geom, sb, reader, estimate)?;
        } else {
            let mut extent_count = 0u64;
            while reader.next(image, geom, EXTENT_RECORD_SIZE)?.is_some() {
                extent_count += 1;
            }
            estimate.blocks += required_tree_blocks(extent_count, sb.block_size().get());
            read_child_count(reader, image, geom)?;
        }
    }

    estimate.blocks += dir_blocks.saturating_sub(own_clusters);
    estimate.blocks += required_tree_blocks(dir_blocks, sb.block_size().get());
    Ok(())
}
