//! Extent-tree construction.
//!
//! Each inode embeds a tree root in its 60-byte `i_block` area (capacity 4
//! entries); deeper levels live in whole blocks with capacity
//! `(block_size - 12) / 12`. Extents arrive in strictly increasing logical
//! order, so insertion always happens at the right spine: append in the
//! deepest last node if it has room, otherwise hang a fresh chain of nodes
//! off the nearest ancestor with a free slot, otherwise grow the root by
//! one level and retry.

use molt_alloc::ExtentAllocator;
use molt_error::{MoltError, Result};
use molt_fat::FatGeometry;
use molt_types::{
    join_lo_hi_u48, read_le_u16, read_le_u32, split_lo_hi_u48, write_le_u16, write_le_u32,
    BlockNo, InodeNo,
};

use crate::group::{mark_data_blocks, GroupDesc};
use crate::inode::InodeSlot;
use crate::sb::Superblock;
use crate::EXTENT_MAGIC;

/// An extent in ext4 block terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    pub logical: u32,
    pub len: u16,
    pub start: BlockNo,
}

const HEADER_SIZE: usize = 12;
const ENTRY_SIZE: usize = 12;

/// Append `extent` to `ino`'s tree and account for it: block bitmap bits,
/// group free counts, and the inode's 512-byte block counter, including
/// any tree node blocks the insertion allocated.
pub fn register_extent(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    descs: &mut [GroupDesc],
    alloc: &mut ExtentAllocator,
    ino: InodeNo,
    extent: BlockExtent,
) -> Result<()> {
    assert!(extent.len > 0, "cannot register an empty extent");
    let slot = InodeSlot::locate(sb, descs, ino)?;
    let root_offset = slot.extent_root_offset();

    let mut tree_blocks = Vec::new();
    let appended = try_append(image, geom, sb, alloc, root_offset, extent, &mut tree_blocks)?;
    if !appended {
        grow_root(image, geom, sb, alloc, root_offset, &mut tree_blocks)?;
        let appended =
            try_append(image, geom, sb, alloc, root_offset, extent, &mut tree_blocks)?;
        debug_assert!(appended, "append must succeed after growing the root");
    }

    let block_512s = u64::from(sb.block_size().get() / 512);
    for &tree_block in &tree_blocks {
        mark_data_blocks(image, sb, descs, tree_block, tree_block + 1)?;
        slot.add_blocks_512(image, block_512s)?;
    }
    mark_data_blocks(
        image,
        sb,
        descs,
        extent.start,
        extent.start + u64::from(extent.len),
    )?;
    slot.add_blocks_512(image, u64::from(extent.len) * block_512s)?;
    Ok(())
}

/// The rightmost leaf extent of `ino`'s tree, if any.
pub fn last_extent(
    image: &[u8],
    sb: &Superblock,
    descs: &[GroupDesc],
    ino: InodeNo,
) -> Result<Option<BlockExtent>> {
    let slot = InodeSlot::locate(sb, descs, ino)?;
    let mut node_offset = slot.extent_root_offset();
    loop {
        let entries = read_le_u16(image, node_offset + 2)?;
        let depth = read_le_u16(image, node_offset + 6)?;
        if entries == 0 {
            return Ok(None);
        }
        let last = entry_offset(node_offset, entries - 1);
        if depth == 0 {
            return Ok(Some(BlockExtent {
                logical: read_le_u32(image, last)?,
                len: read_le_u16(image, last + 4)?,
                start: join_lo_hi_u48(
                    read_le_u32(image, last + 8)?,
                    read_le_u16(image, last + 6)?,
                ),
            }));
        }
        let child = join_lo_hi_u48(read_le_u32(image, last + 4)?, read_le_u16(image, last + 8)?);
        node_offset = child as usize * sb.block_size().as_usize();
    }
}

/// Tree node blocks needed to hold `extent_count` leaf extents, given the
/// right-spine append pattern (each level fills completely before a new
/// sibling appears). Used by the pre-flight resource check.
#[must_use]
pub fn required_tree_blocks(extent_count: u64, block_size: u32) -> u64 {
    let root_capacity = 4;
    if extent_count <= root_capacity {
        return 0;
    }
    let node_capacity = u64::from((block_size - HEADER_SIZE as u32) / ENTRY_SIZE as u32);
    let mut total = 0;
    let mut level_entries = extent_count;
    loop {
        let nodes = level_entries.div_ceil(node_capacity);
        total += nodes;
        if nodes <= root_capacity {
            return total;
        }
        level_entries = nodes;
    }
}

fn entry_offset(node_offset: usize, index: u16) -> usize {
    node_offset + HEADER_SIZE + usize::from(index) * ENTRY_SIZE
}

fn node_capacity(sb: &Superblock) -> u16 {
    ((sb.block_size().as_usize() - HEADER_SIZE) / ENTRY_SIZE) as u16
}

/// Depth-first append along the right spine. Returns false when neither
/// this node nor any descendant has room.
fn try_append(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    node_offset: usize,
    extent: BlockExtent,
    tree_blocks: &mut Vec<BlockNo>,
) -> Result<bool> {
    let entries = read_le_u16(image, node_offset + 2)?;
    let max = read_le_u16(image, node_offset + 4)?;
    let depth = read_le_u16(image, node_offset + 6)?;

    if depth == 0 {
        if entries < max {
            write_leaf_entry(image, entry_offset(node_offset, entries), extent)?;
            write_le_u16(image, node_offset + 2, entries + 1)?;
            return Ok(true);
        }
        return Ok(false);
    }

    let last = entry_offset(node_offset, entries - 1);
    let child = join_lo_hi_u48(read_le_u32(image, last + 4)?, read_le_u16(image, last + 8)?);
    let child_offset = child as usize * sb.block_size().as_usize();
    if try_append(image, geom, sb, alloc, child_offset, extent, tree_blocks)? {
        return Ok(true);
    }

    if entries < max {
        let chain_top = build_chain(image, geom, sb, alloc, depth - 1, extent, tree_blocks)?;
        write_index_entry(
            image,
            entry_offset(node_offset, entries),
            extent.logical,
            chain_top,
        )?;
        write_le_u16(image, node_offset + 2, entries + 1)?;
        return Ok(true);
    }
    Ok(false)
}

/// Create a fresh chain of nodes spanning `depth` levels, with `extent` as
/// the single entry of the new leaf. Returns the chain's topmost block.
fn build_chain(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    depth: u16,
    extent: BlockExtent,
    tree_blocks: &mut Vec<BlockNo>,
) -> Result<BlockNo> {
    let leaf = allocate_tree_block(image, geom, sb, alloc, tree_blocks)?;
    let leaf_offset = leaf as usize * sb.block_size().as_usize();
    write_node_header(image, leaf_offset, 1, node_capacity(sb), 0)?;
    write_leaf_entry(image, leaf_offset + HEADER_SIZE, extent)?;

    let mut top = leaf;
    for level in 1..=depth {
        let index = allocate_tree_block(image, geom, sb, alloc, tree_blocks)?;
        let index_offset = index as usize * sb.block_size().as_usize();
        write_node_header(image, index_offset, 1, node_capacity(sb), level)?;
        write_index_entry(image, index_offset + HEADER_SIZE, extent.logical, top)?;
        top = index;
    }
    Ok(top)
}

/// Move the root's payload into a freshly allocated node and point the
/// root (now one level deeper) at it.
fn grow_root(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    root_offset: usize,
    tree_blocks: &mut Vec<BlockNo>,
) -> Result<()> {
    let depth = read_le_u16(image, root_offset + 6)?;
    let new_block = allocate_tree_block(image, geom, sb, alloc, tree_blocks)?;
    let new_offset = new_block as usize * sb.block_size().as_usize();

    // the 60-byte root payload becomes the new node, with expanded capacity
    let root_bytes: Vec<u8> = image[root_offset..root_offset + 60].to_vec();
    image[new_offset..new_offset + 60].copy_from_slice(&root_bytes);
    write_le_u16(image, new_offset + 4, node_capacity(sb))?;

    write_le_u16(image, root_offset + 2, 1)?;
    write_le_u16(image, root_offset + 6, depth + 1)?;
    write_index_entry(image, root_offset + HEADER_SIZE, 0, new_block)?;
    Ok(())
}

fn allocate_tree_block(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    alloc: &mut ExtentAllocator,
    tree_blocks: &mut Vec<BlockNo>,
) -> Result<BlockNo> {
    let cluster = alloc.allocate(1)?.physical_start;
    let block = geom.cluster_to_block(cluster);
    let offset = block as usize * sb.block_size().as_usize();
    let block_size = sb.block_size().as_usize();
    image
        .get_mut(offset..offset + block_size)
        .ok_or(MoltError::NoSpace)?
        .fill(0);
    tree_blocks.push(block);
    Ok(block)
}

fn write_node_header(
    image: &mut [u8],
    offset: usize,
    entries: u16,
    max: u16,
    depth: u16,
) -> Result<()> {
    write_le_u16(image, offset, EXTENT_MAGIC)?;
    write_le_u16(image, offset + 2, entries)?;
    write_le_u16(image, offset + 4, max)?;
    write_le_u16(image, offset + 6, depth)?;
    write_le_u32(image, offset + 8, 0)?; // generation
    Ok(())
}

fn write_leaf_entry(image: &mut [u8], offset: usize, extent: BlockExtent) -> Result<()> {
    let (start_lo, start_hi) = split_lo_hi_u48(extent.start);
    write_le_u32(image, offset, extent.logical)?;
    write_le_u16(image, offset + 4, extent.len)?;
    write_le_u16(image, offset + 6, start_hi)?;
    write_le_u32(image, offset + 8, start_lo)?;
    Ok(())
}

fn write_index_entry(image: &mut [u8], offset: usize, logical: u32, child: BlockNo) -> Result<()> {
    let (child_lo, child_hi) = split_lo_hi_u48(child);
    write_le_u32(image, offset, logical)?;
    write_le_u32(image, offset + 4, child_lo)?;
    write_le_u16(image, offset + 8, child_hi)?;
    write_le_u16(image, offset + 10, 0)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::init_groups;
    use crate::inode::Inode;
    use crate::sb::tests::test_geometry;
    use crate::EXT4_ROOT_INODE;

    struct Fixture {
        geom: FatGeometry,
        sb: Superblock,
        image: Vec<u8>,
        descs: Vec<GroupDesc>,
        alloc: ExtentAllocator,
    }

    fn fixture(data_clusters: u32) -> Fixture {
        let geom = test_geometry(1, data_clusters);
        let sb = Superblock::new(&geom, b"", [0u8; 16], 0).unwrap();
        let mut image = vec![0u8; geom.partition_bytes as usize];
        let mut descs = init_groups(&mut image, &sb).unwrap();
        let alloc =
            ExtentAllocator::new(&image, &geom, sb.blocked_cluster_ranges(&geom)).unwrap();
        let inode = Inode::new_dir(0, 0, 0);
        crate::group::add_reserved_inode(&mut image, &sb, &mut descs, 2, &inode).unwrap();
        Fixture {
            geom,
            sb,
            image,
            descs,
            alloc,
        }
    }

    /// Collect every leaf extent in logical order.
    fn walk(fix: &Fixture, ino: InodeNo) -> Vec<BlockExtent> {
        let slot = InodeSlot::locate(&fix.sb, &fix.descs, ino).unwrap();
        let mut out = Vec::new();
        walk_node(fix, slot.extent_root_offset(), &mut out);
        out
    }

    fn walk_node(fix: &Fixture, node_offset: usize, out: &mut Vec<BlockExtent>) {
        let entries = read_le_u16(&fix.image, node_offset + 2).unwrap();
        let depth = read_le_u16(&fix.image, node_offset + 6).unwrap();
        for index in 0..entries {
            let offset = entry_offset(node_offset, index);
            if depth == 0 {
                out.push(BlockExtent {
                    logical: read_le_u32(&fix.image, offset).unwrap(),
                    len: read_le_u16(&fix.image, offset + 4).unwrap(),
                    start: join_lo_hi_u48(
                        read_le_u32(&fix.image, offset + 8).unwrap(),
                        read_le_u16(&fix.image, offset + 6).unwrap(),
                    ),
                });
            } else {
                let child = join_lo_hi_u48(
                    read_le_u32(&fix.image, offset + 4).unwrap(),
                    read_le_u16(&fix.image, offset + 8).unwrap(),
                );
                walk_node(fix, child as usize * 1024, out);
            }
        }
    }

    fn register(fix: &mut Fixture, ino: InodeNo, extent: BlockExtent) {
        register_extent(
            &mut fix.image,
            &fix.geom,
            &fix.sb,
            &mut fix.descs,
            &mut fix.alloc,
            ino,
            extent,
        )
        .unwrap();
    }

    #[test]
    fn extents_fit_in_inode_root() {
        let mut fix = fixture(4000);
        for index in 0..4u32 {
            register(
                &mut fix,
                EXT4_ROOT_INODE,
                BlockExtent {
                    logical: index,
                    len: 1,
                    start: 200 + u64::from(index) * 7,
                },
            );
        }
        let slot = InodeSlot::locate(&fix.sb, &fix.descs, EXT4_ROOT_INODE).unwrap();
        assert_eq!(read_le_u16(&fix.image, slot.extent_root_offset() + 6).unwrap(), 0);
        assert_eq!(walk(&fix, EXT4_ROOT_INODE).len(), 4);
        // 4 single-block extents at 1 KiB = 8 sectors
        assert_eq!(slot.blocks_512(&fix.image).unwrap(), 8);
        assert_eq!(
            last_extent(&fix.image, &fix.sb, &fix.descs, EXT4_ROOT_INODE)
                .unwrap()
                .unwrap()
                .start,
            200 + 21
        );
    }

    #[test]
    fn fifth_extent_grows_to_depth_one() {
        let mut fix = fixture(4000);
        for index in 0..5u32 {
            register(
                &mut fix,
                EXT4_ROOT_INODE,
                BlockExtent {
                    logical: index,
                    len: 1,
                    start: 200 + u64::from(index) * 3,
                },
            );
        }
        let slot = InodeSlot::locate(&fix.sb, &fix.descs, EXT4_ROOT_INODE).unwrap();
        let root = slot.extent_root_offset();
        assert_eq!(read_le_u16(&fix.image, root + 6).unwrap(), 1, "depth");
        assert_eq!(read_le_u16(&fix.image, root + 2).unwrap(), 1, "entries");

        let extents = walk(&fix, EXT4_ROOT_INODE);
        assert_eq!(extents.len(), 5);
        for (index, extent) in extents.iter().enumerate() {
            assert_eq!(extent.logical, index as u32);
        }
        // 5 data blocks + 1 tree node = 12 sectors
        assert_eq!(slot.blocks_512(&fix.image).unwrap(), 12);
    }

    #[test]
    fn empty_tree_has_no_last_extent() {
        let fix = fixture(400);
        assert!(last_extent(&fix.image, &fix.sb, &fix.descs, EXT4_ROOT_INODE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn depth_two_growth_keeps_order() {
        let mut fix = fixture(4000);
        // 1 KiB nodes hold 84 entries; 4 full depth-1 leaves = 336 extents
        // fill the depth-1 root, the 337th forces depth 2.
        let count = 4 * 84 + 1;
        for index in 0..count {
            register(
                &mut fix,
                EXT4_ROOT_INODE,
                BlockExtent {
                    logical: index,
                    len: 1,
                    start: 600 + u64::from(index),
                },
            );
        }
        let slot = InodeSlot::locate(&fix.sb, &fix.descs, EXT4_ROOT_INODE).unwrap();
        let root = slot.extent_root_offset();
        assert_eq!(read_le_u16(&fix.image, root + 6).unwrap(), 2, "depth");

        let extents = walk(&fix, EXT4_ROOT_INODE);
        assert_eq!(extents.len() as u32, count);
        for (index, extent) in extents.iter().enumerate() {
            assert_eq!(extent.logical, index as u32);
            assert_eq!(extent.start, 600 + index as u64);
        }
    }

    #[test]
    fn registration_marks_bitmap_and_free_counts() {
        let mut fix = fixture(4000);
        let free_before = fix.descs[0].free_blocks_count;
        register(
            &mut fix,
            EXT4_ROOT_INODE,
            BlockExtent {
                logical: 0,
                len: 8,
                start: 300,
            },
        );
        assert_eq!(fix.descs[0].free_blocks_count, free_before - 8);
        let bb_offset = fix.descs[0].block_bitmap as usize * 1024;
        let bb = &fix.image[bb_offset..bb_offset + 1024];
        let group_start = fix.sb.group_start_block(0);
        for block in 300u64..308 {
            assert!(molt_types::bitmap_get(bb, (block - group_start) as u32));
        }
    }

    #[test]
    fn required_tree_blocks_matches_growth() {
        // capacity 84 at 1 KiB
        assert_eq!(required_tree_blocks(0, 1024), 0);
        assert_eq!(required_tree_blocks(4, 1024), 0);
        assert_eq!(required_tree_blocks(5, 1024), 1);
        assert_eq!(required_tree_blocks(84, 1024), 1);
        assert_eq!(required_tree_blocks(85, 1024), 2);
        assert_eq!(required_tree_blocks(4 * 84, 1024), 4);
        assert_eq!(required_tree_blocks(4 * 84 + 1, 1024), 6);
    }

    #[test]
    fn required_blocks_agree_with_actual_depth_two_build() {
        let mut fix = fixture(4000);
        let count = 4 * 84 + 1;
        let free_before = fix.descs[0].free_blocks_count;
        for index in 0..count {
            register(
                &mut fix,
                EXT4_ROOT_INODE,
                BlockExtent {
                    logical: index,
                    len: 1,
                    start: 600 + u64::from(index),
                },
            );
        }
        let consumed = u64::from(free_before - fix.descs[0].free_blocks_count);
        assert_eq!(
            consumed,
            u64::from(count) + required_tree_blocks(u64::from(count), 1024)
        );
    }
}
