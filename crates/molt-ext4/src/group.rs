//! Block-group descriptors and per-group on-disk state.
//!
//! Descriptors are held as plain values while the tree is built and only
//! serialized (primary + backups) during finalization. Bitmaps and inode
//! tables, by contrast, live directly in the image from the moment
//! `init_groups` runs, because extent registration mutates them
//! incrementally.

use molt_error::{MoltError, Result};
use molt_types::{
    bitmap_set, bitmap_set_range, split_lo_hi_u32, split_lo_hi_u64, write_bytes, write_le_u16,
    write_le_u32, BlockNo, GroupNo, InodeNo,
};

use crate::inode::Inode;
use crate::sb::Superblock;
use crate::{DESC_SIZE, EXT4_FIRST_NON_RSV_INODE, INODE_SIZE};

/// One block-group descriptor, prior to serialization.
#[derive(Debug, Clone)]
pub struct GroupDesc {
    pub block_bitmap: BlockNo,
    pub inode_bitmap: BlockNo,
    pub inode_table: BlockNo,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
}

impl GroupDesc {
    /// Serialize into the 64-byte on-disk layout at `offset`.
    pub fn serialize_into(&self, image: &mut [u8], offset: usize) -> Result<()> {
        let (bb_lo, bb_hi) = split_lo_hi_u64(self.block_bitmap);
        let (ib_lo, ib_hi) = split_lo_hi_u64(self.inode_bitmap);
        let (it_lo, it_hi) = split_lo_hi_u64(self.inode_table);
        let (free_b_lo, free_b_hi) = split_lo_hi_u32(self.free_blocks_count);
        let (free_i_lo, free_i_hi) = split_lo_hi_u32(self.free_inodes_count);
        let (dirs_lo, dirs_hi) = split_lo_hi_u32(self.used_dirs_count);

        write_bytes(image, offset, &[0u8; DESC_SIZE as usize])?;
        write_le_u32(image, offset + 0x00, bb_lo)?;
        write_le_u32(image, offset + 0x04, ib_lo)?;
        write_le_u32(image, offset + 0x08, it_lo)?;
        write_le_u16(image, offset + 0x0C, free_b_lo)?;
        write_le_u16(image, offset + 0x0E, free_i_lo)?;
        write_le_u16(image, offset + 0x10, dirs_lo)?;
        write_le_u32(image, offset + 0x20, bb_hi)?;
        write_le_u32(image, offset + 0x24, ib_hi)?;
        write_le_u32(image, offset + 0x28, it_hi)?;
        write_le_u16(image, offset + 0x2C, free_b_hi)?;
        write_le_u16(image, offset + 0x2E, free_i_hi)?;
        write_le_u16(image, offset + 0x30, dirs_hi)?;
        Ok(())
    }
}

/// Initialize every group's descriptor, bitmaps, and inode table.
///
/// Block bitmaps get the overhead region `[0, overhead)` and the
/// non-existent tail of the last group set; inode bitmaps get the reserved
/// inodes (group 0) and the tail past `inodes_per_group` set. Inode tables
/// are zeroed wholesale.
pub fn init_groups(image: &mut [u8], sb: &Superblock) -> Result<Vec<GroupDesc>> {
    let block_size = sb.block_size().as_usize();
    let bits = sb.block_size().bits();
    let itable_blocks = sb.inode_table_block_count() as usize;
    let mut descs = Vec::with_capacity(sb.group_count() as usize);

    for group_no in 0..sb.group_count() {
        let has_sb_copy = sb.group_has_sb_copy(group_no);
        let overhead = sb.overhead(has_sb_copy);
        let start_block = sb.group_start_block(group_no);
        let block_count = sb.group_block_count(group_no);
        let used_inodes = if group_no == 0 {
            EXT4_FIRST_NON_RSV_INODE
        } else {
            0
        };

        let block_bitmap = if has_sb_copy {
            start_block + 1 + u64::from(sb.gdt_block_count())
        } else {
            start_block
        };
        let inode_bitmap = block_bitmap + 1;
        let inode_table = block_bitmap + 2;

        let bb_offset = block_bitmap as usize * block_size;
        let bb = &mut image[bb_offset..bb_offset + block_size];
        bb.fill(0);
        bitmap_set_range(bb, 0, overhead);
        bitmap_set_range(bb, block_count as u32, bits);

        let ib_offset = inode_bitmap as usize * block_size;
        let ib = &mut image[ib_offset..ib_offset + block_size];
        ib.fill(0);
        bitmap_set_range(ib, 0, used_inodes);
        bitmap_set_range(ib, sb.inodes_per_group, bits);

        let it_offset = inode_table as usize * block_size;
        image[it_offset..it_offset + itable_blocks * block_size].fill(0);

        descs.push(GroupDesc {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count: block_count as u32 - overhead,
            free_inodes_count: sb.inodes_per_group - used_inodes,
            used_dirs_count: 0,
        });
    }

    Ok(descs)
}

/// Byte offset of inode `ino`'s record inside its group's inode table.
pub fn inode_record_offset(
    sb: &Superblock,
    descs: &[GroupDesc],
    ino: InodeNo,
) -> Result<usize> {
    let group_no = (ino - 1) / sb.inodes_per_group;
    let desc = descs.get(group_no as usize).ok_or(MoltError::NoInodes {
        needed: u64::from(ino),
        available: u64::from(sb.inodes_count),
    })?;
    let index_in_group = (ino - 1) % sb.inodes_per_group;
    Ok(desc.inode_table as usize * sb.block_size().as_usize()
        + index_in_group as usize * INODE_SIZE as usize)
}

/// Write an ordinary inode: record, inode bitmap bit, free/used counters.
pub fn add_inode(
    image: &mut [u8],
    sb: &Superblock,
    descs: &mut [GroupDesc],
    ino: InodeNo,
    inode: &Inode,
) -> Result<()> {
    let record_offset = inode_record_offset(sb, descs, ino)?;
    inode.serialize_into(image, record_offset)?;

    let group_no = ((ino - 1) / sb.inodes_per_group) as usize;
    let index_in_group = (ino - 1) % sb.inodes_per_group;
    let desc = &mut descs[group_no];

    let ib_offset = desc.inode_bitmap as usize * sb.block_size().as_usize();
    let ib = &mut image[ib_offset..ib_offset + sb.block_size().as_usize()];
    bitmap_set(ib, index_in_group);

    desc.free_inodes_count -= 1;
    if inode.is_dir() {
        desc.used_dirs_count += 1;
    }
    Ok(())
}

/// Write a reserved inode (root, `lost+found`): record and directory count
/// only. The reserved bitmap bits and free counts were claimed for the
/// whole reserved range when group 0 was initialized.
pub fn add_reserved_inode(
    image: &mut [u8],
    sb: &Superblock,
    descs: &mut [GroupDesc],
    ino: InodeNo,
    inode: &Inode,
) -> Result<()> {
    let record_offset = inode_record_offset(sb, descs, ino)?;
    inode.serialize_into(image, record_offset)?;
    if inode.is_dir() {
        descs[((ino - 1) / sb.inodes_per_group) as usize].used_dirs_count += 1;
    }
    Ok(())
}

/// Mark the blocks `[begin, end)` as in use: block bitmap bits plus the
/// owning groups' free-block counters. Ranges crossing a group boundary are
/// split so each group accounts exactly the blocks it contains.
pub fn mark_data_blocks(
    image: &mut [u8],
    sb: &Superblock,
    descs: &mut [GroupDesc],
    begin: BlockNo,
    end: BlockNo,
) -> Result<()> {
    let block_size = sb.block_size().as_usize();
    let mut chunk_begin = begin;
    while chunk_begin < end {
        let group_no = sb.group_of_block(chunk_begin);
        let group_start = sb.group_start_block(group_no);
        let group_end = group_start + sb.group_block_count(group_no);
        let chunk_end = end.min(group_end);

        let desc = descs
            .get_mut(group_no as usize)
            .ok_or_else(|| MoltError::CorruptFat(format!("block {chunk_begin} outside volume")))?;
        let bb_offset = desc.block_bitmap as usize * block_size;
        let bb = &mut image[bb_offset..bb_offset + block_size];
        bitmap_set_range(
            bb,
            (chunk_begin - group_start) as u32,
            (chunk_end - group_start) as u32,
        );
        desc.free_blocks_count = desc
            .free_blocks_count
            .checked_sub((chunk_end - chunk_begin) as u32)
            .ok_or_else(|| {
                MoltError::CorruptFat(format!("group {group_no} free-block count underflow"))
            })?;
        chunk_begin = chunk_end;
    }
    Ok(())
}

/// Roll the per-group free counters up into the superblock and write the
/// primary superblock + GDT along with every backup copy.
pub fn finalize(
    image: &mut [u8],
    sb: &mut Superblock,
    descs: &[GroupDesc],
) -> Result<()> {
    sb.free_blocks_count = descs.iter().map(|d| u64::from(d.free_blocks_count)).sum();
    sb.free_inodes_count = descs.iter().map(|d| d.free_inodes_count).sum();

    let mut copy_groups = vec![0];
    copy_groups.extend(sb.backup_bgs.iter().copied().filter(|&g| g != 0));
    for group_no in copy_groups {
        sb.write_copy(image, group_no)?;
        write_gdt(image, sb, descs, group_no)?;
    }
    tracing::info!(
        free_blocks = sb.free_blocks_count,
        free_inodes = sb.free_inodes_count,
        "superblock and descriptor copies written"
    );
    Ok(())
}

fn write_gdt(
    image: &mut [u8],
    sb: &Superblock,
    descs: &[GroupDesc],
    group_no: GroupNo,
) -> Result<()> {
    let block_size = sb.block_size().as_usize();
    let gdt_offset = (sb.group_start_block(group_no) as usize + 1) * block_size;
    let gdt_bytes = sb.gdt_block_count() as usize * block_size;
    image[gdt_offset..gdt_offset + gdt_bytes].fill(0);
    for (index, desc) in descs.iter().enumerate() {
        desc.serialize_into(image, gdt_offset + index * DESC_SIZE as usize)?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::tests::test_geometry;
    use crate::S_IFDIR;
    use molt_types::{bitmap_get, read_le_u16, read_le_u32};

    fn setup() -> (Superblock, Vec<u8>) {
        let geom = test_geometry(1, 512);
        let sb = Superblock::new(&geom, b"MOLT", [7u8; 16], 0).unwrap();
        let image = vec![0xEE; geom.partition_bytes as usize];
        (sb, image)
    }

    #[test]
    fn init_marks_overhead_and_tail() {
        let (sb, mut image) = setup();
        let descs = init_groups(&mut image, &sb).unwrap();
        assert_eq!(descs.len(), 1);
        let desc = &descs[0];

        // layout: sb copy at block 1, gdt at 2, bitmaps and itable follow
        assert_eq!(desc.block_bitmap, 1 + 1 + u64::from(sb.gdt_block_count()));
        assert_eq!(desc.inode_bitmap, desc.block_bitmap + 1);
        assert_eq!(desc.inode_table, desc.block_bitmap + 2);

        let overhead = sb.group_overhead(0);
        let bb_offset = desc.block_bitmap as usize * 1024;
        let bb = &image[bb_offset..bb_offset + 1024];
        assert!(bitmap_get(bb, 0));
        assert!(bitmap_get(bb, overhead - 1));
        assert!(!bitmap_get(bb, overhead));
        // tail past the 513 real blocks is marked
        let block_count = sb.group_block_count(0) as u32;
        assert!(!bitmap_get(bb, block_count - 1));
        assert!(bitmap_get(bb, block_count));
        assert!(bitmap_get(bb, sb.block_size().bits() - 1));

        let ib_offset = desc.inode_bitmap as usize * 1024;
        let ib = &image[ib_offset..ib_offset + 1024];
        assert!(bitmap_get(ib, 10)); // reserved inode 11
        assert!(!bitmap_get(ib, 11)); // inode 12 free
        assert!(bitmap_get(ib, sb.inodes_per_group));

        assert_eq!(desc.free_inodes_count, sb.inodes_per_group - 11);
        assert_eq!(desc.free_blocks_count, block_count - overhead);
    }

    #[test]
    fn add_inode_updates_bitmap_and_counts() {
        let (sb, mut image) = setup();
        let mut descs = init_groups(&mut image, &sb).unwrap();
        let before = descs[0].free_inodes_count;

        let inode = Inode::new_dir(0, 0, 100);
        add_inode(&mut image, &sb, &mut descs, 12, &inode).unwrap();

        assert_eq!(descs[0].free_inodes_count, before - 1);
        assert_eq!(descs[0].used_dirs_count, 1);
        let ib_offset = descs[0].inode_bitmap as usize * 1024;
        assert!(bitmap_get(&image[ib_offset..ib_offset + 1024], 11));

        let record = inode_record_offset(&sb, &descs, 12).unwrap();
        assert_eq!(read_le_u16(&image, record).unwrap(), 0o755 | S_IFDIR);
    }

    #[test]
    fn reserved_inode_skips_accounting() {
        let (sb, mut image) = setup();
        let mut descs = init_groups(&mut image, &sb).unwrap();
        let before = descs[0].free_inodes_count;

        let inode = Inode::new_dir(0, 0, 100);
        add_reserved_inode(&mut image, &sb, &mut descs, 2, &inode).unwrap();
        assert_eq!(descs[0].free_inodes_count, before);
        assert_eq!(descs[0].used_dirs_count, 1);
    }

    #[test]
    fn inode_beyond_groups_errors() {
        let (sb, mut image) = setup();
        let mut descs = init_groups(&mut image, &sb).unwrap();
        let inode = Inode::new_file(0, 0, 0, 0, 0, 0);
        let past_end = sb.inodes_per_group * sb.group_count() + 1;
        assert!(add_inode(&mut image, &sb, &mut descs, past_end, &inode).is_err());
    }

    #[test]
    fn mark_blocks_updates_bitmap_and_free_count() {
        let (sb, mut image) = setup();
        let mut descs = init_groups(&mut image, &sb).unwrap();
        let before = descs[0].free_blocks_count;

        let overhead = u64::from(sb.group_overhead(0));
        let begin = sb.group_start_block(0) + overhead + 10;
        mark_data_blocks(&mut image, &sb, &mut descs, begin, begin + 5).unwrap();

        assert_eq!(descs[0].free_blocks_count, before - 5);
        let bb_offset = descs[0].block_bitmap as usize * 1024;
        let bb = &image[bb_offset..bb_offset + 1024];
        let first_bit = (begin - sb.group_start_block(0)) as u32;
        assert!(!bitmap_get(bb, first_bit - 1));
        assert!(bitmap_get(bb, first_bit));
        assert!(bitmap_get(bb, first_bit + 4));
        assert!(!bitmap_get(bb, first_bit + 5));
    }

    #[test]
    fn mark_blocks_splits_across_groups() {
        let geom = test_geometry(4, 70_000);
        let sb = Superblock::new(&geom, b"", [0u8; 16], 0).unwrap();
        let mut image = vec![0u8; geom.partition_bytes as usize];
        let mut descs = init_groups(&mut image, &sb).unwrap();
        assert!(descs.len() >= 2);
        let free0 = descs[0].free_blocks_count;
        let free1 = descs[1].free_blocks_count;

        // 8 blocks straddling the group 0/1 boundary (boundary at 32768)
        mark_data_blocks(&mut image, &sb, &mut descs, 32_764, 32_772).unwrap();
        assert_eq!(descs[0].free_blocks_count, free0 - 4);
        assert_eq!(descs[1].free_blocks_count, free1 - 4);

        let bb1_offset = descs[1].block_bitmap as usize * sb.block_size().as_usize();
        let bb1 = &image[bb1_offset..bb1_offset + sb.block_size().as_usize()];
        assert!(bitmap_get(bb1, 0));
        assert!(bitmap_get(bb1, 3));
    }

    #[test]
    fn finalize_writes_copies_and_totals() {
        let geom = test_geometry(4, 70_000);
        let mut sb = Superblock::new(&geom, b"", [0u8; 16], 0).unwrap();
        let mut image = vec![0u8; geom.partition_bytes as usize];
        let descs = init_groups(&mut image, &sb).unwrap();
        finalize(&mut image, &mut sb, &descs).unwrap();

        let expected_free: u64 = descs.iter().map(|d| u64::from(d.free_blocks_count)).sum();
        assert_eq!(sb.free_blocks_count, expected_free);

        // primary (4 KiB blocks: byte 1024) and both backups carry the magic
        assert_eq!(read_le_u16(&image, 1024 + 0x38).unwrap(), 0xEF53);
        for &backup in sb.backup_bgs.iter().filter(|&&g| g != 0) {
            let offset = sb.copy_offset(backup);
            assert_eq!(read_le_u16(&image, offset + 0x38).unwrap(), 0xEF53);
            assert_eq!(
                read_le_u16(&image, offset + 0x5A).unwrap(),
                backup as u16,
                "s_block_group_nr in backup"
            );
            // GDT follows in the next block
            let gdt = (sb.group_start_block(backup) as usize + 1) * 4096;
            let bb_lo = read_le_u32(&image, gdt).unwrap();
            assert_eq!(u64::from(bb_lo), descs[0].block_bitmap);
        }
    }
}
