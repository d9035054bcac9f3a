//! Superblock geometry and serialization.

use molt_error::{MoltError, Result};
use molt_fat::FatGeometry;
use molt_types::{
    split_lo_hi_u64, write_bytes, write_le_u16, write_le_u32, BlockNo, BlockSize, ClusterExtent,
    GroupNo, FAT_START_INDEX,
};
use serde::Serialize;

use crate::{DESC_SIZE, EXT4_FIRST_NON_RSV_INODE, EXT4_LOST_FOUND_INODE, EXT4_MAGIC, INODE_RATIO,
    INODE_SIZE};

const FEATURE_COMPAT_SPARSE_SUPER2: u32 = 0x0200;
const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
const STATE_CLEANLY_UNMOUNTED: u16 = 0x0001;
const ERRORS_CONTINUE: u16 = 1;
const REV_DYNAMIC: u32 = 1;
/// Without bigalloc, groups still cap at 2^16 - 8 blocks.
const MAX_BLOCKS_PER_GROUP: u32 = (1 << 16) - 8;

/// The ext4 superblock, held as plain values and serialized on demand.
///
/// Free counts start at zero and are rolled up from the group descriptors
/// during finalization, so the superblock and descriptor totals share one
/// source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mkfs_time: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub backup_bgs: [u32; 2],
    block_size: BlockSize,
    group_count: u32,
}

impl Superblock {
    /// Compute the ext4 geometry for a FAT volume.
    ///
    /// `now` becomes `s_mkfs_time`/`s_wtime`; `uuid` should be freshly
    /// generated random bytes with the RFC 4122 version bits set. The FAT
    /// volume label carries over as the ext4 volume name.
    pub fn new(
        geom: &FatGeometry,
        volume_label: &[u8],
        uuid: [u8; 16],
        now: u32,
    ) -> Result<Self> {
        let block_size = geom.cluster_size;
        if block_size.get() > 32768 {
            // 64 KiB blocks would need the rec_len = 0xFFFF directory
            // convention, which this tool does not emit.
            return Err(MoltError::UnsupportedGeometry(
                "cluster sizes above 32 KiB are not supported".into(),
            ));
        }
        let blocks_count = geom.partition_bytes / u64::from(block_size.get());

        let first_data_block = u32::from(block_size.get() == 1024);
        let blocks_per_group = block_size.bits().min(MAX_BLOCKS_PER_GROUP);
        let group_bytes = u64::from(blocks_per_group) * u64::from(block_size.get());
        let inodes_per_group =
            ((group_bytes / u64::from(INODE_RATIO)) as u32).min(block_size.bits());

        let data_blocks = blocks_count - u64::from(first_data_block);
        let group_count = u32::try_from(data_blocks.div_ceil(u64::from(blocks_per_group)))
            .map_err(|_| {
                MoltError::UnsupportedGeometry("volume would need more than 2^32 block groups".into())
            })?;

        let mut backup_bgs = [0u32; 2];
        if group_count > 1 {
            backup_bgs[0] = 1;
            if group_count > 2 {
                backup_bgs[1] = group_count - 1;
            }
        }

        let inodes_count = inodes_per_group.checked_mul(group_count).ok_or_else(|| {
            MoltError::UnsupportedGeometry("volume would need more than 2^32 inodes".into())
        })?;
        if inodes_count <= EXT4_FIRST_NON_RSV_INODE {
            return Err(MoltError::UnsupportedGeometry(format!(
                "only {inodes_count} inodes fit; at least {} are reserved",
                EXT4_FIRST_NON_RSV_INODE + 1
            )));
        }

        let mut volume_name = [0u8; 16];
        let label_len = volume_label.len().min(volume_name.len());
        volume_name[..label_len].copy_from_slice(&volume_label[..label_len]);

        let sb = Self {
            inodes_count,
            blocks_count,
            free_blocks_count: 0,
            free_inodes_count: 0,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            mkfs_time: now,
            uuid,
            volume_name,
            backup_bgs,
            block_size,
            group_count,
        };

        // Every group must fit its own overhead in a 16-bit extent length
        // and leave room for the metadata it carries.
        for group_no in 0..group_count {
            let overhead = sb.group_overhead(group_no);
            if overhead > 0xFFFF {
                return Err(MoltError::OverheadTooLarge {
                    group: group_no,
                    overhead,
                });
            }
            if u64::from(overhead) > sb.group_block_count(group_no) {
                return Err(MoltError::UnsupportedGeometry(format!(
                    "block group {group_no} has {} blocks but needs {overhead} for metadata",
                    sb.group_block_count(group_no)
                )));
            }
        }

        tracing::debug!(
            blocks_count,
            group_count,
            blocks_per_group,
            inodes_per_group,
            "ext4 geometry computed"
        );

        Ok(sb)
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    /// Blocks occupied by one copy of the group descriptor table.
    #[must_use]
    pub fn gdt_block_count(&self) -> u32 {
        self.group_count.div_ceil(self.block_size.get() / DESC_SIZE)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_block_count(&self) -> u32 {
        (self.inodes_per_group * INODE_SIZE).div_ceil(self.block_size.get())
    }

    #[must_use]
    pub fn group_has_sb_copy(&self, group_no: GroupNo) -> bool {
        group_no == 0 || group_no == self.backup_bgs[0] || group_no == self.backup_bgs[1]
    }

    /// Metadata blocks at the start of a group: optional superblock copy +
    /// GDT, block bitmap, inode bitmap, and the inode table.
    #[must_use]
    pub fn overhead(&self, has_sb_copy: bool) -> u32 {
        let sb_copy = if has_sb_copy {
            1 + self.gdt_block_count()
        } else {
            0
        };
        sb_copy + 2 + self.inode_table_block_count()
    }

    #[must_use]
    pub fn group_overhead(&self, group_no: GroupNo) -> u32 {
        self.overhead(self.group_has_sb_copy(group_no))
    }

    /// First block of a group.
    #[must_use]
    pub fn group_start_block(&self, group_no: GroupNo) -> BlockNo {
        u64::from(self.blocks_per_group) * u64::from(group_no) + u64::from(self.first_data_block)
    }

    /// Blocks actually present in a group (the tail group may be short).
    #[must_use]
    pub fn group_block_count(&self, group_no: GroupNo) -> u64 {
        let start = self.group_start_block(group_no);
        u64::from(self.blocks_per_group).min(self.blocks_count - start)
    }

    /// Group containing `block_no`.
    #[must_use]
    pub fn group_of_block(&self, block_no: BlockNo) -> GroupNo {
        ((block_no - u64::from(self.first_data_block)) / u64::from(self.blocks_per_group)) as GroupNo
    }

    /// Inodes available to ordinary files (everything past the reserved
    /// range; `lost+found` takes the first of these).
    #[must_use]
    pub fn allocatable_inode_count(&self) -> u32 {
        self.inodes_count - EXT4_LOST_FOUND_INODE
    }

    /// The physical cluster ranges Phase R must not disturb: every group's
    /// metadata region clamped to the FAT data area, plus a one-cluster
    /// sentinel marking the end of the volume.
    #[must_use]
    pub fn blocked_cluster_ranges(&self, geom: &FatGeometry) -> Vec<ClusterExtent> {
        let mut blocked = Vec::with_capacity(self.group_count as usize + 1);
        for group_no in 0..self.group_count {
            let overhead = self.group_overhead(group_no);
            let start_block = self.group_start_block(group_no);
            let start_cluster = geom.block_to_cluster(start_block);

            if start_cluster != 0 {
                blocked.push(ClusterExtent::new(0, overhead as u16, start_cluster));
            } else {
                // The region begins inside the old FAT metadata area, which
                // holds no file payload; only the part that reaches into
                // data clusters needs blocking.
                let end_cluster = geom.block_to_cluster(start_block + u64::from(overhead));
                if end_cluster != 0 {
                    blocked.push(ClusterExtent::new(
                        0,
                        (end_cluster - FAT_START_INDEX) as u16,
                        FAT_START_INDEX,
                    ));
                }
            }
        }
        blocked.push(ClusterExtent::new(0, 1, geom.data_cluster_count));
        blocked
    }

    /// Byte offset of the primary superblock or of the copy in `group_no`.
    #[must_use]
    pub fn copy_offset(&self, group_no: GroupNo) -> usize {
        let group_byte =
            self.group_start_block(group_no) as usize * self.block_size.as_usize();
        if group_no == 0 && self.block_size.get() != 1024 {
            group_byte + 1024
        } else {
            group_byte
        }
    }

    /// Serialize this superblock into `image` at the copy position for
    /// `group_no` (`s_block_group_nr` distinguishes the copies).
    pub fn write_copy(&self, image: &mut [u8], group_no: GroupNo) -> Result<()> {
        let offset = self.copy_offset(group_no);
        let (blocks_lo, blocks_hi) = split_lo_hi_u64(self.blocks_count);
        let (free_blocks_lo, free_blocks_hi) = split_lo_hi_u64(self.free_blocks_count);

        // Zero the full 1024-byte record first; most fields stay zero.
        write_bytes(image, offset, &[0u8; 1024])?;

        write_le_u32(image, offset + 0x00, self.inodes_count)?;
        write_le_u32(image, offset + 0x04, blocks_lo)?;
        write_le_u32(image, offset + 0x0C, free_blocks_lo)?;
        write_le_u32(image, offset + 0x10, self.free_inodes_count)?;
        write_le_u32(image, offset + 0x14, self.first_data_block)?;
        write_le_u32(image, offset + 0x18, self.block_size.ext4_log())?;
        // log_cluster_size and clusters_per_group must mirror the block
        // fields even without bigalloc.
        write_le_u32(image, offset + 0x1C, self.block_size.ext4_log())?;
        write_le_u32(image, offset + 0x20, self.blocks_per_group)?;
        write_le_u32(image, offset + 0x24, self.blocks_per_group)?;
        write_le_u32(image, offset + 0x28, self.inodes_per_group)?;
        write_le_u32(image, offset + 0x30, self.mkfs_time)?; // s_wtime
        write_le_u16(image, offset + 0x36, u16::MAX)?; // s_max_mnt_count
        write_le_u16(image, offset + 0x38, EXT4_MAGIC)?;
        write_le_u16(image, offset + 0x3A, STATE_CLEANLY_UNMOUNTED)?;
        write_le_u16(image, offset + 0x3C, ERRORS_CONTINUE)?;
        write_le_u32(image, offset + 0x4C, REV_DYNAMIC)?;
        write_le_u32(image, offset + 0x54, EXT4_FIRST_NON_RSV_INODE)?;
        write_le_u16(image, offset + 0x58, INODE_SIZE as u16)?;
        write_le_u16(image, offset + 0x5A, group_no as u16)?; // s_block_group_nr
        write_le_u32(image, offset + 0x5C, FEATURE_COMPAT_SPARSE_SUPER2)?;
        write_le_u32(
            image,
            offset + 0x60,
            FEATURE_INCOMPAT_EXTENTS | FEATURE_INCOMPAT_64BIT,
        )?;
        write_bytes(image, offset + 0x68, &self.uuid)?;
        write_bytes(image, offset + 0x78, &self.volume_name)?;
        write_le_u16(image, offset + 0xFE, DESC_SIZE as u16)?;
        write_le_u32(image, offset + 0x108, self.mkfs_time)?;
        write_le_u32(image, offset + 0x150, blocks_hi)?;
        write_le_u32(image, offset + 0x158, free_blocks_hi)?;
        write_le_u32(image, offset + 0x24C, self.backup_bgs[0])?;
        write_le_u32(image, offset + 0x250, self.backup_bgs[1])?;
        write_le_u32(image, offset + 0x268, EXT4_LOST_FOUND_INODE)?; // s_lpf_ino
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
