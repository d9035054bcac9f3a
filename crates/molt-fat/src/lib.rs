#![forbid(unsafe_code)]
//! Read-side view of a FAT32 volume.
//!
//! Interprets the boot sector, the file allocation table, cluster chains,
//! and 8.3 / long-filename directory entries over a borrowed byte image.
//! Nothing here mutates the volume; the conversion pipeline only reads FAT
//! structures through this crate and then overwrites them from the ext4
//! side.

mod boot;
mod dentry;
mod time;

pub use boot::BootSector;
pub use dentry::{classify_slot, FatDentry, LfnFragment, SlotKind, DENTRY_SIZE, LFN_UNITS};
pub use time::fat_datetime_to_unix;

use molt_error::{MoltError, Result};
use molt_types::{read_le_u32, BlockNo, BlockSize, ClusterNo, FAT_START_INDEX};

// ── FAT table constants ─────────────────────────────────────────────────────

/// Only the low 28 bits of a FAT32 entry address a cluster.
pub const CLUSTER_ENTRY_MASK: u32 = 0x0FFF_FFFF;
/// A zero entry marks a free cluster.
pub const FREE_CLUSTER: u32 = 0;
/// Entries at or above this value terminate a cluster chain.
pub const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFF8;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Derived constants of a FAT32 volume, computed once from the boot sector.
///
/// The conversion requires the data region to be cluster-aligned relative to
/// the partition start, so that FAT clusters and ext4 blocks coincide; the
/// constructor rejects anything else.
#[derive(Debug, Clone)]
pub struct FatGeometry {
    /// Cluster size in bytes; equals the ext4 block size.
    pub cluster_size: BlockSize,
    /// Byte offset of the first (active) FAT table.
    pub fat_start_byte: usize,
    /// Byte offset of the data region (cluster 2).
    pub data_start_byte: usize,
    /// Sectors before the data region (reserved + all FAT copies).
    pub sectors_before_data: u32,
    /// Sectors per cluster, kept for the cluster/block offset.
    pub sectors_per_cluster: u32,
    /// One past the highest addressable data cluster.
    pub data_cluster_count: ClusterNo,
    /// 32-byte directory entries per cluster.
    pub dentries_per_cluster: u32,
    /// First cluster of the root directory.
    pub root_cluster_no: ClusterNo,
    /// Total partition size in bytes.
    pub partition_bytes: u64,
}

impl FatGeometry {
    pub fn new(boot: &BootSector) -> Result<Self> {
        let cluster_size = BlockSize::new(
            u32::from(boot.bytes_per_sector) * u32::from(boot.sectors_per_cluster),
        )
        .map_err(|_| {
            MoltError::UnsupportedGeometry(format!(
                "cluster size {} is not a power of two in 1 KiB..=64 KiB",
                u32::from(boot.bytes_per_sector) * u32::from(boot.sectors_per_cluster)
            ))
        })?;

        let sectors_before_data =
            u32::from(boot.sectors_before_fat) + boot.sectors_per_fat * u32::from(boot.fat_count);
        let sectors_per_cluster = u32::from(boot.sectors_per_cluster);
        if sectors_before_data % sectors_per_cluster != 0 {
            return Err(MoltError::UnsupportedGeometry(
                "the FAT data region is not cluster-aligned; cannot convert in place".into(),
            ));
        }

        let sector_count = boot.sector_count();
        if sector_count <= sectors_before_data {
            return Err(MoltError::CorruptFat(
                "partition ends before the data region starts".into(),
            ));
        }

        let data_cluster_count =
            (sector_count - sectors_before_data) / sectors_per_cluster + FAT_START_INDEX;
        let bytes_per_sector = usize::from(boot.bytes_per_sector);

        tracing::debug!(
            cluster_size = cluster_size.get(),
            data_cluster_count,
            sectors_before_data,
            "FAT geometry accepted"
        );

        Ok(Self {
            cluster_size,
            fat_start_byte: usize::from(boot.sectors_before_fat) * bytes_per_sector,
            data_start_byte: sectors_before_data as usize * bytes_per_sector,
            sectors_before_data,
            sectors_per_cluster,
            data_cluster_count,
            dentries_per_cluster: cluster_size.get() / DENTRY_SIZE as u32,
            root_cluster_no: boot.root_cluster_no,
            partition_bytes: u64::from(boot.bytes_per_sector) * u64::from(sector_count),
        })
    }

    /// Clusters occupied by the region before the data area (boot sector,
    /// reserved sectors, FAT copies). This is also the ext4 block number of
    /// FAT cluster 2.
    #[must_use]
    pub fn clusters_before_data(&self) -> u32 {
        self.sectors_before_data / self.sectors_per_cluster
    }

    /// Map a FAT cluster number to the ext4 block occupying the same bytes.
    #[must_use]
    pub fn cluster_to_block(&self, cluster_no: ClusterNo) -> BlockNo {
        u64::from(cluster_no - FAT_START_INDEX) + u64::from(self.clusters_before_data())
    }

    /// Map an ext4 block number back to a FAT cluster number. Returns 0 for
    /// blocks that lie before the first data cluster.
    #[must_use]
    pub fn block_to_cluster(&self, block_no: BlockNo) -> ClusterNo {
        let cluster = block_no as i64 + i64::from(FAT_START_INDEX)
            - i64::from(self.clusters_before_data());
        if cluster < i64::from(FAT_START_INDEX) {
            0
        } else {
            cluster as ClusterNo
        }
    }

    /// Byte offset of the start of a data cluster.
    #[must_use]
    pub fn cluster_start_byte(&self, cluster_no: ClusterNo) -> usize {
        self.data_start_byte
            + (cluster_no - FAT_START_INDEX) as usize * self.cluster_size.as_usize()
    }

    /// Read the FAT entry for `cluster_no`, masked to its 28 valid bits.
    pub fn fat_entry(&self, image: &[u8], cluster_no: ClusterNo) -> Result<u32> {
        let offset = self.fat_start_byte + cluster_no as usize * 4;
        Ok(read_le_u32(image, offset)? & CLUSTER_ENTRY_MASK)
    }

    /// Walk one step along a cluster chain. `None` marks end of chain.
    pub fn next_in_chain(&self, image: &[u8], cluster_no: ClusterNo) -> Result<Option<ClusterNo>> {
        let entry = self.fat_entry(image, cluster_no)?;
        if entry >= FAT_END_OF_CHAIN {
            Ok(None)
        } else if entry < FAT_START_INDEX || entry >= self.data_cluster_count {
            Err(MoltError::CorruptFat(format!(
                "cluster chain at {cluster_no} points to invalid cluster {entry}"
            )))
        } else {
            Ok(Some(entry))
        }
    }
}

/// True if this FAT entry marks a free cluster.
#[must_use]
pub fn is_free_cluster(entry: u32) -> bool {
    entry == FREE_CLUSTER
}

// ── Tests ───────────────────────────────────────────────────────────────────
