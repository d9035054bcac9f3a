#![forbid(unsafe_code)]
//! Cluster allocation for the conversion pipeline.
//!
//! The allocator hands out free FAT clusters for relocated payload, stream
//! archiver pages, extent-tree nodes, and extra directory blocks. It honors
//! two exclusion sets: clusters already used by live FAT files (found by
//! scanning the FAT once at startup), and the *blocked set*: the sorted
//! physical ranges that ext4 block-group metadata will occupy, terminated
//! by a one-cluster sentinel at the end of the data area.
//!
//! Allocation is monotone: a single cursor sweeps the FAT once and never
//! returns. Exhaustion is fatal for the conversion, which has no recovery
//! path once the sweep runs past the sentinel.

use molt_error::{MoltError, Result};
use molt_fat::{is_free_cluster, FatGeometry};
use molt_types::{bitmap_get, bitmap_set, ClusterExtent, ClusterNo, FAT_START_INDEX};

pub struct ExtentAllocator {
    cursor: ClusterNo,
    /// One bit per cluster, set = not available.
    bitmap: Vec<u8>,
    /// Sorted by `physical_start`; the last entry is the end-of-volume
    /// sentinel.
    blocked: Vec<ClusterExtent>,
    blocked_idx: usize,
    data_cluster_count: ClusterNo,
}

impl ExtentAllocator {
    /// Scan the FAT in `image` and build the allocator state.
    ///
    /// `blocked` must contain the per-group metadata extents plus the
    /// end-of-volume sentinel (length 1 at `data_cluster_count`); it is
    /// sorted here.
    pub fn new(image: &[u8], geom: &FatGeometry, mut blocked: Vec<ClusterExtent>) -> Result<Self> {
        let mut bitmap = vec![0u8; (geom.data_cluster_count as usize).div_ceil(8)];
        for cluster_no in 0..FAT_START_INDEX {
            bitmap_set(&mut bitmap, cluster_no);
        }
        for cluster_no in FAT_START_INDEX..geom.data_cluster_count {
            if !is_free_cluster(geom.fat_entry(image, cluster_no)?) {
                bitmap_set(&mut bitmap, cluster_no);
            }
        }

        blocked.sort_by_key(|extent| extent.physical_start);
        debug_assert_eq!(
            blocked.last().map(|extent| extent.physical_start),
            Some(geom.data_cluster_count),
            "blocked set must end with the end-of-volume sentinel"
        );

        Ok(Self {
            cursor: 0,
            bitmap,
            blocked,
            blocked_idx: 0,
            data_cluster_count: geom.data_cluster_count,
        })
    }

    /// Position the cursor on the next cluster outside every blocked range
    /// and report whether that cluster is free. The cursor is left on the
    /// examined cluster either way.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(blocked) = self.blocked.get(self.blocked_idx) else {
                // The end-of-volume sentinel has been consumed: the sweep
                // ran off the data area.
                tracing::warn!("cluster sweep exhausted the data area");
                return Err(MoltError::NoSpace);
            };
            if self.cursor < blocked.physical_start {
                return Ok(!bitmap_get(&self.bitmap, self.cursor));
            }
            self.cursor = self.cursor.max(blocked.physical_end());
            self.blocked_idx += 1;
        }
    }

    /// Reserve a free extent of at most `max_length` clusters.
    ///
    /// The returned extent has `logical_start == 0`; callers re-settle the
    /// logical position themselves. Growth stops at the first used cluster,
    /// at a blocked range, or at `max_length`.
    pub fn allocate(&mut self, max_length: u16) -> Result<ClusterExtent> {
        assert!(max_length > 0, "cannot allocate an empty extent");

        loop {
            if self.advance()? {
                break;
            }
            self.cursor += 1;
        }

        let start = self.cursor;
        bitmap_set(&mut self.bitmap, start);
        let mut length: u16 = 1;
        self.cursor += 1;

        while length < max_length {
            match self.advance() {
                Ok(true) if self.cursor == start + u32::from(length) => {
                    bitmap_set(&mut self.bitmap, self.cursor);
                    length += 1;
                    self.cursor += 1;
                }
                // A used cluster, a jump over a blocked range, or the end
                // of the volume all end the run; what we have is valid.
                Ok(_) | Err(_) => break,
            }
        }

        Ok(ClusterExtent::new(0, length, start))
    }

    /// Index of the first blocked metadata extent that ends at or after
    /// `physical`. The sentinel is not part of the searched range.
    #[must_use]
    pub fn first_blocked_index(&self, physical: ClusterNo) -> usize {
        let meta = self.blocked_meta();
        let mut begin = 0;
        let mut end = meta.len();
        while begin < end {
            let mid = (begin + end) / 2;
            if meta[mid].physical_end() < physical {
                begin = mid + 1;
            } else {
                end = mid;
            }
        }
        begin
    }

    /// Walk the blocked metadata extents overlapping a range that ends at
    /// `physical_end`. Advances `idx`; returns `None` once the remaining
    /// extents start past the range.
    #[must_use]
    pub fn next_blocked(&self, idx: &mut usize, physical_end: ClusterNo) -> Option<ClusterExtent> {
        let meta = self.blocked_meta();
        let extent = *meta.get(*idx)?;
        *idx += 1;
        if physical_end < extent.physical_start {
            None
        } else {
            Some(extent)
        }
    }

    /// Clusters that are neither FAT-used, already allocated, nor blocked.
    /// Used by the pre-flight resource check between the two phases.
    #[must_use]
    pub fn free_cluster_count(&self) -> u64 {
        let mut free = 0u64;
        let mut blocked_iter = self.blocked.iter().peekable();
        for cluster_no in FAT_START_INDEX..self.data_cluster_count {
            while let Some(blocked) = blocked_iter.peek() {
                if blocked.physical_end() <= cluster_no {
                    blocked_iter.next();
                } else {
                    break;
                }
            }
            let in_blocked = blocked_iter
                .peek()
                .is_some_and(|blocked| cluster_no >= blocked.physical_start);
            if !in_blocked && !bitmap_get(&self.bitmap, cluster_no) {
                free += 1;
            }
        }
        free
    }

    /// Whether `cluster_no` is marked used (live FAT data or allocated).
    #[must_use]
    pub fn is_used(&self, cluster_no: ClusterNo) -> bool {
        bitmap_get(&self.bitmap, cluster_no)
    }

    fn blocked_meta(&self) -> &[ClusterExtent] {
        &self.blocked[..self.blocked.len() - 1]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use molt_types::BlockSize;

    const CLUSTER_SIZE: usize = 1024;
    const DATA_CLUSTERS: u32 = 34; // clusters 2..34 exist

    fn test_geometry() -> FatGeometry {
        FatGeometry {
            cluster_size: BlockSize::new(1024).unwrap(),
            fat_start_byte: 1024,
            data_start_byte: 4096,
            sectors_before_data: 8,
            sectors_per_cluster: 2,
            data_cluster_count: DATA_CLUSTERS,
            dentries_per_cluster: 32,
            root_cluster_no: 2,
            partition_bytes: 4096 + (DATA_CLUSTERS as u64 - 2) * 1024,
        }
    }

    /// An image whose FAT marks `used` clusters as end-of-chain.
    fn test_image(used: &[u32]) -> Vec<u8> {
        let geom = test_geometry();
        let mut image = vec![0u8; geom.data_start_byte + (DATA_CLUSTERS as usize - 2) * CLUSTER_SIZE];
        for &cluster_no in used {
            let offset = geom.fat_start_byte + cluster_no as usize * 4;
            image[offset..offset + 4].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }
        image
    }

    fn sentinel() -> ClusterExtent {
        ClusterExtent::new(0, 1, DATA_CLUSTERS)
    }

    #[test]
    fn allocates_from_first_free_cluster() {
        let geom = test_geometry();
        let image = test_image(&[2, 3]);
        let mut alloc = ExtentAllocator::new(&image, &geom, vec![sentinel()]).unwrap();

        let extent = alloc.allocate(4).unwrap();
        assert_eq!(extent.physical_start, 4);
        assert_eq!(extent.length, 4);
        assert_eq!(extent.logical_start, 0);
    }

    #[test]
    fn run_stops_at_used_cluster() {
        let geom = test_geometry();
        let image = test_image(&[2, 6]);
        let mut alloc = ExtentAllocator::new(&image, &geom, vec![sentinel()]).unwrap();

        let extent = alloc.allocate(10).unwrap();
        assert_eq!(extent.physical_start, 3);
        assert_eq!(extent.length, 3); // 3, 4, 5; stops before used 6

        let next = alloc.allocate(10).unwrap();
        assert_eq!(next.physical_start, 7);
    }

    #[test]
    fn skips_blocked_ranges() {
        let geom = test_geometry();
        let image = test_image(&[]);
        let blocked = vec![ClusterExtent::new(0, 6, 2), sentinel()];
        let mut alloc = ExtentAllocator::new(&image, &geom, blocked).unwrap();

        let extent = alloc.allocate(3).unwrap();
        assert_eq!(extent.physical_start, 8);
        assert_eq!(extent.length, 3);
    }

    #[test]
    fn run_does_not_bridge_a_blocked_range() {
        let geom = test_geometry();
        let image = test_image(&[]);
        let blocked = vec![ClusterExtent::new(0, 2, 5), sentinel()];
        let mut alloc = ExtentAllocator::new(&image, &geom, blocked).unwrap();

        let extent = alloc.allocate(10).unwrap();
        assert_eq!(extent.physical_start, 2);
        assert_eq!(extent.length, 3); // 2, 3, 4

        // the cluster right after the blocked range is not lost
        let next = alloc.allocate(10).unwrap();
        assert_eq!(next.physical_start, 7);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let geom = test_geometry();
        let image = test_image(&[]);
        let mut alloc = ExtentAllocator::new(&image, &geom, vec![sentinel()]).unwrap();

        let extent = alloc.allocate(u16::MAX).unwrap();
        assert_eq!(u32::from(extent.length), DATA_CLUSTERS - 2);
        assert!(matches!(alloc.allocate(1), Err(MoltError::NoSpace)));
    }

    #[test]
    fn allocated_clusters_never_reappear() {
        let geom = test_geometry();
        let image = test_image(&[]);
        let mut alloc = ExtentAllocator::new(&image, &geom, vec![sentinel()]).unwrap();

        let mut seen = Vec::new();
        while let Ok(extent) = alloc.allocate(3) {
            for cluster_no in extent.physical_start..extent.physical_end() {
                assert!(!seen.contains(&cluster_no));
                seen.push(cluster_no);
            }
        }
        assert_eq!(seen.len(), (DATA_CLUSTERS - 2) as usize);
    }

    #[test]
    fn blocked_queries_enumerate_overlaps() {
        let geom = test_geometry();
        let image = test_image(&[]);
        let blocked = vec![
            ClusterExtent::new(0, 2, 4),
            ClusterExtent::new(0, 3, 10),
            ClusterExtent::new(0, 1, 20),
            sentinel(),
        ];
        let alloc = ExtentAllocator::new(&image, &geom, blocked).unwrap();

        // range [5, 15): overlaps the tail of [4,6) and all of [10,13)
        let mut idx = alloc.first_blocked_index(5);
        let mut hits = Vec::new();
        while let Some(extent) = alloc.next_blocked(&mut idx, 15) {
            hits.push(extent.physical_start);
        }
        assert_eq!(hits, vec![4, 10]);

        // a range beyond every metadata extent sees none
        let mut idx = alloc.first_blocked_index(25);
        assert!(alloc.next_blocked(&mut idx, 30).is_none());
    }

    #[test]
    fn free_count_excludes_used_and_blocked() {
        let geom = test_geometry();
        let image = test_image(&[2, 3]);
        let blocked = vec![ClusterExtent::new(0, 4, 10), sentinel()];
        let alloc = ExtentAllocator::new(&image, &geom, blocked).unwrap();

        // 32 data clusters, minus 2 used, minus 4 blocked
        assert_eq!(alloc.free_cluster_count(), 26);
    }
}
