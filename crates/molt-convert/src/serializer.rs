//! Phase R: walk the FAT directory tree and serialize it into the stream
//! archiver, relocating payload clusters that collide with the future ext4
//! metadata footprint.
//!
//! Emission order per entry: the 32-byte dentry (cut), the name as UCS-2
//! slots (cut), the file's cluster extents after re-settling (cut), and
//! either a child count for directories or the `NO_CHILDREN` marker for
//! files (cut). Directories are followed immediately by their children,
//! pre-order. The root is emitted first as a pseudo-dentry with an empty
//! name.

use molt_alloc::ExtentAllocator;
use molt_archive::{patch_slot, StreamReader, StreamWriter};
use molt_error::{MoltError, Result};
use molt_fat::{classify_slot, FatDentry, FatGeometry, LfnFragment, SlotKind, DENTRY_SIZE};
use molt_types::{ClusterExtent, ClusterNo};

use crate::records::{
    encode_extent, encode_name_slot, ExtentRunClusters, CHILD_COUNT_SIZE, NO_CHILDREN,
};
use molt_ext4::EXT4_MAX_INIT_EXTENT_LEN;

/// What Phase R did, for the final report.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadStats {
    pub files: u64,
    pub directories: u64,
    pub relocated_clusters: u64,
}

/// Serialize the whole tree rooted at the FAT root directory.
pub fn serialize_fat_tree(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
) -> Result<ReadStats> {
    let mut stats = ReadStats::default();

    // The root is written as if it were a child entry: zeroed dentry with
    // the directory bit, an empty name run, then its extents.
    let mut root_dentry = [0u8; DENTRY_SIZE];
    root_dentry[0x0B] = 0x10;
    writer.push(image, geom, alloc, &root_dentry)?;
    writer.cut(image, geom, alloc)?;
    writer.cut(image, geom, alloc)?;

    let root_extents = writer.run_start();
    aggregate_extents(image, geom, alloc, writer, geom.root_cluster_no, &mut stats)?;

    let dir_reader = StreamReader::resume(image, geom, root_extents)?;
    traverse(image, geom, alloc, writer, dir_reader, &mut stats)?;

    tracing::info!(
        files = stats.files,
        directories = stats.directories,
        relocated = stats.relocated_clusters,
        "FAT tree serialized"
    );
    Ok(stats)
}

/// Walks the 32-byte slots of a directory whose clusters come from an
/// archived extent run.
struct DentryCursor {
    clusters: ExtentRunClusters,
    current_cluster: Option<ClusterNo>,
    slot_index: u32,
}

impl DentryCursor {
    fn new(reader: StreamReader) -> Self {
        Self {
            clusters: ExtentRunClusters::new(reader),
            current_cluster: None,
            slot_index: u32::MAX, // force a cluster load on first use
        }
    }

    /// Byte offset of the next live slot: a real dentry or an LFN
    /// fragment. Deleted entries, dot entries, and the volume label are
    /// skipped; `None` means end of directory.
    fn next_slot(&mut self, image: &[u8], geom: &FatGeometry) -> Result<Option<usize>> {
        loop {
            if self.current_cluster.is_none() || self.slot_index >= geom.dentries_per_cluster {
                self.current_cluster = self.clusters.next_cluster(image, geom)?;
                self.slot_index = 0;
                if self.current_cluster.is_none() {
                    return Ok(None);
                }
            }
            let cluster = self.current_cluster.unwrap_or_default();
            let offset =
                geom.cluster_start_byte(cluster) + self.slot_index as usize * DENTRY_SIZE;
            self.slot_index += 1;

            match classify_slot(image, offset)? {
                SlotKind::TableEnd => return Ok(None),
                SlotKind::Deleted => {}
                SlotKind::Lfn => return Ok(Some(offset)),
                SlotKind::Dentry => {
                    let dentry = FatDentry::parse(image, offset)?;
                    if !dentry.is_dot_dir() && !dentry.is_volume_label() {
                        return Ok(Some(offset));
                    }
                }
            }
        }
    }
}

/// Serialize the children of one directory: a child-count run (back-filled
/// once the walk finishes) followed by each child's records.
fn traverse(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
    dir_reader: StreamReader,
    stats: &mut ReadStats,
) -> Result<()> {
    let count_pos = writer.push(image, geom, alloc, &[0u8; CHILD_COUNT_SIZE])?;
    writer.cut(image, geom, alloc)?;

    let mut cursor = DentryCursor::new(dir_reader);
    let mut child_count: u32 = 0;

    while let Some(slot_offset) = cursor.next_slot(image, geom)? {
        let dentry = serialize_entry(image, geom, alloc, writer, &mut cursor, slot_offset)?;

        let extents_pos = writer.run_start();
        aggregate_extents(image, geom, alloc, writer, dentry.first_cluster_no(), stats)?;

        if dentry.is_dir() {
            stats.directories += 1;
            let child_reader = StreamReader::resume(image, geom, extents_pos)?;
            traverse(image, geom, alloc, writer, child_reader, stats)?;
        } else {
            stats.files += 1;
            writer.push(image, geom, alloc, &NO_CHILDREN.to_le_bytes())?;
            writer.cut(image, geom, alloc)?;
        }
        child_count += 1;
    }

    patch_slot(image, geom, count_pos, &child_count.to_le_bytes())?;
    Ok(())
}

/// Emit one child's dentry and name runs. Consumes the LFN fragments in
/// front of the real dentry when present; otherwise decodes the 8.3 name.
/// Returns the parsed real dentry.
fn serialize_entry(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
    cursor: &mut DentryCursor,
    first_slot: usize,
) -> Result<FatDentry> {
    if classify_slot(image, first_slot)? != SlotKind::Lfn {
        let dentry = FatDentry::parse(image, first_slot)?;
        writer.push(image, geom, alloc, &dentry.to_bytes())?;
        writer.cut(image, geom, alloc)?;
        writer.push(image, geom, alloc, &encode_name_slot(&dentry.short_name_ucs2()))?;
        writer.cut(image, geom, alloc)?;
        return Ok(dentry);
    }

    // Fragments are stored last-first: the slot at hand carries the
    // sequence count, the following ones count down to 1.
    let header = LfnFragment::parse(image, first_slot)?;
    let fragment_count = usize::from(header.sequence_no());
    if fragment_count == 0 {
        return Err(MoltError::CorruptFat(
            "long-name fragment with sequence number 0".into(),
        ));
    }
    let mut slots = vec![[0u16; 13]; fragment_count];
    slots[fragment_count - 1] = header.units();
    for index in (0..fragment_count - 1).rev() {
        let slot = cursor
            .next_slot(image, geom)?
            .ok_or_else(|| MoltError::CorruptFat("directory ends inside a long name".into()))?;
        if classify_slot(image, slot)? != SlotKind::Lfn {
            return Err(MoltError::CorruptFat(
                "long name interrupted by a short entry".into(),
            ));
        }
        slots[index] = LfnFragment::parse(image, slot)?.units();
    }

    let dentry_slot = cursor
        .next_slot(image, geom)?
        .ok_or_else(|| MoltError::CorruptFat("long name without a following entry".into()))?;
    let dentry = FatDentry::parse(image, dentry_slot)?;

    writer.push(image, geom, alloc, &dentry.to_bytes())?;
    writer.cut(image, geom, alloc)?;
    for units in &slots {
        writer.push(image, geom, alloc, &encode_name_slot(units))?;
    }
    writer.cut(image, geom, alloc)?;
    Ok(dentry)
}

/// Coalesce a cluster chain into extents, split them around blocked
/// ranges, and emit them (relocating blocked fragments). Ends with a cut.
fn aggregate_extents(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
    first_cluster: ClusterNo,
    stats: &mut ReadStats,
) -> Result<()> {
    if first_cluster != 0 {
        let mut current = ClusterExtent::new(0, 1, first_cluster);
        let mut cluster_no = first_cluster;
        loop {
            let next = geom.next_in_chain(image, cluster_no)?;
            let is_consecutive = next == Some(current.physical_end());
            let at_max = current.length == EXT4_MAX_INIT_EXTENT_LEN;
            if next.is_none() || !is_consecutive || at_max {
                emit_fragments(image, geom, alloc, writer, current, stats)?;
                match next {
                    Some(next_cluster) => {
                        current = ClusterExtent::new(
                            current.logical_start + u32::from(current.length),
                            1,
                            next_cluster,
                        );
                    }
                    None => break,
                }
            } else {
                current.length += 1;
            }
            cluster_no = next.unwrap_or_default();
        }
    }
    writer.cut(image, geom, alloc)
}

/// Split one physical extent at the blocked-range boundaries, emitting
/// untouched fragments verbatim and relocating the blocked ones.
fn emit_fragments(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
    input: ClusterExtent,
    stats: &mut ReadStats,
) -> Result<()> {
    let input_end = input.physical_end();
    let mut fragment_start = input.physical_start;
    let mut blocked_idx = alloc.first_blocked_index(input.physical_start);
    let mut blocked = alloc.next_blocked(&mut blocked_idx, input_end);

    while fragment_start < input_end {
        let mut fragment_end = input_end;
        let mut is_blocked = false;
        match blocked {
            Some(b) if b.physical_start <= fragment_start => {
                is_blocked = true;
                if b.physical_end() < fragment_end {
                    fragment_end = b.physical_end();
                }
                blocked = alloc.next_blocked(&mut blocked_idx, input_end);
            }
            Some(b) => fragment_end = b.physical_start,
            None => {}
        }

        let fragment = ClusterExtent::new(
            input.logical_start + (fragment_start - input.physical_start),
            (fragment_end - fragment_start) as u16,
            fragment_start,
        );
        fragment_start = fragment_end;

        if is_blocked {
            resettle(image, geom, alloc, writer, fragment, stats)?;
        } else {
            writer.push(image, geom, alloc, &encode_extent(&fragment))?;
        }
    }
    Ok(())
}

/// Copy a blocked fragment's payload to freshly allocated clusters,
/// emitting one extent per allocation.
fn resettle(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    writer: &mut StreamWriter,
    fragment: ClusterExtent,
    stats: &mut ReadStats,
) -> Result<()> {
    let cluster_size = geom.cluster_size.as_usize();
    let mut copied: u16 = 0;
    while copied < fragment.length {
        let mut replacement = alloc.allocate(fragment.length - copied)?;
        replacement.logical_start = fragment.logical_start + u32::from(copied);

        let src = geom.cluster_start_byte(fragment.physical_start + u32::from(copied));
        let dst = geom.cluster_start_byte(replacement.physical_start);
        let len = usize::from(replacement.length) * cluster_size;
        image.copy_within(src..src + len, dst);

        tracing::debug!(
            from = fragment.physical_start + u32::from(copied),
            to = replacement.physical_start,
            clusters = replacement.length,
            "re-settled payload"
        );
        stats.relocated_clusters += u64::from(replacement.length);
        writer.push(image, geom, alloc, &encode_extent(&replacement))?;
        copied += replacement.length;
    }
    Ok(())
}
