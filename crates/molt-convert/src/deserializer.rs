//! Phase W: drain the stream archiver and build the ext4 tree.
//!
//! Consumption mirrors Phase R's emission exactly. For every directory the
//! builder forks the reader at the directory's extent run so the old FAT
//! clusters can serve as ext4 directory blocks, then walks the children:
//! inode, directory record, and either a recursive descent (directories)
//! or extent registration (files).

use molt_alloc::ExtentAllocator;
use molt_archive::StreamReader;
use molt_error::{MoltError, Result};
use molt_ext4::{
    add_inode, add_reserved_inode, last_extent, record_len, register_extent,
    write_full_block_entry, BlockExtent, DirBuilder, GroupDesc, Inode, InodeSlot, Superblock,
    EXT4_LOST_FOUND_INODE, EXT4_ROOT_INODE,
};
use molt_fat::{fat_datetime_to_unix, FatDentry, FatGeometry};
use molt_types::{align4, read_le_u16, write_le_u16, BlockNo, InodeNo};

use crate::records::{
    decode_extent, read_child_count, read_name, read_single_run, ExtentRunClusters,
    DENTRY_RECORD_SIZE, EXTENT_RECORD_SIZE, NAME_SLOT_SIZE, NO_CHILDREN,
};

/// What Phase W did, for the final report.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub inodes_written: u64,
    pub directory_blocks: u64,
}

pub struct TreeBuilder {
    owner_uid: u32,
    owner_gid: u32,
    now: u32,
    next_free_ino: InodeNo,
    stats: WriteStats,
}

impl TreeBuilder {
    #[must_use]
    pub fn new(owner_uid: u32, owner_gid: u32, now: u32) -> Self {
        Self {
            owner_uid,
            owner_gid,
            now,
            // 11 is lost+found; ordinary files start right after
            next_free_ino: EXT4_LOST_FOUND_INODE + 1,
            stats: WriteStats::default(),
        }
    }

    /// Build the whole ext4 tree from the archive starting at `head`.
    pub fn build(
        mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
        head: molt_types::ClusterNo,
    ) -> Result<WriteStats> {
        let root = Inode::new_dir(self.owner_uid, self.owner_gid, self.now);
        add_reserved_inode(image, sb, descs, EXT4_ROOT_INODE, &root)?;
        self.stats.inodes_written += 1;

        let mut reader = StreamReader::new(image, geom, head)?;
        // the pseudo-dentry and empty name of the root
        reader.skip_run(image, geom, DENTRY_RECORD_SIZE)?;
        reader.skip_run(image, geom, NAME_SLOT_SIZE)?;

        self.build_dir(
            image,
            geom,
            sb,
            descs,
            alloc,
            &mut reader,
            EXT4_ROOT_INODE,
            EXT4_ROOT_INODE,
        )?;
        self.build_lost_found(image, geom, sb, descs, alloc)?;

        tracing::info!(
            inodes = self.stats.inodes_written,
            dir_blocks = self.stats.directory_blocks,
            "ext4 tree built"
        );
        Ok(self.stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dir(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
        reader: &mut StreamReader,
        dir_ino: InodeNo,
        parent_ino: InodeNo,
    ) -> Result<()> {
        // Fork at the extent run: the directory's own clusters become its
        // ext4 directory blocks, topped up from the allocator.
        let mut clusters = ExtentRunClusters::new(reader.clone());
        let first_block = next_dir_block(image, geom, alloc, &mut clusters)?;
        reader.skip_run(image, geom, EXTENT_RECORD_SIZE)?;
        let child_count = read_child_count(reader, image, geom)?;

        let mut dir = DirBuilder::open(image, sb, dir_ino, parent_ino, first_block)?;

        for _ in 0..child_count {
            let dentry_bytes = read_single_run(reader, image, geom, DENTRY_RECORD_SIZE)?;
            let fat_dentry = FatDentry::parse(&dentry_bytes, 0)?;
            let name = read_name(reader, image, geom)?;

            let child_ino = self.next_free_ino;
            self.next_free_ino += 1;

            let inode = self.inode_from_fat(&fat_dentry);
            add_inode(image, sb, descs, child_ino, &inode)?;
            self.stats.inodes_written += 1;

            let name_bytes = name.as_bytes();
            let rec_len = record_len(name_bytes)?;
            if !dir.fits(sb, rec_len) {
                let block = next_dir_block(image, geom, alloc, &mut clusters)?;
                dir.start_new_block(image, geom, sb, descs, alloc, block)?;
            }
            dir.add_entry(image, sb, child_ino, name_bytes)?;

            if fat_dentry.is_dir() {
                // the child's ".." references us
                InodeSlot::locate(sb, descs, dir_ino)?.increment_links(image)?;
                self.build_dir(image, geom, sb, descs, alloc, reader, child_ino, dir_ino)?;
            } else {
                register_file_extents(image, geom, sb, descs, alloc, child_ino, reader)?;
                InodeSlot::locate(sb, descs, child_ino)?
                    .set_size(image, u64::from(fat_dentry.file_size))?;
                let marker = read_child_count(reader, image, geom)?;
                if marker != NO_CHILDREN {
                    return Err(MoltError::CorruptFat(
                        "file record carries a child count".into(),
                    ));
                }
            }
        }

        self.stats.directory_blocks +=
            u64::from(dir.close(image, geom, sb, descs, alloc)?);
        Ok(())
    }

    fn inode_from_fat(&self, dentry: &FatDentry) -> Inode {
        let atime = fat_datetime_to_unix(dentry.access_date, 0);
        let crtime = fat_datetime_to_unix(dentry.create_date, dentry.create_time);
        let mtime = fat_datetime_to_unix(dentry.mod_date, dentry.mod_time);
        if dentry.is_dir() {
            Inode::new_dir_with_times(self.owner_uid, self.owner_gid, atime, crtime, mtime)
        } else {
            Inode::new_file(self.owner_uid, self.owner_gid, atime, crtime, mtime, 1)
        }
    }

    /// Append `lost+found` to the root directory and seed it with a single
    /// block holding `.` and `..`. Owned by root, as mke2fs creates it.
    fn build_lost_found(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
    ) -> Result<()> {
        append_root_entry(image, geom, sb, descs, alloc, EXT4_LOST_FOUND_INODE, b"lost+found")?;
        InodeSlot::locate(sb, descs, EXT4_ROOT_INODE)?.increment_links(image)?;

        let inode = Inode::new_dir(0, 0, self.now);
        add_reserved_inode(image, sb, descs, EXT4_LOST_FOUND_INODE, &inode)?;
        self.stats.inodes_written += 1;

        let cluster = alloc.allocate(1)?.physical_start;
        let block = geom.cluster_to_block(cluster);
        let dir = DirBuilder::open(image, sb, EXT4_LOST_FOUND_INODE, EXT4_ROOT_INODE, block)?;
        self.stats.directory_blocks +=
            u64::from(dir.close(image, geom, sb, descs, alloc)?);
        Ok(())
    }
}

/// Next block for a directory: reuse the directory's original clusters
/// while they last, then fall back to the allocator.
fn next_dir_block(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
    clusters: &mut ExtentRunClusters,
) -> Result<BlockNo> {
    let cluster = match clusters.next_cluster(image, geom)? {
        Some(cluster) => cluster,
        None => alloc.allocate(1)?.physical_start,
    };
    Ok(geom.cluster_to_block(cluster))
}

/// Register a file's archived extents into its extent tree.
fn register_file_extents(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    descs: &mut [GroupDesc],
    alloc: &mut ExtentAllocator,
    ino: InodeNo,
    reader: &mut StreamReader,
) -> Result<()> {
    while let Some(bytes) = reader.next(image, geom, EXTENT_RECORD_SIZE)? {
        let extent = decode_extent(&bytes);
        register_extent(
            image,
            geom,
            sb,
            descs,
            alloc,
            ino,
            BlockExtent {
                logical: extent.logical_start,
                len: extent.length,
                start: geom.cluster_to_block(extent.physical_start),
            },
        )?;
    }
    Ok(())
}

/// Add one entry to the root directory's last block, splitting the final
/// record's slack when it fits or appending a fresh block otherwise.
fn append_root_entry(
    image: &mut [u8],
    geom: &FatGeometry,
    sb: &Superblock,
    descs: &mut [GroupDesc],
    alloc: &mut ExtentAllocator,
    ino: InodeNo,
    name: &[u8],
) -> Result<()> {
    let block_size = sb.block_size().as_usize();
    let last = last_extent(image, sb, descs, EXT4_ROOT_INODE)?
        .ok_or_else(|| MoltError::CorruptFat("root directory has no blocks".into()))?;
    let last_block = last.start + u64::from(last.len) - 1;
    let base = last_block as usize * block_size;

    // walk to the record whose rec_len reaches the block end
    let mut position = 0usize;
    loop {
        let rec_len = usize::from(read_le_u16(image, base + position + 4)?);
        if rec_len < 8 {
            return Err(MoltError::CorruptFat("directory record too short".into()));
        }
        if position + rec_len >= block_size {
            break;
        }
        position += rec_len;
    }

    let needed = usize::from(record_len(name)?);
    let name_len = read_le_u16(image, base + position + 6)?;
    let trimmed = align4(u32::from(name_len) + 8) as usize;
    let slack = block_size - position - trimmed;

    if slack >= needed {
        // shrink the final record and put the new entry in the slack
        write_le_u16(image, base + position + 4, trimmed as u16)?;
        let entry_offset = base + position + trimmed;
        let entry = molt_ext4::encode_dentry(ino, slack as u16, name);
        molt_types::write_bytes(image, entry_offset, &entry)?;
    } else {
        let cluster = alloc.allocate(1)?.physical_start;
        let block = geom.cluster_to_block(cluster);
        register_extent(
            image,
            geom,
            sb,
            descs,
            alloc,
            EXT4_ROOT_INODE,
            BlockExtent {
                logical: last.logical + u32::from(last.len),
                len: 1,
                start: block,
            },
        )?;
        write_full_block_entry(image, sb, block, ino, name)?;
        let slot = InodeSlot::locate(sb, descs, EXT4_ROOT_INODE)?;
        let size = slot.size(image)?;
        slot.set_size(image, size + block_size as u64)?;
    }
    Ok(())
}
