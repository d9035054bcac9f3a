//! 256-byte inode records.
//!
//! An [`Inode`] is assembled in memory and serialized once into the inode
//! table; afterwards the builders touch individual fields in place through
//! an [`InodeSlot`], mirroring how the directory and extent writers grow
//! sizes, link counts, and block usage incrementally.

use molt_error::Result;
use molt_types::{
    join_lo_hi_u48, join_lo_hi_u64, read_le_u16, read_le_u32, split_lo_hi_u32, split_lo_hi_u64,
    write_bytes, write_le_u16, write_le_u32, InodeNo,
};

use crate::group::{inode_record_offset, GroupDesc};
use crate::sb::Superblock;
use crate::{EXTENT_MAGIC, INODE_SIZE};

pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;

/// `i_flags` bit: this inode uses extents.
const EXTENTS_FL: u32 = 0x0008_0000;
/// Bytes of extended fields past the base 128, making `i_crtime` live.
const EXTRA_ISIZE: u16 = 32;
/// Capacity of the extent-tree root embedded in `i_block`.
pub(crate) const ROOT_EXTENT_CAPACITY: u16 = 4;

/// An inode about to be written.
#[derive(Debug, Clone)]
pub struct Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub links_count: u16,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub crtime: u32,
}

impl Inode {
    /// A directory inode. Link count starts at 2 (its own `.` plus the
    /// parent's entry); the parent gains a link for `..` when the child is
    /// attached.
    #[must_use]
    pub fn new_dir(uid: u32, gid: u32, now: u32) -> Self {
        Self {
            mode: 0o755 | S_IFDIR,
            uid,
            gid,
            links_count: 2,
            atime: now,
            ctime: now,
            mtime: now,
            crtime: now,
        }
    }

    /// A regular-file inode with timestamps from the FAT entry. The Linux
    /// FAT driver reports ctime as mtime + 1, and keeping that here makes
    /// before/after listings agree.
    #[must_use]
    pub fn new_file(uid: u32, gid: u32, atime: u32, crtime: u32, mtime: u32, links: u16) -> Self {
        Self {
            mode: 0o755 | S_IFREG,
            uid,
            gid,
            links_count: links,
            atime,
            ctime: mtime.wrapping_add(1),
            mtime,
            crtime,
        }
    }

    /// A directory inode carrying FAT timestamps.
    #[must_use]
    pub fn new_dir_with_times(uid: u32, gid: u32, atime: u32, crtime: u32, mtime: u32) -> Self {
        Self {
            mode: 0o755 | S_IFDIR,
            uid,
            gid,
            links_count: 2,
            atime,
            ctime: mtime.wrapping_add(1),
            mtime,
            crtime,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    /// Write the full 256-byte record at `offset`, including an empty
    /// extent-tree root in `i_block`.
    pub fn serialize_into(&self, image: &mut [u8], offset: usize) -> Result<()> {
        let (uid_lo, uid_hi) = split_lo_hi_u32(self.uid);
        let (gid_lo, gid_hi) = split_lo_hi_u32(self.gid);

        write_bytes(image, offset, &[0u8; INODE_SIZE as usize])?;
        write_le_u16(image, offset + 0x00, self.mode)?;
        write_le_u16(image, offset + 0x02, uid_lo)?;
        write_le_u32(image, offset + 0x08, self.atime)?;
        write_le_u32(image, offset + 0x0C, self.ctime)?;
        write_le_u32(image, offset + 0x10, self.mtime)?;
        write_le_u16(image, offset + 0x18, gid_lo)?;
        write_le_u16(image, offset + 0x1A, self.links_count)?;
        write_le_u32(image, offset + 0x20, EXTENTS_FL)?;

        // extent root header: magic, entries 0, max 4, depth 0
        write_le_u16(image, offset + 0x28, EXTENT_MAGIC)?;
        write_le_u16(image, offset + 0x2A, 0)?;
        write_le_u16(image, offset + 0x2C, ROOT_EXTENT_CAPACITY)?;
        write_le_u16(image, offset + 0x2E, 0)?;

        write_le_u16(image, offset + 0x78, uid_hi)?;
        write_le_u16(image, offset + 0x7A, gid_hi)?;
        write_le_u16(image, offset + 0x80, EXTRA_ISIZE)?;
        write_le_u32(image, offset + 0x90, self.crtime)?;
        Ok(())
    }
}

/// Field-level access to an inode record already written to the image.
#[derive(Debug, Clone, Copy)]
pub struct InodeSlot {
    offset: usize,
}

impl InodeSlot {
    pub fn locate(sb: &Superblock, descs: &[GroupDesc], ino: InodeNo) -> Result<Self> {
        Ok(Self {
            offset: inode_record_offset(sb, descs, ino)?,
        })
    }

    pub fn size(&self, image: &[u8]) -> Result<u64> {
        Ok(join_lo_hi_u64(
            read_le_u32(image, self.offset + 0x04)?,
            read_le_u32(image, self.offset + 0x6C)?,
        ))
    }

    pub fn set_size(&self, image: &mut [u8], size: u64) -> Result<()> {
        let (lo, hi) = split_lo_hi_u64(size);
        write_le_u32(image, self.offset + 0x04, lo)?;
        Ok(write_le_u32(image, self.offset + 0x6C, hi)?)
    }

    pub fn links_count(&self, image: &[u8]) -> Result<u16> {
        Ok(read_le_u16(image, self.offset + 0x1A)?)
    }

    pub fn increment_links(&self, image: &mut [u8]) -> Result<()> {
        let links = self.links_count(image)?;
        Ok(write_le_u16(image, self.offset + 0x1A, links + 1)?)
    }

    /// `i_blocks` counts 512-byte units; extent registration adds both data
    /// blocks and tree node blocks here.
    pub fn add_blocks_512(&self, image: &mut [u8], delta: u64) -> Result<()> {
        let current = join_lo_hi_u48(
            read_le_u32(image, self.offset + 0x1C)?,
            read_le_u16(image, self.offset + 0x74)?,
        );
        let (lo, hi) = molt_types::split_lo_hi_u48(current + delta);
        write_le_u32(image, self.offset + 0x1C, lo)?;
        Ok(write_le_u16(image, self.offset + 0x74, hi)?)
    }

    pub fn blocks_512(&self, image: &[u8]) -> Result<u64> {
        Ok(join_lo_hi_u48(
            read_le_u32(image, self.offset + 0x1C)?,
            read_le_u16(image, self.offset + 0x74)?,
        ))
    }

    /// Byte offset of the 60-byte extent-tree root inside `i_block`.
    #[must_use]
    pub fn extent_root_offset(&self) -> usize {
        self.offset + 0x28
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
