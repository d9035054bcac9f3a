//! Directory block construction.
//!
//! ext4 directories are chains of variable-length records
//! `{inode: u32, rec_len: u16, name_len: u16, name}` padded to 4-byte
//! boundaries, where the last record of every block stretches its
//! `rec_len` to the block end. The builder tracks the previously written
//! record so a block can be sealed when the next entry does not fit.
//!
//! Blocks are supplied by the caller: the conversion reuses the
//! directory's original FAT clusters first and falls back to the allocator
//! once they run out.

use molt_alloc::ExtentAllocator;
use molt_error::{MoltError, Result};
use molt_fat::FatGeometry;
use molt_types::{align4, read_le_u16, write_bytes, write_le_u16, BlockNo, InodeNo};

use crate::extent::{register_extent, BlockExtent};
use crate::group::GroupDesc;
use crate::inode::InodeSlot;
use crate::sb::Superblock;

/// On-disk size of the `.` and `..` records (name fits the padding).
pub const DOT_DENTRY_SIZE: usize = 12;

/// Longest directory entry name in bytes.
pub const EXT4_NAME_MAX: usize = 255;

/// Encode one directory record. `rec_len` must already be 4-aligned and
/// large enough for the name.
#[must_use]
pub fn encode_dentry(ino: InodeNo, rec_len: u16, name: &[u8]) -> Vec<u8> {
    debug_assert!(rec_len % 4 == 0);
    debug_assert!(usize::from(rec_len) >= 8 + name.len());
    let mut out = vec![0u8; usize::from(rec_len)];
    out[0..4].copy_from_slice(&ino.to_le_bytes());
    out[4..6].copy_from_slice(&rec_len.to_le_bytes());
    out[6..8].copy_from_slice(&(name.len() as u16).to_le_bytes());
    out[8..8 + name.len()].copy_from_slice(name);
    out
}

/// Record length a name requires.
pub fn record_len(name: &[u8]) -> Result<u16> {
    if name.len() > EXT4_NAME_MAX {
        return Err(MoltError::NameTooLong(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(align4(name.len() as u32 + 8) as u16)
}

/// Streams records into a directory's blocks.
pub struct DirBuilder {
    ino: InodeNo,
    block_no: BlockNo,
    position: usize,
    block_count: u32,
    /// Absolute image offset of the last written record, for `rec_len`
    /// stretching.
    prev_record: Option<usize>,
}

impl DirBuilder {
    /// Start a directory in `first_block`, emitting `.` and `..`.
    pub fn open(
        image: &mut [u8],
        sb: &Superblock,
        ino: InodeNo,
        parent_ino: InodeNo,
        first_block: BlockNo,
    ) -> Result<Self> {
        let block_offset = first_block as usize * sb.block_size().as_usize();
        let dot = encode_dentry(ino, DOT_DENTRY_SIZE as u16, b".");
        let dot_dot = encode_dentry(parent_ino, DOT_DENTRY_SIZE as u16, b"..");
        write_bytes(image, block_offset, &dot)?;
        write_bytes(image, block_offset + DOT_DENTRY_SIZE, &dot_dot)?;
        Ok(Self {
            ino,
            block_no: first_block,
            position: 2 * DOT_DENTRY_SIZE,
            block_count: 1,
            prev_record: Some(block_offset + DOT_DENTRY_SIZE),
        })
    }

    /// Whether a record of `rec_len` bytes fits the current block.
    #[must_use]
    pub fn fits(&self, sb: &Superblock, rec_len: u16) -> bool {
        usize::from(rec_len) <= sb.block_size().as_usize() - self.position
    }

    /// Append one record; the caller must have checked `fits`.
    pub fn add_entry(
        &mut self,
        image: &mut [u8],
        sb: &Superblock,
        child_ino: InodeNo,
        name: &[u8],
    ) -> Result<()> {
        let rec_len = record_len(name)?;
        assert!(self.fits(sb, rec_len), "caller must roll the block first");
        let offset = self.block_no as usize * sb.block_size().as_usize() + self.position;
        write_bytes(image, offset, &encode_dentry(child_ino, rec_len, name))?;
        self.prev_record = Some(offset);
        self.position += usize::from(rec_len);
        Ok(())
    }

    /// Seal the current block (stretch the last record to the block end,
    /// register the block as the next logical extent) and continue in
    /// `block`.
    pub fn start_new_block(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
        block: BlockNo,
    ) -> Result<()> {
        self.seal_block(image, sb)?;
        self.register_block(image, geom, sb, descs, alloc)?;
        self.block_no = block;
        self.position = 0;
        self.block_count += 1;
        self.prev_record = None;
        Ok(())
    }

    /// Finish the directory: seal and register the last block and set the
    /// inode's size. Returns the number of blocks used.
    pub fn close(
        mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
    ) -> Result<u32> {
        self.seal_block(image, sb)?;
        self.register_block(image, geom, sb, descs, alloc)?;
        let slot = InodeSlot::locate(sb, descs, self.ino)?;
        slot.set_size(
            image,
            u64::from(self.block_count) * u64::from(sb.block_size().get()),
        )?;
        Ok(self.block_count)
    }

    fn seal_block(&mut self, image: &mut [u8], sb: &Superblock) -> Result<()> {
        if let Some(prev) = self.prev_record {
            let slack = (sb.block_size().as_usize() - self.position) as u16;
            let rec_len = read_le_u16(image, prev + 4)?;
            write_le_u16(image, prev + 4, rec_len + slack)?;
            self.position = sb.block_size().as_usize();
        }
        Ok(())
    }

    fn register_block(
        &self,
        image: &mut [u8],
        geom: &FatGeometry,
        sb: &Superblock,
        descs: &mut [GroupDesc],
        alloc: &mut ExtentAllocator,
    ) -> Result<()> {
        register_extent(
            image,
            geom,
            sb,
            descs,
            alloc,
            self.ino,
            BlockExtent {
                logical: self.block_count - 1,
                len: 1,
                start: self.block_no,
            },
        )
    }
}

/// Write a lone record spanning a whole block (used when `lost+found`'s
/// entry lands in a fresh block appended to the root).
pub fn write_full_block_entry(
    image: &mut [u8],
    sb: &Superblock,
    block: BlockNo,
    ino: InodeNo,
    name: &[u8],
) -> Result<()> {
    let offset = block as usize * sb.block_size().as_usize();
    let rec_len = record_len(name)?;
    write_bytes(image, offset, &encode_dentry(ino, rec_len, name))?;
    // stretch to the block end
    write_le_u16(image, offset + 4, sb.block_size().get() as u16)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
