//! FAT directory entries: 8.3 records and long-filename fragments.
//!
//! Both kinds share the same 32-byte slot. A slot whose attribute low
//! nibble is 0x0F is a long-name fragment carrying 13 UCS-2 code units;
//! fragments precede their 8.3 record in reverse sequence order.

use molt_error::Result;
use molt_types::{join_lo_hi_u32, read_fixed, read_le_u16, read_le_u32, ClusterNo};

/// Size of one directory slot in bytes.
pub const DENTRY_SIZE: usize = 32;

/// UCS-2 code units carried by one long-filename fragment.
pub const LFN_UNITS: usize = 13;

const ATTR_VOLUME_LABEL: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;
const CASE_LOWER_NAME: u8 = 0x08;
const CASE_LOWER_EXTENSION: u8 = 0x10;
const DELETED_MARKER: u8 = 0xE5;

/// A decoded 8.3 directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatDentry {
    pub short_name: [u8; 8],
    pub short_extension: [u8; 3],
    pub attrs: u8,
    pub short_name_case: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub access_date: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    first_cluster_high: u16,
    first_cluster_low: u16,
    pub file_size: u32,
}

impl FatDentry {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            short_name: read_fixed::<8>(bytes, offset)?,
            short_extension: read_fixed::<3>(bytes, offset + 0x08)?,
            attrs: read_fixed::<1>(bytes, offset + 0x0B)?[0],
            short_name_case: read_fixed::<1>(bytes, offset + 0x0C)?[0],
            create_time: read_le_u16(bytes, offset + 0x0E)?,
            create_date: read_le_u16(bytes, offset + 0x10)?,
            access_date: read_le_u16(bytes, offset + 0x12)?,
            first_cluster_high: read_le_u16(bytes, offset + 0x14)?,
            mod_time: read_le_u16(bytes, offset + 0x16)?,
            mod_date: read_le_u16(bytes, offset + 0x18)?,
            first_cluster_low: read_le_u16(bytes, offset + 0x1A)?,
            file_size: read_le_u32(bytes, offset + 0x1C)?,
        })
    }

    /// Serialize back into the 32-byte on-disk layout (the stream archiver
    /// stores dentries in this form between the two phases).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DENTRY_SIZE] {
        let mut out = [0u8; DENTRY_SIZE];
        out[0x00..0x08].copy_from_slice(&self.short_name);
        out[0x08..0x0B].copy_from_slice(&self.short_extension);
        out[0x0B] = self.attrs;
        out[0x0C] = self.short_name_case;
        out[0x0E..0x10].copy_from_slice(&self.create_time.to_le_bytes());
        out[0x10..0x12].copy_from_slice(&self.create_date.to_le_bytes());
        out[0x12..0x14].copy_from_slice(&self.access_date.to_le_bytes());
        out[0x14..0x16].copy_from_slice(&self.first_cluster_high.to_le_bytes());
        out[0x16..0x18].copy_from_slice(&self.mod_time.to_le_bytes());
        out[0x18..0x1A].copy_from_slice(&self.mod_date.to_le_bytes());
        out[0x1A..0x1C].copy_from_slice(&self.first_cluster_low.to_le_bytes());
        out[0x1C..0x20].copy_from_slice(&self.file_size.to_le_bytes());
        out
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.attrs & ATTR_DIRECTORY != 0
    }

    /// The FAT `.` and `..` entries; they are re-synthesized on the ext4
    /// side rather than preserved.
    #[must_use]
    pub fn is_dot_dir(&self) -> bool {
        self.short_name[0] == b'.'
    }

    /// Volume-label slot (attribute 0x08 without the LFN pattern). The root
    /// directory carries one; it names the volume, not a file.
    #[must_use]
    pub fn is_volume_label(&self) -> bool {
        self.attrs & ATTR_LFN != ATTR_LFN && self.attrs & ATTR_VOLUME_LABEL != 0
    }

    /// First cluster of the entry's data chain; 0 for empty files.
    #[must_use]
    pub fn first_cluster_no(&self) -> ClusterNo {
        join_lo_hi_u32(self.first_cluster_low, self.first_cluster_high)
    }

    /// Decode the 8.3 name into UCS-2, honoring the per-field lowercase
    /// flags, padded with zero units to one LFN-sized slot.
    #[must_use]
    pub fn short_name_ucs2(&self) -> [u16; LFN_UNITS] {
        let mut units = [0u16; LFN_UNITS];
        let mut len = 0;

        let name_end = trimmed_len(&self.short_name);
        let lower_name = self.short_name_case & CASE_LOWER_NAME != 0;
        for &byte in &self.short_name[..name_end] {
            units[len] = u16::from(apply_case(byte, lower_name));
            len += 1;
        }

        let ext_end = trimmed_len(&self.short_extension);
        if ext_end > 0 {
            units[len] = u16::from(b'.');
            len += 1;
            let lower_ext = self.short_name_case & CASE_LOWER_EXTENSION != 0;
            for &byte in &self.short_extension[..ext_end] {
                units[len] = u16::from(apply_case(byte, lower_ext));
                len += 1;
            }
        }

        units
    }
}

fn trimmed_len(field: &[u8]) -> usize {
    field.iter().rposition(|&byte| byte != b' ').map_or(0, |idx| idx + 1)
}

fn apply_case(byte: u8, lower: bool) -> u8 {
    if lower {
        byte.to_ascii_lowercase()
    } else {
        byte
    }
}

/// One long-filename fragment.
#[derive(Debug, Clone, Copy)]
pub struct LfnFragment {
    sequence: u8,
    units: [u16; LFN_UNITS],
}

impl LfnFragment {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self> {
        let mut units = [0u16; LFN_UNITS];
        // 13 units split across three runs inside the 32-byte slot
        for (idx, unit) in units.iter_mut().enumerate() {
            let field_offset = match idx {
                0..=4 => 0x01 + idx * 2,
                5..=10 => 0x0E + (idx - 5) * 2,
                _ => 0x1C + (idx - 11) * 2,
            };
            *unit = read_le_u16(bytes, offset + field_offset)?;
        }
        Ok(Self {
            sequence: read_fixed::<1>(bytes, offset)?[0],
            units,
        })
    }

    /// Position of this fragment in the name, 1-based. On disk, the highest
    /// sequence number appears first.
    #[must_use]
    pub fn sequence_no(&self) -> u8 {
        self.sequence & 0x1F
    }

    /// Bit 0x40 marks the fragment that starts the on-disk run (and ends
    /// the logical name).
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.sequence & 0x40 != 0
    }

    #[must_use]
    pub fn units(&self) -> [u16; LFN_UNITS] {
        self.units
    }
}

/// Classification of a raw 32-byte directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// First byte 0x00: no further entries in this directory.
    TableEnd,
    /// First byte 0xE5: deleted entry.
    Deleted,
    /// Long-filename fragment.
    Lfn,
    /// A live 8.3 record.
    Dentry,
}

/// Classify the slot at `offset` without fully decoding it.
pub fn classify_slot(bytes: &[u8], offset: usize) -> Result<SlotKind> {
    let first = read_fixed::<1>(bytes, offset)?[0];
    if first == 0x00 {
        return Ok(SlotKind::TableEnd);
    }
    if first == DELETED_MARKER {
        return Ok(SlotKind::Deleted);
    }
    let attrs = read_fixed::<1>(bytes, offset + 0x0B)?[0];
    if attrs & ATTR_LFN == ATTR_LFN {
        Ok(SlotKind::Lfn)
    } else {
        Ok(SlotKind::Dentry)
    }
}
