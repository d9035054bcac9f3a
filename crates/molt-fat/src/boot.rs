//! FAT32 boot sector parsing.

use molt_error::Result;
use molt_types::{read_fixed, read_le_u16, read_le_u32, ParseError};

/// The fields of the FAT32 boot sector the converter needs. Parsed by
/// offset; the layout is fixed by the FAT specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    /// Reserved sectors before the first FAT copy.
    pub sectors_before_fat: u16,
    pub fat_count: u8,
    /// 16-bit total; zero when the 32-bit field is authoritative.
    sector_count_16: u16,
    sector_count_32: u32,
    pub sectors_per_fat: u32,
    pub root_cluster_no: u32,
    /// 0x29 means the volume label and id fields below are valid.
    pub ext_boot_signature: u8,
    pub volume_id: u32,
    volume_label: [u8; 11],
}

impl BootSector {
    pub fn parse(image: &[u8]) -> Result<Self> {
        let boot = Self {
            bytes_per_sector: read_le_u16(image, 0x0B)?,
            sectors_per_cluster: read_fixed::<1>(image, 0x0D)?[0],
            sectors_before_fat: read_le_u16(image, 0x0E)?,
            fat_count: read_fixed::<1>(image, 0x10)?[0],
            sector_count_16: read_le_u16(image, 0x13)?,
            sector_count_32: read_le_u32(image, 0x20)?,
            sectors_per_fat: read_le_u32(image, 0x24)?,
            root_cluster_no: read_le_u32(image, 0x2C)?,
            ext_boot_signature: read_fixed::<1>(image, 0x42)?[0],
            volume_id: read_le_u32(image, 0x43)?,
            volume_label: read_fixed::<11>(image, 0x47)?,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<()> {
        if !self.bytes_per_sector.is_power_of_two() || self.bytes_per_sector < 512 {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be a power of two >= 512",
            }
            .into());
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a non-zero power of two",
            }
            .into());
        }
        if self.fat_count == 0 {
            return Err(ParseError::InvalidField {
                field: "fat_count",
                reason: "cannot be zero",
            }
            .into());
        }
        if self.sectors_per_fat == 0 {
            return Err(ParseError::InvalidField {
                field: "sectors_per_fat",
                reason: "cannot be zero (not a FAT32 volume?)",
            }
            .into());
        }
        if self.sectors_before_fat == 0 {
            return Err(ParseError::InvalidField {
                field: "sectors_before_fat",
                reason: "cannot be zero",
            }
            .into());
        }
        if self.root_cluster_no < 2 {
            return Err(ParseError::InvalidField {
                field: "root_cluster_no",
                reason: "root directory must start at cluster 2 or later",
            }
            .into());
        }
        Ok(())
    }

    /// Total sector count; the 16-bit field wins when non-zero.
    #[must_use]
    pub fn sector_count(&self) -> u32 {
        if self.sector_count_16 != 0 {
            u32::from(self.sector_count_16)
        } else {
            self.sector_count_32
        }
    }

    /// The volume label with trailing padding spaces removed. Empty when the
    /// extended boot signature says the label field is not valid, or when
    /// the label is all spaces.
    #[must_use]
    pub fn volume_label(&self) -> &[u8] {
        if self.ext_boot_signature != 0x29 {
            return &[];
        }
        let end = self
            .volume_label
            .iter()
            .rposition(|&byte| byte != b' ')
            .map_or(0, |idx| idx + 1);
        &self.volume_label[..end]
    }
}
