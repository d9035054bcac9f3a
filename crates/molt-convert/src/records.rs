//! Archive record encodings shared by the two phases.
//!
//! The stream archiver stores four element kinds, all fixed-size:
//! raw 32-byte FAT directory entries, 26-byte UCS-2 name slots (13 code
//! units), 10-byte cluster extents, and 4-byte child counts. A child count
//! of `u32::MAX` marks a regular file (no children follow).

use molt_archive::StreamReader;
use molt_error::{MoltError, Result};
use molt_fat::FatGeometry;
use molt_types::ClusterExtent;

pub const DENTRY_RECORD_SIZE: usize = 32;
pub const NAME_SLOT_SIZE: usize = 26;
pub const EXTENT_RECORD_SIZE: usize = 10;
pub const CHILD_COUNT_SIZE: usize = 4;

/// Child-count value marking a regular file.
pub const NO_CHILDREN: u32 = u32::MAX;

pub fn encode_extent(extent: &ClusterExtent) -> [u8; EXTENT_RECORD_SIZE] {
    let mut out = [0u8; EXTENT_RECORD_SIZE];
    out[0..4].copy_from_slice(&extent.logical_start.to_le_bytes());
    out[4..6].copy_from_slice(&extent.length.to_le_bytes());
    out[6..10].copy_from_slice(&extent.physical_start.to_le_bytes());
    out
}

pub fn decode_extent(bytes: &[u8]) -> ClusterExtent {
    ClusterExtent {
        logical_start: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        length: u16::from_le_bytes([bytes[4], bytes[5]]),
        physical_start: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
    }
}

pub fn encode_name_slot(units: &[u16; 13]) -> [u8; NAME_SLOT_SIZE] {
    let mut out = [0u8; NAME_SLOT_SIZE];
    for (index, unit) in units.iter().enumerate() {
        out[index * 2..index * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Read a single-element run and its end-of-run marker.
pub fn read_single_run(
    reader: &mut StreamReader,
    image: &[u8],
    geom: &FatGeometry,
    len: usize,
) -> Result<Vec<u8>> {
    let element = reader
        .next(image, geom, len)?
        .ok_or_else(|| MoltError::CorruptFat("archive run unexpectedly empty".into()))?;
    if reader.next(image, geom, len)?.is_some() {
        return Err(MoltError::CorruptFat(
            "archive run holds more elements than expected".into(),
        ));
    }
    Ok(element)
}

/// Read a single-u32 run (a child count or the file marker).
pub fn read_child_count(
    reader: &mut StreamReader,
    image: &[u8],
    geom: &FatGeometry,
) -> Result<u32> {
    let bytes = read_single_run(reader, image, geom, CHILD_COUNT_SIZE)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Collect a name run's UCS-2 units into a UTF-8 string. The units end at
/// the first zero (names filling every slot exactly have none).
pub fn read_name(reader: &mut StreamReader, image: &[u8], geom: &FatGeometry) -> Result<String> {
    let mut units = Vec::new();
    while let Some(slot) = reader.next(image, geom, NAME_SLOT_SIZE)? {
        for pair in slot.chunks_exact(2) {
            units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
    }
    let end = units.iter().position(|&unit| unit == 0).unwrap_or(units.len());
    Ok(String::from_utf16_lossy(&units[..end]))
}

/// Iterate the physical clusters described by an extent run.
#[derive(Debug, Clone)]
pub struct ExtentRunClusters {
    reader: StreamReader,
    current: Option<ClusterExtent>,
    consumed: u32,
    exhausted: bool,
}

impl ExtentRunClusters {
    #[must_use]
    pub fn new(reader: StreamReader) -> Self {
        Self {
            reader,
            current: None,
            consumed: 0,
            exhausted: false,
        }
    }

    pub fn next_cluster(
        &mut self,
        image: &[u8],
        geom: &FatGeometry,
    ) -> Result<Option<molt_types::ClusterNo>> {
        loop {
            if let Some(extent) = self.current {
                if self.consumed < u32::from(extent.length) {
                    let cluster = extent.physical_start + self.consumed;
                    self.consumed += 1;
                    return Ok(Some(cluster));
                }
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.reader.next(image, geom, EXTENT_RECORD_SIZE)? {
                Some(bytes) => {
                    self.current = Some(decode_extent(&bytes));
                    self.consumed = 0;
                }
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_record_round_trips() {
        let extent = ClusterExtent::new(77, 9, 12345);
        assert_eq!(decode_extent(&encode_extent(&extent)), extent);
    }

    #[test]
    fn name_slot_round_trips() {
        let mut units = [0u16; 13];
        for (index, unit) in "Journée".encode_utf16().enumerate() {
            units[index] = unit;
        }
        let bytes = encode_name_slot(&units);
        assert_eq!(bytes.len(), NAME_SLOT_SIZE);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), u16::from(b'J'));
    }
}
