#![forbid(unsafe_code)]
//! The stream archiver: an append-only paged log living *inside* the volume
//! being converted.
//!
//! Phase R serializes the FAT directory tree into this log; Phase W drains
//! it in the same order while overwriting the FAT structures beneath it.
//! Pages are single clusters obtained from the extent allocator, so the log
//! never collides with live payload or future ext4 metadata.
//!
//! ## Layout
//!
//! Each page starts with an 8-byte little-endian pointer to the next page's
//! cluster number (0 terminates the chain; cluster 0 is never allocatable).
//! The payload is a sequence of *runs*: an 8-byte element count followed by
//! that many fixed-size elements. Elements never straddle a page boundary.
//! A `cut` finalizes the current run's count and reserves the next header
//! slot, so readers and writers make identical placement decisions.

use molt_alloc::ExtentAllocator;
use molt_error::Result;
use molt_fat::FatGeometry;
use molt_types::{read_le_u64, write_le_u64, ClusterNo};

/// Bytes reserved at the start of each page for the next-page pointer.
const PAGE_LINK_SIZE: usize = 8;
/// Bytes of a run header (the element count).
const RUN_HEADER_SIZE: usize = 8;

/// Position of a run header inside the log; a writer can hand this to a
/// reader to re-enter the stream at that run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPos {
    cluster: ClusterNo,
    offset: usize,
}

// ── Writer ──────────────────────────────────────────────────────────────────

pub struct StreamWriter {
    head: ClusterNo,
    current: ClusterNo,
    offset: usize,
    element_index: u64,
    header_pos: RunPos,
    page_size: usize,
    pages: u32,
}

impl StreamWriter {
    /// Allocate the first page and reserve the first run header.
    pub fn new(
        image: &mut [u8],
        geom: &FatGeometry,
        alloc: &mut ExtentAllocator,
    ) -> Result<Self> {
        let first = allocate_page(image, geom, alloc)?;
        let mut writer = Self {
            head: first,
            current: first,
            offset: PAGE_LINK_SIZE,
            element_index: 0,
            header_pos: RunPos {
                cluster: first,
                offset: PAGE_LINK_SIZE,
            },
            page_size: geom.cluster_size.as_usize(),
            pages: 1,
        };
        writer.reserve_header(image, geom, alloc)?;
        Ok(writer)
    }

    /// Append one element to the current run. The returned position allows
    /// back-filling the slot later (directory child counts are reserved
    /// before the children are walked).
    pub fn push(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        alloc: &mut ExtentAllocator,
        bytes: &[u8],
    ) -> Result<RunPos> {
        self.element_index += 1;
        let offset = self.place(image, geom, alloc, bytes.len())?;
        let start = geom.cluster_start_byte(self.current) + offset;
        image[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(RunPos {
            cluster: self.current,
            offset,
        })
    }

    /// Finalize the current run (store its element count) and reserve the
    /// header of the next one.
    pub fn cut(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        alloc: &mut ExtentAllocator,
    ) -> Result<()> {
        let header_byte = geom.cluster_start_byte(self.header_pos.cluster) + self.header_pos.offset;
        write_le_u64(image, header_byte, self.element_index)?;
        self.element_index = 0;
        self.reserve_header(image, geom, alloc)
    }

    /// Where the current (still open) run's header lives. Taken *before*
    /// writing a run and resumed *after* its `cut`, this lets Phase R and W
    /// re-read a directory's extent run while the stream continues past it.
    #[must_use]
    pub fn run_start(&self) -> RunPos {
        self.header_pos
    }

    /// First page of the log.
    #[must_use]
    pub fn head(&self) -> ClusterNo {
        self.head
    }

    /// Pages allocated so far.
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    fn reserve_header(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        alloc: &mut ExtentAllocator,
    ) -> Result<()> {
        let offset = self.place(image, geom, alloc, RUN_HEADER_SIZE)?;
        self.header_pos = RunPos {
            cluster: self.current,
            offset,
        };
        // Zero the slot: the cluster may hold stale bytes, and the final
        // reserved header is never backfilled by a cut.
        let start = geom.cluster_start_byte(self.current) + offset;
        write_le_u64(image, start, 0)?;
        Ok(())
    }

    /// Find room for `len` bytes, hopping to a freshly allocated page when
    /// the current one is full. Returns the in-page offset of the slot.
    fn place(
        &mut self,
        image: &mut [u8],
        geom: &FatGeometry,
        alloc: &mut ExtentAllocator,
        len: usize,
    ) -> Result<usize> {
        assert!(
            len + PAGE_LINK_SIZE <= self.page_size,
            "archive element of {len} bytes cannot fit a page"
        );
        if self.offset + len > self.page_size {
            let next = allocate_page(image, geom, alloc)?;
            let link_byte = geom.cluster_start_byte(self.current);
            write_le_u64(image, link_byte, u64::from(next))?;
            self.current = next;
            self.offset = PAGE_LINK_SIZE;
            self.pages += 1;
        }
        let offset = self.offset;
        self.offset += len;
        Ok(offset)
    }
}

/// Overwrite a previously pushed element in place.
pub fn patch_slot(
    image: &mut [u8],
    geom: &FatGeometry,
    pos: RunPos,
    bytes: &[u8],
) -> Result<()> {
    let start = geom.cluster_start_byte(pos.cluster) + pos.offset;
    molt_types::ensure_slice_mut(image, start, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

fn allocate_page(
    image: &mut [u8],
    geom: &FatGeometry,
    alloc: &mut ExtentAllocator,
) -> Result<ClusterNo> {
    let cluster = alloc.allocate(1)?.physical_start;
    let link_byte = geom.cluster_start_byte(cluster);
    write_le_u64(image, link_byte, 0)?;
    Ok(cluster)
}

// ── Reader ──────────────────────────────────────────────────────────────────

/// Sequential reader over the log. Cloning is cheap and produces an
/// independent cursor; Phase W forks one per directory to re-walk the
/// directory's extent run.
#[derive(Debug, Clone)]
pub struct StreamReader {
    cluster: ClusterNo,
    offset: usize,
    run_remaining: u64,
    page_size: usize,
}

impl StreamReader {
    /// Open the log at its head page and load the first run header.
    pub fn new(image: &[u8], geom: &FatGeometry, head: ClusterNo) -> Result<Self> {
        Self::resume(
            image,
            geom,
            RunPos {
                cluster: head,
                offset: PAGE_LINK_SIZE,
            },
        )
    }

    /// Re-enter the log at a previously recorded run header. The run must
    /// already have been finalized by the writer's `cut`.
    pub fn resume(image: &[u8], geom: &FatGeometry, pos: RunPos) -> Result<Self> {
        let mut reader = Self {
            cluster: pos.cluster,
            offset: pos.offset,
            run_remaining: 0,
            page_size: geom.cluster_size.as_usize(),
        };
        reader.load_header(image, geom)?;
        Ok(reader)
    }

    /// Read the next element of `len` bytes from the current run.
    ///
    /// Returns `None` at the end of a run and repositions to the next run,
    /// so a consumer that knows the stream's shape alternates fixed reads
    /// with a single `None` per cut.
    pub fn next(
        &mut self,
        image: &[u8],
        geom: &FatGeometry,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        if self.run_remaining == 0 {
            self.load_header(image, geom)?;
            return Ok(None);
        }
        self.run_remaining -= 1;
        let offset = self.place(image, geom, len)?;
        let start = geom.cluster_start_byte(self.cluster) + offset;
        Ok(Some(image[start..start + len].to_vec()))
    }

    /// Drain and discard the rest of the current run (elements of `len`
    /// bytes each), leaving the reader at the start of the next run.
    pub fn skip_run(&mut self, image: &[u8], geom: &FatGeometry, len: usize) -> Result<()> {
        while self.next(image, geom, len)?.is_some() {}
        Ok(())
    }

    fn load_header(&mut self, image: &[u8], geom: &FatGeometry) -> Result<()> {
        let offset = self.place(image, geom, RUN_HEADER_SIZE)?;
        let start = geom.cluster_start_byte(self.cluster) + offset;
        self.run_remaining = read_le_u64(image, start)?;
        Ok(())
    }

    /// Mirror of the writer's placement: hop to the linked page when `len`
    /// does not fit, then consume `len` bytes.
    fn place(&mut self, image: &[u8], geom: &FatGeometry, len: usize) -> Result<usize> {
        if self.offset + len > self.page_size {
            let link_byte = geom.cluster_start_byte(self.cluster);
            let next = read_le_u64(image, link_byte)?;
            if next == 0 {
                return Err(molt_error::MoltError::CorruptFat(
                    "archive read past the last page".into(),
                ));
            }
            self.cluster = next as ClusterNo;
            self.offset = PAGE_LINK_SIZE;
        }
        let offset = self.offset;
        self.offset += len;
        Ok(offset)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
