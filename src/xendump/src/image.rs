//! Physical memory image assembled from crash-container regions.
//!
//! A [`MemoryImage`] maps physical addresses to byte ranges of the
//! underlying dump file. Crash dumps are sparse: RAM holes and unsaved
//! ranges are simply absent from the region table, and a read touching an
//! unmapped byte fails with [`ImageError::OutOfRange`] instead of being
//! zero-filled. Zero-fill would silently fabricate data in exactly the
//! situations this tool exists to diagnose.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LE};
use memmap2::Mmap;
use thiserror::Error;

/// Errors from building or reading a memory image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The region table is internally inconsistent (overlap, zero length).
    #[error("malformed region layout: {0}")]
    MalformedLayout(String),

    /// The requested span is not fully covered by mapped regions.
    #[error("read of {length:#x} bytes at physical {address:#x} is outside the mapped regions")]
    OutOfRange { address: u64, length: u64 },

    /// The backing source could not supply bytes it claims to hold.
    #[error("I/O failure reading dump source: {0}")]
    Io(#[from] io::Error),
}

/// A contiguous span of physical memory captured in the dump.
///
/// `source_offset` is the byte position of the span inside the backing
/// source. Regions are created by the container parser and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First physical address covered.
    pub start: u64,
    /// Length in bytes. Never zero in a built image.
    pub length: u64,
    /// Offset of the first byte within the backing source.
    pub source_offset: u64,
}

impl MemoryRegion {
    /// One-past-the-end physical address.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Whether `addr` falls inside this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Scalar field widths supported by the offset metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    /// Width in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }
}

/// Signedness of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Unsigned,
    Signed,
}

/// A decoded scalar, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Unsigned(u64),
    Signed(i64),
}

impl Scalar {
    /// The raw bit pattern, independent of signedness.
    pub fn raw(self) -> u64 {
        match self {
            Scalar::Unsigned(v) => v,
            Scalar::Signed(v) => v as u64,
        }
    }
}

/// Random-access byte supplier backing a memory image.
///
/// Implemented by [`MmapSource`] for real dump files and [`BufSource`] for
/// in-memory fixtures.
pub trait ByteSource: Send + Sync {
    /// Fill `buf` from `offset`. Must either fill the whole buffer or fail.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ImageError>;

    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memory-mapped dump file source.
pub struct MmapSource {
    mmap: Mmap,
    /// Path the source was opened from.
    pub path: PathBuf,
}

impl MmapSource {
    /// Open and map a dump file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Safety: the map is read-only and the analyser is the only reader;
        // dump files are not modified while under analysis.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(MmapSource { mmap, path })
    }

    /// The full mapped contents, for header/table parsing.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MmapSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&e| e <= self.len())
            .ok_or_else(|| {
                ImageError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "dump file {} is truncated: need {:#x}..{:#x}, have {:#x} bytes",
                        self.path.display(),
                        offset,
                        offset.saturating_add(buf.len() as u64),
                        self.len()
                    ),
                ))
            })?;
        buf.copy_from_slice(&self.mmap[offset as usize..end as usize]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }
}

/// In-memory byte source, used for synthetic dumps in tests and tools.
pub struct BufSource(pub Vec<u8>);

impl ByteSource for BufSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&e| e <= self.len())
            .ok_or_else(|| {
                ImageError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "buffer source truncated: need {:#x} bytes at {:#x}, have {:#x}",
                        buf.len(),
                        offset,
                        self.len()
                    ),
                ))
            })?;
        buf.copy_from_slice(&self.0[offset as usize..end as usize]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Read-only view over the physical memory captured in a dump.
///
/// Built once from the parsed region table, then shared by every decode
/// stage. Regions are kept sorted by start address so lookups are a binary
/// search; decoding performs many small scattered reads.
pub struct MemoryImage {
    regions: Vec<MemoryRegion>,
    source: Box<dyn ByteSource>,
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl MemoryImage {
    /// Build an image from a region table and its backing source.
    ///
    /// Fails with [`ImageError::MalformedLayout`] if any region has zero
    /// length or two regions overlap in physical address space.
    pub fn build(
        mut regions: Vec<MemoryRegion>,
        source: Box<dyn ByteSource>,
    ) -> Result<Self, ImageError> {
        for r in &regions {
            if r.length == 0 {
                return Err(ImageError::MalformedLayout(format!(
                    "zero-length region at {:#x}",
                    r.start
                )));
            }
            if r.start.checked_add(r.length).is_none() {
                return Err(ImageError::MalformedLayout(format!(
                    "region at {:#x} wraps the address space",
                    r.start
                )));
            }
        }

        regions.sort_by_key(|r| r.start);
        for pair in regions.windows(2) {
            if pair[1].start < pair[0].end() {
                return Err(ImageError::MalformedLayout(format!(
                    "regions overlap: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                    pair[0].start,
                    pair[0].end(),
                    pair[1].start,
                    pair[1].end()
                )));
            }
        }

        Ok(MemoryImage { regions, source })
    }

    /// The region table, sorted by start address.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Find the region containing `addr`, if any.
    pub fn find_region(&self, addr: u64) -> Option<&MemoryRegion> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        let r = &self.regions[idx.checked_sub(1)?];
        r.contains(addr).then_some(r)
    }

    /// Read `length` bytes of physical memory starting at `address`.
    ///
    /// The read is atomic: either the whole span is mapped (possibly across
    /// several physically contiguous regions) and every byte is returned, or
    /// the call fails. No partial data, no zero-fill.
    pub fn read(&self, address: u64, length: u64) -> Result<Vec<u8>, ImageError> {
        let mut out = vec![0u8; length as usize];
        let mut cursor = address;
        let mut filled = 0usize;

        while filled < out.len() {
            let region = self
                .find_region(cursor)
                .ok_or(ImageError::OutOfRange { address, length })?;
            let avail = region.end() - cursor;
            let want = (out.len() - filled).min(avail as usize);
            let src_off = region.source_offset + (cursor - region.start);
            self.source
                .read_at(src_off, &mut out[filled..filled + want])?;
            filled += want;
            cursor += want as u64;
        }

        Ok(out)
    }

    /// Decode an unaligned little-endian scalar at `address`.
    ///
    /// Dumps are byte-addressable and struct layouts are not under our
    /// control, so no alignment is assumed.
    pub fn read_scalar(
        &self,
        address: u64,
        width: Width,
        signedness: Signedness,
    ) -> Result<Scalar, ImageError> {
        let bytes = self.read(address, width.bytes())?;
        let raw = match width {
            Width::Byte => u64::from(bytes[0]),
            Width::Word => u64::from(LE::read_u16(&bytes)),
            Width::Dword => u64::from(LE::read_u32(&bytes)),
            Width::Qword => LE::read_u64(&bytes),
        };
        Ok(match signedness {
            Signedness::Unsigned => Scalar::Unsigned(raw),
            Signedness::Signed => {
                let shift = 64 - 8 * width.bytes() as u32;
                Scalar::Signed(((raw << shift) as i64) >> shift)
            }
        })
    }

    /// Read an unsigned pointer-width value at `address`.
    pub fn read_pointer(&self, address: u64, width: Width) -> Result<u64, ImageError> {
        Ok(self
            .read_scalar(address, width, Signedness::Unsigned)?
            .raw())
    }
}
