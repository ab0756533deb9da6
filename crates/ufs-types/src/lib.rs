#![forbid(unsafe_code)]
//! Core types for the oxufs block-allocation engine.
//!
//! Newtypes keep logical block numbers, physical fragment addresses, and
//! byte offsets from mixing; [`UfsGeometry`] owns the block/fragment size
//! math; [`PtrWidth`] parameterizes the two on-disk pointer widths (UFS1
//! 32-bit, UFS2 64-bit) so the engine is written once.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of direct block pointers in an inode.
pub const NDADDR: usize = 12;
/// Number of indirect block pointers in an inode (single, double, triple).
pub const NIADDR: usize = 3;

/// Zero-based index of a block within a file's byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Physical block/fragment address on the device (fragment-addressed).
///
/// `PhysBlock(0)` never names an allocated block; a zero pointer in a block
/// map means "unallocated".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysBlock(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhysBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PhysBlock {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl LogicalBlock {
    /// Index into the direct-pointer array, if this is a direct block.
    #[must_use]
    pub fn direct_slot(self) -> Option<usize> {
        usize::try_from(self.0).ok().filter(|s| *s < NDADDR)
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid block size {0}: must be a power of two in 4096..=65536")]
    BadBlockSize(u32),
    #[error("invalid fragment size {0}: must be a power of two in 512..=block size")]
    BadFragSize(u32),
    #[error("block/fragment ratio {0} out of range (1..=8)")]
    BadFragRatio(u32),
}

/// Validated filesystem geometry: full-block size and fragment size.
///
/// All byte/block conversions used by the engine live here so call sites
/// never do raw shift arithmetic. Within the addressable range of a
/// triple-indirect file (bounded by [`UfsGeometry::max_lbn`]) none of the
/// conversions can overflow a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsGeometry {
    bsize: u32,
    fsize: u32,
}

impl UfsGeometry {
    pub fn new(block_size: u32, frag_size: u32) -> Result<Self, GeometryError> {
        if !block_size.is_power_of_two() || !(4096..=65536).contains(&block_size) {
            return Err(GeometryError::BadBlockSize(block_size));
        }
        if !frag_size.is_power_of_two() || !(512..=block_size).contains(&frag_size) {
            return Err(GeometryError::BadFragSize(frag_size));
        }
        let ratio = block_size / frag_size;
        if !(1..=8).contains(&ratio) {
            return Err(GeometryError::BadFragRatio(ratio));
        }
        Ok(Self {
            bsize: block_size,
            fsize: frag_size,
        })
    }

    #[must_use]
    pub fn block_size(self) -> u64 {
        u64::from(self.bsize)
    }

    #[must_use]
    pub fn frag_size(self) -> u64 {
        u64::from(self.fsize)
    }

    /// Fragments per full block (1..=8).
    #[must_use]
    pub fn frags_per_block(self) -> u64 {
        u64::from(self.bsize / self.fsize)
    }

    /// Logical block number containing byte `offset`.
    #[must_use]
    pub fn lblkno(self, offset: u64) -> LogicalBlock {
        LogicalBlock(offset >> self.bsize.trailing_zeros())
    }

    /// Byte offset of the start of logical block `lbn`.
    #[must_use]
    pub fn lblktosize(self, lbn: LogicalBlock) -> u64 {
        lbn.0 << self.bsize.trailing_zeros()
    }

    /// Offset of `offset` within its block.
    #[must_use]
    pub fn blkoff(self, offset: u64) -> u64 {
        offset & (self.block_size() - 1)
    }

    /// Round a byte count up to a whole number of fragments.
    #[must_use]
    pub fn fragroundup(self, bytes: u64) -> u64 {
        let mask = self.frag_size() - 1;
        (bytes + mask) & !mask
    }

    /// Number of fragments covering `bytes` (rounds up).
    #[must_use]
    pub fn numfrags(self, bytes: u64) -> u64 {
        self.fragroundup(bytes) / self.frag_size()
    }

    /// On-disk size the block at `lbn` should have for a file of
    /// `file_size` bytes: a full block for any block the file extends
    /// past (and for every indirect-range block), otherwise the fragment
    /// rounding of the tail.
    #[must_use]
    pub fn blksize(self, file_size: u64, lbn: LogicalBlock) -> u64 {
        if lbn.0 >= NDADDR as u64 || file_size >= self.lblktosize(LogicalBlock(lbn.0 + 1)) {
            self.block_size()
        } else {
            self.fragroundup(self.blkoff(file_size))
        }
    }

    /// Pointer fan-out of an indirect block for the given pointer width.
    #[must_use]
    pub fn pointers_per_block(self, ptr_bytes: usize) -> u64 {
        self.block_size() / ptr_bytes as u64
    }

    /// Largest addressable logical block number: direct blocks plus three
    /// levels of indirection.
    #[must_use]
    pub fn max_lbn(self, ptr_bytes: usize) -> u64 {
        let n = self.pointers_per_block(ptr_bytes);
        NDADDR as u64 + n + n * n + n * n * n - 1
    }
}

// ── Pointer width parameterization ──────────────────────────────────────────

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PtrError {
    #[error("pointer index {idx} out of range for {len}-byte indirect block")]
    OutOfRange { idx: u64, len: usize },
    #[error("physical address {addr:#x} does not fit a 32-bit on-disk pointer")]
    Overflow { addr: u64 },
}

/// On-disk pointer width of an inode's block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeFormat {
    Ufs1,
    Ufs2,
}

/// On-disk block-pointer width. Implemented by the zero-sized [`Ufs1`] and
/// [`Ufs2`] markers; the engine is generic over this trait so one
/// implementation serves both formats.
pub trait PtrWidth: Copy + Clone + fmt::Debug + Send + Sync + 'static {
    const BYTES: usize;
    const NAME: &'static str;

    /// Read the pointer at `idx` from an indirect block's contents.
    fn get(buf: &[u8], idx: u64) -> Result<u64, PtrError>;

    /// Write the pointer at `idx` into an indirect block's contents.
    fn put(buf: &mut [u8], idx: u64, value: u64) -> Result<(), PtrError>;
}

/// 32-bit on-disk pointers (UFS1).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ufs1;

/// 64-bit on-disk pointers (UFS2).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ufs2;

fn ptr_range(idx: u64, bytes: usize, len: usize) -> Result<usize, PtrError> {
    let start = usize::try_from(idx)
        .ok()
        .and_then(|i| i.checked_mul(bytes))
        .ok_or(PtrError::OutOfRange { idx, len })?;
    if start.checked_add(bytes).is_none_or(|end| end > len) {
        return Err(PtrError::OutOfRange { idx, len });
    }
    Ok(start)
}

impl PtrWidth for Ufs1 {
    const BYTES: usize = 4;
    const NAME: &'static str = "ufs1";

    fn get(buf: &[u8], idx: u64) -> Result<u64, PtrError> {
        let start = ptr_range(idx, Self::BYTES, buf.len())?;
        let raw = [buf[start], buf[start + 1], buf[start + 2], buf[start + 3]];
        Ok(u64::from(u32::from_le_bytes(raw)))
    }

    fn put(buf: &mut [u8], idx: u64, value: u64) -> Result<(), PtrError> {
        let start = ptr_range(idx, Self::BYTES, buf.len())?;
        let narrow = u32::try_from(value).map_err(|_| PtrError::Overflow { addr: value })?;
        buf[start..start + 4].copy_from_slice(&narrow.to_le_bytes());
        Ok(())
    }
}

impl PtrWidth for Ufs2 {
    const BYTES: usize = 8;
    const NAME: &'static str = "ufs2";

    fn get(buf: &[u8], idx: u64) -> Result<u64, PtrError> {
        let start = ptr_range(idx, Self::BYTES, buf.len())?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&buf[start..start + 8]);
        Ok(u64::from_le_bytes(raw))
    }

    fn put(buf: &mut [u8], idx: u64, value: u64) -> Result<(), PtrError> {
        let start = ptr_range(idx, Self::BYTES, buf.len())?;
        buf[start..start + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

// ── Inode block map ─────────────────────────────────────────────────────────

/// In-memory view of an inode's block pointers: `NDADDR` direct slots
/// followed by `NIADDR` indirect roots. Stored width-independently as
/// `u64`; the [`InodeFormat`] tag governs the on-disk width and the UFS1
/// narrowing check happens at indirect-block serialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockMap {
    pub direct: [u64; NDADDR],
    pub indirect: [u64; NIADDR],
}

/// The inode fields the allocation engine reads and mutates. The caller
/// holds the per-file exclusive lock for the duration of any `balloc`
/// call; nothing here is internally synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub ino: InodeNumber,
    pub format: InodeFormat,
    /// File size in bytes.
    pub size: u64,
    /// Allocated fragments reachable from `map` (the on-disk block count).
    pub frags: u64,
    pub map: BlockMap,
}

impl Inode {
    #[must_use]
    pub fn new(ino: InodeNumber, format: InodeFormat) -> Self {
        Self {
            ino,
            format,
            size: 0,
            frags: 0,
            map: BlockMap::default(),
        }
    }
}
