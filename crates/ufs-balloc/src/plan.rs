//! Indirection planner.
//!
//! Pure computation: given a logical block number past the direct range,
//! determine how many indirection levels reach it and the slot index at
//! each level. No I/O happens here; the chain walker consumes the plan.

use ufs_error::{Result, UfsError};
use ufs_types::{LogicalBlock, NDADDR, NIADDR};

/// The route from an inode to an indirect-range logical block: which
/// indirect-root slot to start from and the pointer index at each level,
/// outermost first. `offsets[depth - 1]` indexes the data block in the
/// last indirect block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirPlan {
    /// Number of indirection levels (1..=3).
    pub depth: usize,
    /// Index into the inode's indirect-pointer array (`depth - 1`).
    pub root_slot: usize,
    /// Slot index at each level; only the first `depth` entries are used.
    pub offsets: [u64; NIADDR],
}

/// Plan the indirect chain for `lbn` with `nindir` pointers per indirect
/// block.
///
/// # Panics
///
/// Panics if `lbn` is a direct block; the dispatch layer routes those
/// elsewhere.
pub fn indir_plan(nindir: u64, lbn: LogicalBlock) -> Result<IndirPlan> {
    assert!(
        lbn.0 >= NDADDR as u64,
        "indir_plan: direct block {lbn} has no indirect chain"
    );
    assert!(nindir >= 2, "indir_plan: fan-out must be at least 2");

    let mut rem = lbn.0 - NDADDR as u64;
    let mut span = nindir;
    for depth in 1..=NIADDR {
        if rem < span {
            let mut offsets = [0_u64; NIADDR];
            let mut divisor = span / nindir;
            for off in offsets.iter_mut().take(depth) {
                *off = (rem / divisor) % nindir;
                divisor = std::cmp::max(divisor / nindir, 1);
            }
            return Ok(IndirPlan {
                depth,
                root_slot: depth - 1,
                offsets,
            });
        }
        rem -= span;
        // span = nindir^(depth+1); cannot overflow for any valid
        // geometry (nindir <= 16384, so nindir^3 < 2^43).
        span *= nindir;
    }

    let max = NDADDR as u64 + nindir + nindir * nindir + nindir * nindir * nindir - 1;
    Err(UfsError::FileTooBig { lbn: lbn.0, max })
}
