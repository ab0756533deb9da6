#![forbid(unsafe_code)]
//! Block-allocation engine for oxufs.
//!
//! [`balloc`] maps a file's logical byte offset to a physical block,
//! allocating whatever is missing along the way: the data block itself,
//! up to three levels of indirect blocks above it, and a fragment-to-full
//! upgrade of the file's previous tail block when the file grows past it.
//!
//! Design:
//! - The walk is written once, generic over the on-disk pointer width
//!   ([`ufs_types::PtrWidth`]); [`balloc`] selects the instantiation from
//!   the inode's format tag.
//! - All multi-step mutation is tracked in a function-scoped unwind
//!   context. Any failure after the first allocation rolls back every
//!   block allocated during the call, deepest pointer first, so no
//!   persisted pointer ever names a freed block.
//! - Write ordering is delegated to a [`DependencyTracker`] capability
//!   when one is present; the [`SyncWrites`] null tracker degrades every
//!   ordering-sensitive write to a synchronous one.
//!
//! The bitmap allocator, buffer cache, quota system, and dependency
//! tracker are collaborators reached through traits; this crate performs
//! no I/O of its own beyond invoking them.

mod chain;
mod direct;
mod frag;
pub mod plan;
mod softdep;
mod unwind;

pub use softdep::{DependencyTracker, IndirParent, SyncWrites};

use asupersync::Cx;
use ufs_block::{BlockBuf, BufCache, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_types::{
    Inode, InodeFormat, InodeNumber, LogicalBlock, PhysBlock, PtrError, PtrWidth, Ufs1, Ufs2,
    UfsGeometry,
};

/// Identity of the requesting user, passed through to the allocator and
/// quota collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// The block/fragment bitmap allocator (external collaborator).
///
/// Contract: returned addresses are never zero; `realloc_frag` preserves
/// the old contents in the first `old_size` bytes of the block it returns
/// (whether it extends in place or moves the data).
pub trait BlockAllocator: Send + Sync {
    /// Allocate `size` bytes (a whole number of fragments, at most one
    /// block) for logical block `lbn` of inode `ino`.
    fn alloc(
        &self,
        cx: &Cx,
        ino: InodeNumber,
        lbn: LogicalBlock,
        size: u64,
        hint: Option<PhysBlock>,
        cred: &Credentials,
    ) -> Result<PhysBlock>;

    /// Grow the fragment at `old` from `old_size` to `new_size` bytes,
    /// returning its (possibly new) address.
    fn realloc_frag(
        &self,
        cx: &Cx,
        ino: InodeNumber,
        lbn: LogicalBlock,
        old: PhysBlock,
        old_size: u64,
        new_size: u64,
        cred: &Credentials,
    ) -> Result<PhysBlock>;

    /// Return `size` bytes at `addr` to the free pool.
    fn free(&self, cx: &Cx, ino: InodeNumber, addr: PhysBlock, size: u64);
}

/// Disk-quota accounting (external collaborator).
///
/// The engine only calls this on the rollback path, to give back the
/// fragments charged by the allocator for blocks that are being freed.
/// Forward-path charging happens inside the allocator.
pub trait QuotaSink: Send + Sync {
    /// Adjust the owner's usage by `delta_frags` fragments (negative to
    /// give quota back).
    fn charge(&self, cred: &Credentials, delta_frags: i64) -> Result<()>;
}

/// Behavior flags for one allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BallocFlags {
    /// Zero the returned data block's contents instead of leaving
    /// whatever the device holds.
    pub zero_fill: bool,
    /// Every write performed during this call blocks until complete.
    pub sync: bool,
    /// Stop after resolving the indirect chain; return the last indirect
    /// block instead of allocating the leaf data block. Only meaningful
    /// for indirect-range blocks; ignored for direct blocks.
    pub metadata_only: bool,
}

/// One allocation request. `size` is the required size of the target
/// logical block measured from the block's start (at most one full
/// block); `offset` selects the block.
#[derive(Debug, Clone, Copy)]
pub struct BallocRequest {
    pub offset: u64,
    pub size: u64,
    pub flags: BallocFlags,
    /// Materialize the block's contents in the returned handle.
    pub want_buffer: bool,
}

impl BallocRequest {
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            flags: BallocFlags::default(),
            want_buffer: false,
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: BallocFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn want_buffer(mut self) -> Self {
        self.want_buffer = true;
        self
    }
}

/// A resolved block: its physical address, on-disk size, and optionally
/// its contents.
#[derive(Debug)]
pub struct BlockHandle {
    pub addr: PhysBlock,
    pub size: u64,
    pub buf: Option<BlockBuf>,
}

/// Collaborator environment for one or more `balloc` calls.
pub struct BallocEnv<'a> {
    pub geo: UfsGeometry,
    pub alloc: &'a dyn BlockAllocator,
    pub cache: &'a dyn BufCache,
    pub deps: &'a dyn DependencyTracker,
    pub quota: &'a dyn QuotaSink,
}

impl std::fmt::Debug for BallocEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BallocEnv").field("geo", &self.geo).finish()
    }
}

/// Allocate (or locate) the block backing `req.offset`, growing the file's
/// block map as needed.
///
/// The caller must hold the per-file exclusive lock for the whole call.
/// On error the inode and block map are restored to their pre-call state,
/// except for a tail-fragment upgrade, which commits independently of the
/// main walk.
///
/// # Panics
///
/// Panics if `req.size` is zero or exceeds one full block; both indicate
/// a caller contract breach, not a recoverable condition.
pub fn balloc(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    req: &BallocRequest,
) -> Result<BlockHandle> {
    match ip.format {
        InodeFormat::Ufs1 => balloc_width::<Ufs1>(cx, env, ip, cred, req),
        InodeFormat::Ufs2 => balloc_width::<Ufs2>(cx, env, ip, cred, req),
    }
}

fn balloc_width<W: PtrWidth>(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    req: &BallocRequest,
) -> Result<BlockHandle> {
    assert!(req.size > 0, "balloc: zero-size request");
    assert!(
        req.size <= env.geo.block_size(),
        "balloc: requested size {} exceeds block size {}",
        req.size,
        env.geo.block_size()
    );

    let lbn = env.geo.lblkno(req.offset);
    let max = env.geo.max_lbn(W::BYTES);
    if lbn.0 > max {
        return Err(UfsError::FileTooBig { lbn: lbn.0, max });
    }

    // Grow the previous tail fragment to a full block before anything
    // else; this commits independently of the main walk.
    frag::upgrade_tail_fragment(cx, env, ip, cred, lbn)?;

    if let Some(slot) = lbn.direct_slot() {
        direct::alloc_direct(cx, env, ip, cred, req, lbn, slot)
    } else {
        chain::alloc_chain::<W>(cx, env, ip, cred, req, lbn)
    }
}

// ── Shared helpers for the allocation paths ─────────────────────────────────

/// Write mode for metadata writes: the dependency tracker may defer them,
/// otherwise (or when the caller asked for synchronous behavior) they
/// block until durable.
pub(crate) fn meta_write_mode(env: &BallocEnv<'_>, flags: BallocFlags) -> WriteMode {
    if flags.sync || !env.deps.tracks_ordering() {
        WriteMode::Sync
    } else {
        WriteMode::Delayed
    }
}

pub(crate) fn data_write_mode(flags: BallocFlags) -> WriteMode {
    if flags.sync {
        WriteMode::Sync
    } else {
        WriteMode::Delayed
    }
}

/// Advance the file size to cover `size` bytes of block `lbn`.
pub(crate) fn advance_size(ip: &mut Inode, geo: UfsGeometry, lbn: LogicalBlock, size: u64) {
    let end = geo.lblktosize(lbn) + size;
    if end > ip.size {
        ip.size = end;
    }
}

/// Read the block's contents for the caller, if the request asked for them.
pub(crate) fn maybe_read(
    cx: &Cx,
    env: &BallocEnv<'_>,
    addr: PhysBlock,
    size: u64,
    req: &BallocRequest,
) -> Result<Option<BlockBuf>> {
    if req.want_buffer {
        Ok(Some(env.cache.read(cx, addr, size)?))
    } else {
        Ok(None)
    }
}

/// A pointer-slice failure inside an indirect block is metadata
/// corruption at that block's address.
pub(crate) fn corrupt(addr: PhysBlock, err: PtrError) -> UfsError {
    UfsError::Corruption {
        addr: addr.0,
        detail: err.to_string(),
    }
}
