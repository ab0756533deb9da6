//! Rollback manager.
//!
//! The chain walker records every block it allocates and every pointer it
//! speculatively persists in an [`Unwind`] context scoped to the call.
//! On failure, pointers are cleared deepest-first (so no durable block
//! ever names a freed one), the blocks go back to the allocator, quota is
//! restored, and the inode snapshot is reinstated.
//!
//! A failure inside rollback itself is escalated: at that point a
//! persisted pointer may reference a freed block, which is not a state
//! this engine can silently continue from.

use crate::{corrupt, BallocEnv, Credentials};
use asupersync::Cx;
use tracing::{debug, warn};
use ufs_block::WriteMode;
use ufs_error::{Result, UfsError};
use ufs_types::{BlockMap, Inode, PhysBlock, PtrWidth};

/// Where a speculative pointer write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentSlot {
    /// The inode's indirect-root array.
    InodeRoot { slot: usize },
    /// A slot inside a persisted indirect block.
    Meta { addr: PhysBlock, slot: u64 },
}

/// Function-scoped rollback context for one chain walk.
#[derive(Debug)]
pub(crate) struct Unwind {
    pre_size: u64,
    pre_frags: u64,
    pre_map: BlockMap,
    /// Blocks allocated during this call, in allocation order.
    allocs: Vec<(PhysBlock, u64)>,
    /// Speculative pointer writes, shallowest first.
    parents: Vec<ParentSlot>,
}

impl Unwind {
    pub(crate) fn new(ip: &Inode) -> Self {
        Self {
            pre_size: ip.size,
            pre_frags: ip.frags,
            pre_map: ip.map,
            allocs: Vec::new(),
            parents: Vec::new(),
        }
    }

    pub(crate) fn record_alloc(&mut self, addr: PhysBlock, size: u64) {
        self.allocs.push((addr, size));
    }

    pub(crate) fn record_parent(&mut self, parent: ParentSlot) {
        self.parents.push(parent);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.allocs.is_empty()
    }
}

/// Undo every mutation recorded in `ctx`, restoring the inode to its
/// pre-walk state.
///
/// Errors from this function mean the unwind itself failed partway; the
/// caller escalates them to [`UfsError::Unrecoverable`].
pub(crate) fn rollback<W: PtrWidth>(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    ctx: &Unwind,
) -> Result<()> {
    let bsize = env.geo.block_size();

    // Clear speculative pointers deepest-first so a crash mid-unwind
    // still never leaves a parent naming a cleared child.
    for parent in ctx.parents.iter().rev() {
        match *parent {
            ParentSlot::Meta { addr, slot } => {
                let mut buf = env.cache.read(cx, addr, bsize)?;
                W::put(buf.as_mut_slice(), slot, 0).map_err(|e| corrupt(addr, e))?;
                env.cache.write(cx, addr, buf.as_slice(), WriteMode::Sync)?;
            }
            ParentSlot::InodeRoot { slot } => {
                ip.map.indirect[slot] = 0;
            }
        }
    }

    let mut freed_frags = 0_u64;
    for (addr, size) in &ctx.allocs {
        env.alloc.free(cx, ip.ino, *addr, *size);
        freed_frags += env.geo.numfrags(*size);
    }

    if freed_frags > 0 {
        let delta = i64::try_from(freed_frags).unwrap_or(i64::MAX);
        if let Err(err) = env.quota.charge(cred, -delta) {
            // Giving quota back must not mask the original failure.
            warn!(
                target: "ufs::balloc",
                ino = ip.ino.0,
                frags = freed_frags,
                error = %err,
                "quota_restitution_failed"
            );
        }
    }

    ip.size = ctx.pre_size;
    ip.frags = ctx.pre_frags;
    ip.map = ctx.pre_map;

    debug!(
        target: "ufs::balloc",
        ino = ip.ino.0,
        blocks_freed = ctx.allocs.len(),
        pointers_cleared = ctx.parents.len(),
        "allocation_rolled_back"
    );
    Ok(())
}

/// Run rollback and translate any failure inside it into the
/// unrecoverable taxonomy, preserving both error messages.
pub(crate) fn rollback_or_escalate<W: PtrWidth>(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    ctx: &Unwind,
    cause: UfsError,
) -> UfsError {
    match rollback::<W>(cx, env, ip, cred, ctx) {
        Ok(()) => cause,
        Err(unwind_err) => UfsError::Unrecoverable(format!(
            "rollback failed ({unwind_err}) while unwinding allocation failure ({cause})"
        )),
    }
}
