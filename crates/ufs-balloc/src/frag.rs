//! Fragment sizer.
//!
//! When a file grows past its current last block and that block is a
//! fragment, the fragment is upgraded to a full block before the main
//! allocation runs. Otherwise the file would keep an undersized block in
//! its interior, violating the rule that only the tail may be fragment
//! sized.
//!
//! The upgrade commits on its own: a failure in the main walk afterwards
//! does not undo it. This asymmetry is intentional and matches the
//! original engine's behavior.

use crate::{BallocEnv, Credentials};
use asupersync::Cx;
use tracing::debug;
use ufs_error::Result;
use ufs_types::{Inode, LogicalBlock, PhysBlock};

/// Upgrade the tail fragment of `ip` to a full block if the file is about
/// to grow past it toward `target`.
///
/// Fails only if the allocator cannot grow the fragment; nothing else has
/// been attempted yet, so there is nothing to roll back.
pub(crate) fn upgrade_tail_fragment(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    target: LogicalBlock,
) -> Result<()> {
    let geo = env.geo;
    let lastlbn = geo.lblkno(ip.size);
    let Some(slot) = lastlbn.direct_slot() else {
        return Ok(());
    };
    if lastlbn.0 >= target.0 {
        return Ok(());
    }

    let osize = geo.fragroundup(geo.blkoff(ip.size));
    if osize == 0 || osize >= geo.block_size() {
        return Ok(());
    }

    let old = PhysBlock(ip.map.direct[slot]);
    if old.is_null() {
        // A zero pointer inside EOF is a hole, not a fragment; there is
        // nothing to upgrade.
        return Ok(());
    }

    let bsize = geo.block_size();
    let newb = env
        .alloc
        .realloc_frag(cx, ip.ino, lastlbn, old, osize, bsize, cred)?;
    env.deps
        .register_resize(ip.ino, lastlbn, Some(old), newb, osize, bsize);
    ip.map.direct[slot] = newb.0;
    ip.frags += geo.numfrags(bsize - osize);
    ip.size = geo.lblktosize(LogicalBlock(lastlbn.0 + 1));

    debug!(
        target: "ufs::balloc",
        ino = ip.ino.0,
        lbn = lastlbn.0,
        old_addr = old.0,
        new_addr = newb.0,
        old_size = osize,
        new_size = bsize,
        "tail_fragment_upgraded"
    );
    Ok(())
}
