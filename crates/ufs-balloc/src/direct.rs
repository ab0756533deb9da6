//! Direct-block allocation (logical block number below `NDADDR`).
//!
//! Three states per call: the block is already full size (return it), it
//! is the file's tail fragment (grow it if the request needs more), or it
//! is unallocated (allocate a fragment or a full block). The pointer slot
//! and inode counters are written only after every fallible step has
//! succeeded, so failures on this path leave no state to roll back.

use crate::{
    advance_size, data_write_mode, maybe_read, BallocEnv, BallocRequest, BlockHandle, Credentials,
};
use asupersync::Cx;
use tracing::debug;
use ufs_block::BlockBuf;
use ufs_error::Result;
use ufs_types::{Inode, LogicalBlock, PhysBlock};

pub(crate) fn alloc_direct(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    req: &BallocRequest,
    lbn: LogicalBlock,
    slot: usize,
) -> Result<BlockHandle> {
    let geo = env.geo;
    let bsize = geo.block_size();
    let nb = PhysBlock(ip.map.direct[slot]);

    if !nb.is_null() {
        if ip.size >= geo.lblktosize(LogicalBlock(lbn.0 + 1)) {
            // The file already extends past this block, so it is
            // guaranteed full size.
            let buf = maybe_read(cx, env, nb, bsize, req)?;
            return Ok(BlockHandle {
                addr: nb,
                size: bsize,
                buf,
            });
        }

        // This is the file's current tail fragment.
        let osize = geo.fragroundup(geo.blkoff(ip.size));
        let nsize = geo.fragroundup(req.size);
        if nsize <= osize {
            let buf = maybe_read(cx, env, nb, osize, req)?;
            advance_size(ip, geo, lbn, req.size);
            return Ok(BlockHandle {
                addr: nb,
                size: osize,
                buf,
            });
        }

        // Capture the old contents before the allocator frees the old
        // fragment; the grown region's contents are undefined.
        let old_contents = if req.want_buffer {
            Some(env.cache.read(cx, nb, osize)?)
        } else {
            None
        };
        let newb = env
            .alloc
            .realloc_frag(cx, ip.ino, lbn, nb, osize, nsize, cred)?;
        env.deps
            .register_resize(ip.ino, lbn, Some(nb), newb, osize, nsize);
        ip.map.direct[slot] = newb.0;
        ip.frags += geo.numfrags(nsize - osize);
        advance_size(ip, geo, lbn, req.size);

        debug!(
            target: "ufs::balloc",
            ino = ip.ino.0,
            lbn = lbn.0,
            old_addr = nb.0,
            new_addr = newb.0,
            old_size = osize,
            new_size = nsize,
            "direct_fragment_grown"
        );

        let buf = old_contents.map(|old| {
            let mut bytes = old.into_inner();
            bytes.resize(
                usize::try_from(nsize).unwrap_or(bytes.len()),
                0,
            );
            BlockBuf::new(bytes)
        });
        return Ok(BlockHandle {
            addr: newb,
            size: nsize,
            buf,
        });
    }

    // Unallocated: a fragment while the block is still the file's tail,
    // a full block otherwise.
    let nsize = if ip.size < geo.lblktosize(LogicalBlock(lbn.0 + 1)) {
        geo.fragroundup(req.size)
    } else {
        bsize
    };
    let hint = ip.map.direct[..slot]
        .iter()
        .rev()
        .find(|p| **p != 0)
        .map(|p| PhysBlock(*p));
    let newb = env.alloc.alloc(cx, ip.ino, lbn, nsize, hint, cred)?;

    // Materialize the caller's buffer before touching the inode so a
    // cache failure frees the block and leaves no trace.
    let buf = match fresh_buffer(cx, env, newb, nsize, req) {
        Ok(buf) => buf,
        Err(err) => {
            env.alloc.free(cx, ip.ino, newb, nsize);
            return Err(err);
        }
    };

    env.deps.register_resize(ip.ino, lbn, None, newb, 0, nsize);
    ip.map.direct[slot] = newb.0;
    ip.frags += geo.numfrags(nsize);
    advance_size(ip, geo, lbn, req.size);

    debug!(
        target: "ufs::balloc",
        ino = ip.ino.0,
        lbn = lbn.0,
        addr = newb.0,
        size = nsize,
        "direct_block_allocated"
    );

    Ok(BlockHandle {
        addr: newb,
        size: nsize,
        buf,
    })
}

fn fresh_buffer(
    cx: &Cx,
    env: &BallocEnv<'_>,
    addr: PhysBlock,
    size: u64,
    req: &BallocRequest,
) -> Result<Option<BlockBuf>> {
    if req.flags.zero_fill {
        let zeroed = env.cache.get(cx, addr, size, true)?;
        env.cache
            .write(cx, addr, zeroed.as_slice(), data_write_mode(req.flags))?;
        Ok(Some(zeroed))
    } else {
        maybe_read(cx, env, addr, size, req)
    }
}
