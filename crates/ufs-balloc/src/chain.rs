//! Chain walker: indirect-block allocation.
//!
//! Walks the indirect chain for a logical block past the direct range,
//! allocating the root indirect block, any missing intermediate indirect
//! blocks, and finally the data block. Newly allocated indirect blocks
//! are zero-filled and made durable (or handed to the dependency tracker)
//! before the pointer naming them is persisted, so an interrupted call
//! never leaves a reachable pointer to uninitialized metadata.
//!
//! Every allocation and speculative pointer write is recorded in the
//! unwind context; any failure hands the context to the rollback manager
//! and surfaces the original error (or escalates if rollback itself
//! fails).

use crate::plan::{indir_plan, IndirPlan};
use crate::unwind::{rollback_or_escalate, ParentSlot, Unwind};
use crate::{
    advance_size, corrupt, data_write_mode, maybe_read, meta_write_mode, BallocEnv, BallocRequest,
    BlockHandle, Credentials, IndirParent,
};
use asupersync::Cx;
use tracing::debug;
use ufs_error::Result;
use ufs_types::{Inode, LogicalBlock, PhysBlock, PtrWidth};

pub(crate) fn alloc_chain<W: PtrWidth>(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    req: &BallocRequest,
    lbn: LogicalBlock,
) -> Result<BlockHandle> {
    let plan = indir_plan(env.geo.pointers_per_block(W::BYTES), lbn)?;
    let mut ctx = Unwind::new(ip);

    match walk::<W>(cx, env, ip, cred, req, lbn, &plan, &mut ctx) {
        Ok(handle) => Ok(handle),
        Err(err) if ctx.is_empty() => Err(err),
        Err(err) => Err(rollback_or_escalate::<W>(cx, env, ip, cred, &ctx, err)),
    }
}

#[allow(clippy::too_many_arguments)]
fn walk<W: PtrWidth>(
    cx: &Cx,
    env: &BallocEnv<'_>,
    ip: &mut Inode,
    cred: &Credentials,
    req: &BallocRequest,
    lbn: LogicalBlock,
    plan: &IndirPlan,
    ctx: &mut Unwind,
) -> Result<BlockHandle> {
    let geo = env.geo;
    let bsize = geo.block_size();
    let meta_mode = meta_write_mode(env, req.flags);

    // Step 0: the root indirect pointer lives in the inode itself.
    let mut parent = PhysBlock(ip.map.indirect[plan.root_slot]);
    if parent.is_null() {
        let hint = root_hint(ip);
        let newb = env.alloc.alloc(cx, ip.ino, lbn, bsize, hint, cred)?;
        ctx.record_alloc(newb, bsize);

        // Child durable (or tracked) before its pointer exists anywhere.
        let buf = env.cache.get(cx, newb, bsize, true)?;
        env.cache.write(cx, newb, buf.as_slice(), meta_mode)?;
        env.deps.register_new_indirect(
            ip.ino,
            lbn,
            newb,
            IndirParent::Inode {
                slot: plan.root_slot,
            },
        );
        ip.map.indirect[plan.root_slot] = newb.0;
        ctx.record_parent(ParentSlot::InodeRoot {
            slot: plan.root_slot,
        });
        ip.frags += geo.frags_per_block();

        debug!(
            target: "ufs::balloc",
            ino = ip.ino.0,
            lbn = lbn.0,
            level = 0_usize,
            addr = newb.0,
            "indirect_root_allocated"
        );
        parent = newb;
    }

    // Descend level by level; the last offset indexes the data block.
    for (level, &off) in plan.offsets[..plan.depth].iter().enumerate() {
        let is_leaf = level == plan.depth - 1;

        if is_leaf && req.flags.metadata_only {
            // Placement probe: the caller wants the last indirect block,
            // not a materialized data block.
            let buf = env.cache.read(cx, parent, bsize)?;
            return Ok(BlockHandle {
                addr: parent,
                size: bsize,
                buf: Some(buf),
            });
        }

        let mut pbuf = env.cache.read(cx, parent, bsize)?;
        let existing = W::get(pbuf.as_slice(), off).map_err(|e| corrupt(parent, e))?;
        if existing != 0 {
            let child = PhysBlock(existing);
            if is_leaf {
                let buf = maybe_read(cx, env, child, bsize, req)?;
                advance_size(ip, geo, lbn, req.size);
                return Ok(BlockHandle {
                    addr: child,
                    size: bsize,
                    buf,
                });
            }
            parent = child;
            continue;
        }

        // Missing link: allocate it, then persist the pointer.
        let hint = slot_hint::<W>(pbuf.as_slice(), off).unwrap_or(parent);
        let newb = env
            .alloc
            .alloc(cx, ip.ino, lbn, bsize, Some(hint), cred)?;
        ctx.record_alloc(newb, bsize);

        if is_leaf {
            if req.flags.zero_fill {
                let zeroed = env.cache.get(cx, newb, bsize, true)?;
                env.cache
                    .write(cx, newb, zeroed.as_slice(), data_write_mode(req.flags))?;
            }
        } else {
            let zeroed = env.cache.get(cx, newb, bsize, true)?;
            env.cache.write(cx, newb, zeroed.as_slice(), meta_mode)?;
        }

        W::put(pbuf.as_mut_slice(), off, newb.0).map_err(|e| corrupt(parent, e))?;
        env.deps.register_new_indirect(
            ip.ino,
            lbn,
            newb,
            IndirParent::Meta { addr: parent, slot: off },
        );
        env.cache.write(cx, parent, pbuf.as_slice(), meta_mode)?;
        ctx.record_parent(ParentSlot::Meta { addr: parent, slot: off });
        ip.frags += geo.frags_per_block();

        debug!(
            target: "ufs::balloc",
            ino = ip.ino.0,
            lbn = lbn.0,
            level = level + 1,
            parent = parent.0,
            slot = off,
            addr = newb.0,
            leaf = is_leaf,
            "chain_block_allocated"
        );

        if is_leaf {
            advance_size(ip, geo, lbn, req.size);
            let buf = if req.flags.zero_fill {
                Some(env.cache.get(cx, newb, bsize, true)?)
            } else {
                maybe_read(cx, env, newb, bsize, req)?
            };
            return Ok(BlockHandle {
                addr: newb,
                size: bsize,
                buf,
            });
        }
        parent = newb;
    }

    unreachable!("indirection plan always has at least one level")
}

/// Placement hint for a new root indirect block: stay near the file's
/// most recently placed metadata, falling back to its last direct block.
fn root_hint(ip: &Inode) -> Option<PhysBlock> {
    ip.map
        .indirect
        .iter()
        .rev()
        .chain(ip.map.direct.iter().rev())
        .find(|p| **p != 0)
        .map(|p| PhysBlock(*p))
}

/// Placement hint for a new child: the nearest preceding allocated
/// pointer in the same indirect block.
fn slot_hint<W: PtrWidth>(pbuf: &[u8], off: u64) -> Option<PhysBlock> {
    (0..off)
        .rev()
        .find_map(|idx| match W::get(pbuf, idx) {
            Ok(p) if p != 0 => Some(PhysBlock(p)),
            _ => None,
        })
}
