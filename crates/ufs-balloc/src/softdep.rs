//! Dependency-tracker capability.
//!
//! The write-ordering subsystem (soft updates in the original design) may
//! defer and reorder physical writes as long as a newly allocated block is
//! durable before any pointer to it. The engine calls the tracker
//! unconditionally; when none is configured, [`SyncWrites`] reports that
//! it does not track ordering and the engine enforces the invariant itself
//! by writing synchronously, child before parent.

use ufs_types::{InodeNumber, LogicalBlock, PhysBlock};

/// Where a newly allocated block's pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirParent {
    /// One of the inode's indirect-root slots (0 = single, 1 = double,
    /// 2 = triple).
    Inode { slot: usize },
    /// A slot inside an indirect block.
    Meta { addr: PhysBlock, slot: u64 },
}

/// Write-ordering tracker for speculative block-map mutation.
pub trait DependencyTracker: Send + Sync {
    /// Whether this tracker guarantees child-before-parent durability for
    /// registered relationships. When `false`, the engine performs
    /// synchronous writes instead.
    fn tracks_ordering(&self) -> bool;

    /// A new block (indirect or leaf data) was allocated and its pointer
    /// stored at `parent`. The block's previous pointer value was zero.
    fn register_new_indirect(
        &self,
        ino: InodeNumber,
        lbn: LogicalBlock,
        child: PhysBlock,
        parent: IndirParent,
    );

    /// A direct block was allocated or resized in place in the inode's
    /// direct-pointer array. `old_addr` is `None` for a fresh allocation.
    fn register_resize(
        &self,
        ino: InodeNumber,
        lbn: LogicalBlock,
        old_addr: Option<PhysBlock>,
        new_addr: PhysBlock,
        old_size: u64,
        new_size: u64,
    );
}

/// Null tracker: no ordering bookkeeping, so every ordering-sensitive
/// write the engine performs becomes synchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncWrites;

impl DependencyTracker for SyncWrites {
    fn tracks_ordering(&self) -> bool {
        false
    }

    fn register_new_indirect(
        &self,
        _ino: InodeNumber,
        _lbn: LogicalBlock,
        _child: PhysBlock,
        _parent: IndirParent,
    ) {
    }

    fn register_resize(
        &self,
        _ino: InodeNumber,
        _lbn: LogicalBlock,
        _old_addr: Option<PhysBlock>,
        _new_addr: PhysBlock,
        _old_size: u64,
        _new_size: u64,
    ) {
    }
}
