//! Shared test doubles for the allocation-engine integration tests.

#![allow(dead_code)]

use asupersync::Cx;
use parking_lot::Mutex;
use std::sync::Arc;
use ufs_balloc::{BallocEnv, BlockAllocator, Credentials, DependencyTracker, IndirParent, QuotaSink};
use ufs_block::{BlockBuf, BufCache, MemBufCache, WriteMode};
use ufs_error::{Result, UfsError};
use ufs_types::{
    Inode, InodeFormat, InodeNumber, LogicalBlock, PhysBlock, PtrWidth, Ufs1, Ufs2, UfsGeometry,
};

/// Bump allocator over a shared in-memory cache. Hands out monotonically
/// increasing fragment addresses and keeps a ledger of every allocation
/// and free so tests can assert block conservation.
pub struct MockAlloc {
    cache: Arc<MemBufCache>,
    frag_size: u64,
    state: Mutex<AllocState>,
}

#[derive(Default)]
struct AllocState {
    next: u64,
    calls: u64,
    fail_after: Option<u64>,
    allocated: Vec<(u64, u64)>,
    freed: Vec<(u64, u64)>,
    realloc_calls: u64,
}

impl MockAlloc {
    pub fn new(cache: Arc<MemBufCache>, geo: UfsGeometry) -> Self {
        Self {
            cache,
            frag_size: geo.frag_size(),
            state: Mutex::new(AllocState {
                // Address 0 means "unallocated"; never hand it out.
                next: 8,
                ..AllocState::default()
            }),
        }
    }

    /// Let the first `n` allocator calls (alloc and realloc both count)
    /// succeed and fail every later one with `NoSpace`.
    pub fn fail_after(&self, n: u64) {
        self.state.lock().fail_after = Some(n);
    }

    /// Force the next handed-out address, e.g. one too wide for a 32-bit
    /// on-disk pointer.
    pub fn set_next_addr(&self, addr: u64) {
        self.state.lock().next = addr;
    }

    pub fn allocated(&self) -> Vec<(u64, u64)> {
        self.state.lock().allocated.clone()
    }

    pub fn freed(&self) -> Vec<(u64, u64)> {
        self.state.lock().freed.clone()
    }

    pub fn realloc_calls(&self) -> u64 {
        self.state.lock().realloc_calls
    }

    /// Allocations not yet returned by `free`, in allocation order.
    pub fn outstanding(&self) -> Vec<(u64, u64)> {
        let state = self.state.lock();
        state
            .allocated
            .iter()
            .filter(|entry| !state.freed.contains(entry))
            .copied()
            .collect()
    }

    fn take_addr(&self, size: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if state.fail_after.is_some_and(|n| state.calls >= n) {
            state.calls += 1;
            return Err(UfsError::NoSpace);
        }
        state.calls += 1;
        let addr = state.next;
        state.next += size.div_ceil(self.frag_size);
        state.allocated.push((addr, size));
        Ok(addr)
    }
}

impl BlockAllocator for MockAlloc {
    fn alloc(
        &self,
        _cx: &Cx,
        _ino: InodeNumber,
        _lbn: LogicalBlock,
        size: u64,
        _hint: Option<PhysBlock>,
        _cred: &Credentials,
    ) -> Result<PhysBlock> {
        Ok(PhysBlock(self.take_addr(size)?))
    }

    fn realloc_frag(
        &self,
        cx: &Cx,
        ino: InodeNumber,
        _lbn: LogicalBlock,
        old: PhysBlock,
        old_size: u64,
        new_size: u64,
        _cred: &Credentials,
    ) -> Result<PhysBlock> {
        self.state.lock().realloc_calls += 1;
        let addr = PhysBlock(self.take_addr(new_size)?);
        // Always relocate; the contract only promises content preservation.
        let old_contents = self.cache.read(cx, old, old_size)?;
        let mut bytes = old_contents.into_inner();
        bytes.resize(usize::try_from(new_size).expect("size fits usize"), 0);
        self.cache.write(cx, addr, &bytes, WriteMode::Delayed)?;
        self.free(cx, ino, old, old_size);
        Ok(addr)
    }

    fn free(&self, _cx: &Cx, _ino: InodeNumber, addr: PhysBlock, size: u64) {
        self.state.lock().freed.push((addr.0, size));
    }
}

/// Dependency-tracker double that records every registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepEvent {
    NewIndirect {
        lbn: u64,
        child: u64,
        parent: IndirParent,
    },
    Resize {
        lbn: u64,
        old_addr: Option<u64>,
        new_addr: u64,
        old_size: u64,
        new_size: u64,
    },
}

pub struct RecordingTracker {
    ordering: bool,
    events: Mutex<Vec<DepEvent>>,
}

impl RecordingTracker {
    pub fn new(tracks_ordering: bool) -> Self {
        Self {
            ordering: tracks_ordering,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DepEvent> {
        self.events.lock().clone()
    }
}

impl DependencyTracker for RecordingTracker {
    fn tracks_ordering(&self) -> bool {
        self.ordering
    }

    fn register_new_indirect(
        &self,
        _ino: InodeNumber,
        lbn: LogicalBlock,
        child: PhysBlock,
        parent: IndirParent,
    ) {
        self.events.lock().push(DepEvent::NewIndirect {
            lbn: lbn.0,
            child: child.0,
            parent,
        });
    }

    fn register_resize(
        &self,
        _ino: InodeNumber,
        lbn: LogicalBlock,
        old_addr: Option<PhysBlock>,
        new_addr: PhysBlock,
        old_size: u64,
        new_size: u64,
    ) {
        self.events.lock().push(DepEvent::Resize {
            lbn: lbn.0,
            old_addr: old_addr.map(|a| a.0),
            new_addr: new_addr.0,
            old_size,
            new_size,
        });
    }
}

/// Quota double: records every charge, optionally failing all of them.
#[derive(Default)]
pub struct MockQuota {
    fail: Mutex<bool>,
    charges: Mutex<Vec<i64>>,
}

impl MockQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all(&self) {
        *self.fail.lock() = true;
    }

    pub fn charges(&self) -> Vec<i64> {
        self.charges.lock().clone()
    }
}

impl QuotaSink for MockQuota {
    fn charge(&self, _cred: &Credentials, delta_frags: i64) -> Result<()> {
        self.charges.lock().push(delta_frags);
        if *self.fail.lock() {
            return Err(UfsError::QuotaExceeded);
        }
        Ok(())
    }
}

/// Cache wrapper that fails programmable write/read ordinals (1-based)
/// and logs every attempted write with its mode.
pub struct FailingCache {
    inner: Arc<MemBufCache>,
    state: Mutex<FailState>,
}

#[derive(Default)]
struct FailState {
    writes_seen: u64,
    reads_seen: u64,
    fail_write_at: Option<u64>,
    fail_writes_from: Option<u64>,
    fail_read_at: Option<u64>,
    write_log: Vec<(u64, WriteMode)>,
}

impl FailingCache {
    pub fn new(inner: Arc<MemBufCache>) -> Self {
        Self {
            inner,
            state: Mutex::new(FailState::default()),
        }
    }

    pub fn fail_write_at(&self, ordinal: u64) {
        self.state.lock().fail_write_at = Some(ordinal);
    }

    /// Fail the given write and every write after it, including the
    /// synchronous writes rollback performs.
    pub fn fail_writes_from(&self, ordinal: u64) {
        self.state.lock().fail_writes_from = Some(ordinal);
    }

    pub fn fail_read_at(&self, ordinal: u64) {
        self.state.lock().fail_read_at = Some(ordinal);
    }

    pub fn write_log(&self) -> Vec<(u64, WriteMode)> {
        self.state.lock().write_log.clone()
    }

    fn io_err() -> UfsError {
        UfsError::Io(std::io::Error::other("injected device failure"))
    }
}

impl BufCache for FailingCache {
    fn read(&self, cx: &Cx, addr: PhysBlock, size: u64) -> Result<BlockBuf> {
        {
            let mut state = self.state.lock();
            state.reads_seen += 1;
            if state.fail_read_at == Some(state.reads_seen) {
                return Err(Self::io_err());
            }
        }
        self.inner.read(cx, addr, size)
    }

    fn get(&self, cx: &Cx, addr: PhysBlock, size: u64, zero_fill: bool) -> Result<BlockBuf> {
        self.inner.get(cx, addr, size, zero_fill)
    }

    fn write(&self, cx: &Cx, addr: PhysBlock, data: &[u8], mode: WriteMode) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.writes_seen += 1;
            state.write_log.push((addr.0, mode));
            let n = state.writes_seen;
            if state.fail_write_at == Some(n)
                || state.fail_writes_from.is_some_and(|from| n >= from)
            {
                return Err(Self::io_err());
            }
        }
        self.inner.write(cx, addr, data, mode)
    }
}

/// One fully wired engine environment over in-memory collaborators.
pub struct Harness {
    pub geo: UfsGeometry,
    pub cache: Arc<MemBufCache>,
    pub alloc: MockAlloc,
    pub deps: RecordingTracker,
    pub quota: MockQuota,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tracker(false)
    }

    pub fn with_tracker(tracks_ordering: bool) -> Self {
        let geo = UfsGeometry::new(4096, 512).expect("geometry");
        let cache = Arc::new(MemBufCache::new());
        let alloc = MockAlloc::new(Arc::clone(&cache), geo);
        Self {
            geo,
            cache,
            alloc,
            deps: RecordingTracker::new(tracks_ordering),
            quota: MockQuota::new(),
        }
    }

    pub fn env(&self) -> BallocEnv<'_> {
        BallocEnv {
            geo: self.geo,
            alloc: &self.alloc,
            cache: self.cache.as_ref(),
            deps: &self.deps,
            quota: &self.quota,
        }
    }

    pub fn env_with_cache<'a>(&'a self, cache: &'a dyn BufCache) -> BallocEnv<'a> {
        BallocEnv {
            geo: self.geo,
            alloc: &self.alloc,
            cache,
            deps: &self.deps,
            quota: &self.quota,
        }
    }
}

/// Every physical address reachable from the inode's block map, indirect
/// blocks included, found by walking pointers through the cache.
pub fn reachable_addrs(cx: &Cx, cache: &MemBufCache, geo: UfsGeometry, ip: &Inode) -> Vec<u64> {
    let mut out = Vec::new();
    for &p in &ip.map.direct {
        if p != 0 {
            out.push(p);
        }
    }
    for (slot, &root) in ip.map.indirect.iter().enumerate() {
        if root == 0 {
            continue;
        }
        out.push(root);
        walk_indirect(cx, cache, geo, ip.format, root, slot + 1, &mut out);
    }
    out
}

fn walk_indirect(
    cx: &Cx,
    cache: &MemBufCache,
    geo: UfsGeometry,
    format: InodeFormat,
    addr: u64,
    levels_below: usize,
    out: &mut Vec<u64>,
) {
    let buf = cache
        .read(cx, PhysBlock(addr), geo.block_size())
        .expect("read indirect block");
    let ptr_bytes = match format {
        InodeFormat::Ufs1 => Ufs1::BYTES,
        InodeFormat::Ufs2 => Ufs2::BYTES,
    };
    for idx in 0..geo.pointers_per_block(ptr_bytes) {
        let p = match format {
            InodeFormat::Ufs1 => Ufs1::get(buf.as_slice(), idx),
            InodeFormat::Ufs2 => Ufs2::get(buf.as_slice(), idx),
        }
        .expect("pointer in range");
        if p == 0 {
            continue;
        }
        out.push(p);
        if levels_below > 1 {
            walk_indirect(cx, cache, geo, format, p, levels_below - 1, out);
        }
    }
}

pub fn fresh_inode(format: InodeFormat) -> Inode {
    Inode::new(InodeNumber(42), format)
}
