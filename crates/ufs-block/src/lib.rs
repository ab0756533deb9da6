#![forbid(unsafe_code)]
//! Buffer-cache interface for the oxufs allocation engine.
//!
//! The engine never touches the disk directly; it reads and writes
//! fragment-addressed buffers through the [`BufCache`] trait. Writes carry
//! an explicit [`WriteMode`] so the caller (or a dependency tracker)
//! controls whether a write blocks until durable or is scheduled as
//! delayed. [`MemBufCache`] is the in-memory implementation used by tests
//! and harnesses.

use asupersync::Cx;
use parking_lot::Mutex;
use std::collections::HashMap;
use ufs_error::{Result, UfsError};
use ufs_types::PhysBlock;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| UfsError::Cancelled)
}

/// Owned buffer for one block or fragment run.
///
/// Invariant: length equals the size that was requested from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// How a write leaves the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Block until the write is durable.
    Sync,
    /// Schedule the write; durability is the flush path's (or the
    /// dependency tracker's) problem.
    Delayed,
}

/// Fragment-addressed buffer cache.
///
/// `addr` is a physical fragment address; `size` is a byte count that is a
/// whole number of fragments (up to one full block). Implementations may
/// block the calling thread on I/O or cache-internal locks.
pub trait BufCache: Send + Sync {
    /// Read `size` bytes at `addr` from the cache or the device.
    fn read(&self, cx: &Cx, addr: PhysBlock, size: u64) -> Result<BlockBuf>;

    /// Obtain a buffer for `addr` without reading the device: the caller
    /// is about to overwrite it. `zero_fill` returns zeroed contents
    /// instead of whatever the cache holds.
    fn get(&self, cx: &Cx, addr: PhysBlock, size: u64, zero_fill: bool) -> Result<BlockBuf>;

    /// Write `data` at `addr`.
    fn write(&self, cx: &Cx, addr: PhysBlock, data: &[u8], mode: WriteMode) -> Result<()>;
}

/// In-memory [`BufCache`]: a map from fragment address to contents.
///
/// Absent addresses read as zeroes, matching a freshly zeroed image.
#[derive(Debug, Default)]
pub struct MemBufCache {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBufCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every address currently holding written data.
    #[must_use]
    pub fn written_addrs(&self) -> Vec<u64> {
        let mut addrs: Vec<u64> = self.blocks.lock().keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }
}

fn size_to_len(size: u64) -> Result<usize> {
    usize::try_from(size)
        .map_err(|_| UfsError::InvalidGeometry(format!("buffer size {size} does not fit usize")))
}

impl BufCache for MemBufCache {
    fn read(&self, cx: &Cx, addr: PhysBlock, size: u64) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let len = size_to_len(size)?;
        let blocks = self.blocks.lock();
        let mut bytes = vec![0_u8; len];
        if let Some(stored) = blocks.get(&addr.0) {
            let n = stored.len().min(len);
            bytes[..n].copy_from_slice(&stored[..n]);
        }
        drop(blocks);
        Ok(BlockBuf::new(bytes))
    }

    fn get(&self, cx: &Cx, addr: PhysBlock, size: u64, zero_fill: bool) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let len = size_to_len(size)?;
        if zero_fill {
            return Ok(BlockBuf::zeroed(len));
        }
        self.read(cx, addr, size)
    }

    fn write(&self, cx: &Cx, addr: PhysBlock, data: &[u8], _mode: WriteMode) -> Result<()> {
        cx_checkpoint(cx)?;
        self.blocks.lock().insert(addr.0, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_blocks_read_as_zero() {
        let cx = Cx::for_testing();
        let cache = MemBufCache::new();
        let buf = cache.read(&cx, PhysBlock(40), 4096).expect("read");
        assert_eq!(buf.len(), 4096);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let cx = Cx::for_testing();
        let cache = MemBufCache::new();
        cache
            .write(&cx, PhysBlock(8), &[7_u8; 1024], WriteMode::Sync)
            .expect("write");
        let buf = cache.read(&cx, PhysBlock(8), 1024).expect("read");
        assert_eq!(buf.as_slice(), &[7_u8; 1024]);
        assert_eq!(cache.written_addrs(), vec![8]);
    }

    #[test]
    fn get_zero_fill_ignores_stored_contents() {
        let cx = Cx::for_testing();
        let cache = MemBufCache::new();
        cache
            .write(&cx, PhysBlock(16), &[0xAA_u8; 512], WriteMode::Delayed)
            .expect("write");
        let buf = cache.get(&cx, PhysBlock(16), 512, true).expect("get");
        assert!(buf.as_slice().iter().all(|b| *b == 0));

        let buf = cache.get(&cx, PhysBlock(16), 512, false).expect("get");
        assert_eq!(buf.as_slice(), &[0xAA_u8; 512]);
    }
}
