//! Fixed-capacity packet buffer pool shared by every worker.
//!
//! Buffers are pre-allocated at creation and recycled through a mutex-guarded
//! free list. A [`Packet`] hands its buffer back when dropped, so releasing a
//! packet twice cannot be expressed.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::PacketMeta;

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total number of buffers.
    pub capacity: usize,
    /// Buffers currently held by packets.
    pub in_use: usize,
    /// Successful allocations since creation.
    pub allocs: u64,
    /// Buffers returned since creation.
    pub frees: u64,
    /// Allocation requests refused (pool empty or length too large).
    pub failures: u64,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    seg_len: usize,
    capacity: usize,
    in_use: AtomicUsize,
    allocs: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,
}

impl PoolInner {
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(buf);
        drop(free);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-safe pool of packet buffers. Cloning yields another handle to the
/// same pool.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create a pool of `num` buffers, each able to hold `seg_len` bytes.
    pub fn new(num: usize, seg_len: usize) -> Self {
        let free = (0..num).map(|_| Vec::with_capacity(seg_len)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                seg_len,
                capacity: num,
                in_use: AtomicUsize::new(0),
                allocs: AtomicU64::new(0),
                frees: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Largest packet length a buffer can hold.
    pub fn seg_len(&self) -> usize {
        self.inner.seg_len
    }

    /// Allocate a zero-filled packet of `len` bytes.
    ///
    /// Returns `None` when the pool is exhausted or `len` exceeds the
    /// buffer size.
    pub fn alloc(&self, len: usize) -> Option<Packet> {
        if len > self.inner.seg_len {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let buf = {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        let Some(mut buf) = buf else {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        buf.resize(len, 0);
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        self.inner.allocs.fetch_add(1, Ordering::Relaxed);
        Some(Packet {
            data: buf,
            meta: PacketMeta::default(),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Copy `src` (bytes and metadata) into a freshly allocated packet.
    pub fn copy(&self, src: &Packet) -> Option<Packet> {
        let mut pkt = self.alloc(src.len())?;
        pkt.data.copy_from_slice(&src.data);
        pkt.meta = src.meta;
        Some(pkt)
    }

    /// Current usage counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            in_use: self.inner.in_use.load(Ordering::Relaxed),
            allocs: self.inner.allocs.load(Ordering::Relaxed),
            frees: self.inner.frees.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("seg_len", &self.inner.seg_len)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A packet buffer borrowed from a [`PacketPool`].
pub struct Packet {
    data: Vec<u8>,
    meta: PacketMeta,
    pool: Arc<PoolInner>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrink the packet to `len` bytes (no-op if already shorter).
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}
