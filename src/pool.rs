//! Pooled packet buffers
//!
//! Every in-flight packet lives in a fixed-capacity, page-sized buffer handed
//! out by a [`PacketPool`]. Acquisition takes a thread-local fast path (a
//! small per-thread cache) before falling back to the shared free list; if
//! both are empty a fresh buffer is allocated and a diagnostic counter is
//! incremented. Releasing into a full pool drops the buffer instead of
//! growing the pool, which bounds worst-case memory under load spikes.
//!
//! [`RcPacket`] is a reference-counted handle over a pooled buffer so one
//! tunnel packet can fan out to several peers; the buffer returns to its
//! origin pool when the last handle goes away.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::PoolError;

/// Size of every pooled buffer (one page)
pub const PACKET_CAPACITY: usize = 4096;

/// Per-thread cache size
const LOCAL_CACHE_LIMIT: usize = 8;

type Storage = Box<[u8; PACKET_CAPACITY]>;

struct PoolShared {
    max_pooled: usize,
    free: Mutex<VecDeque<Storage>>,
    allocations: AtomicU64,
}

impl PoolShared {
    fn push_shared(&self, storage: Storage) {
        let mut free = self.free.lock().expect("pool free list poisoned");
        if free.len() < self.max_pooled {
            free.push_back(storage);
        }
        // else: pool at capacity, let the buffer drop
    }
}

struct LocalCache {
    pool: Weak<PoolShared>,
    bufs: Vec<Storage>,
}

impl LocalCache {
    fn flush(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            for storage in self.bufs.drain(..) {
                pool.push_shared(storage);
            }
        } else {
            self.bufs.clear();
        }
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        // Thread exit: hand cached buffers back to the shared list
        self.flush();
    }
}

thread_local! {
    static LOCAL: RefCell<LocalCache> = RefCell::new(LocalCache {
        pool: Weak::new(),
        bufs: Vec::new(),
    });
}

/// A bounded pool of page-sized packet buffers. Cheap to clone.
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                max_pooled,
                free: Mutex::new(VecDeque::new()),
                allocations: AtomicU64::new(0),
            }),
        }
    }

    /// Take a buffer from the pool, allocating if it is empty.
    ///
    /// The returned buffer starts logically empty (`len() == 0`) and returns
    /// itself to this pool on drop.
    pub fn acquire(&self) -> PacketBuf {
        let cached = LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            if self.is_local_pool(&local) {
                local.bufs.pop()
            } else {
                // Cache belongs to another pool; give its buffers back
                local.flush();
                local.pool = Arc::downgrade(&self.shared);
                None
            }
        });

        let storage = cached
            .or_else(|| {
                self.shared
                    .free
                    .lock()
                    .expect("pool free list poisoned")
                    .pop_front()
            })
            .unwrap_or_else(|| {
                self.shared.allocations.fetch_add(1, Ordering::Relaxed);
                Box::new([0u8; PACKET_CAPACITY])
            });

        PacketBuf {
            storage: Some(storage),
            len: 0,
            pool: Arc::clone(&self.shared),
        }
    }

    fn is_local_pool(&self, cache: &LocalCache) -> bool {
        cache
            .pool
            .upgrade()
            .map(|p| Arc::ptr_eq(&p, &self.shared))
            .unwrap_or(false)
    }

    /// Buffers currently idle in the pool (shared list plus this thread's
    /// cache). Diagnostic only.
    pub fn pooled(&self) -> usize {
        let shared = self.shared.free.lock().expect("pool free list poisoned").len();
        let local = LOCAL.with(|local| {
            let local = local.borrow();
            if self.is_local_pool(&local) {
                local.bufs.len()
            } else {
                0
            }
        });
        shared + local
    }

    /// Total fresh allocations performed because the pool was empty
    pub fn allocations(&self) -> u64 {
        self.shared.allocations.load(Ordering::Relaxed)
    }
}

fn release(pool: &Arc<PoolShared>, storage: Storage) {
    let kept_locally = LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let same_pool = local
            .pool
            .upgrade()
            .map(|p| Arc::ptr_eq(&p, pool))
            .unwrap_or(false);
        if same_pool && local.bufs.len() < LOCAL_CACHE_LIMIT {
            local.bufs.push(storage);
            None
        } else {
            Some(storage)
        }
    });

    if let Some(storage) = kept_locally {
        pool.push_shared(storage);
    }
}

/// An exclusively-owned pooled buffer.
///
/// Dereferences to the `len()` bytes currently considered valid; the full
/// page is reachable through [`PacketBuf::space`] for reads from a socket or
/// tun device.
pub struct PacketBuf {
    storage: Option<Storage>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl PacketBuf {
    pub fn capacity(&self) -> usize {
        PACKET_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Mark the first `len` bytes as valid (after writing into `space()`)
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= PACKET_CAPACITY, "set_len beyond buffer capacity");
        self.len = len;
    }

    /// The whole page, for reads that fill the buffer
    pub fn space(&mut self) -> &mut [u8] {
        self.storage_mut().as_mut_slice()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let start = self.len;
        let end = start + data.len();
        if end > PACKET_CAPACITY {
            return Err(PoolError::Oversize {
                requested: end,
                capacity: PACKET_CAPACITY,
            });
        }
        self.storage_mut()[start..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    fn storage_mut(&mut self) -> &mut [u8; PACKET_CAPACITY] {
        self.storage.as_mut().expect("buffer present until drop")
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage.as_ref().expect("buffer present until drop")[..self.len]
    }
}

impl DerefMut for PacketBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[..len]
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            release(&self.pool, storage);
        }
    }
}

/// A reference-counted handle over a pooled packet.
///
/// `retain` hands out another handle over the same bytes; `close` releases
/// this handle's share immediately and fails on a second call rather than
/// corrupting the free list. The underlying buffer recycles once the last
/// handle is closed or dropped.
pub struct RcPacket {
    inner: Option<Arc<PacketBuf>>,
}

impl RcPacket {
    pub fn new(buf: PacketBuf) -> Self {
        Self {
            inner: Some(Arc::new(buf)),
        }
    }

    /// The packet bytes; empty once this handle has been closed
    pub fn data(&self) -> &[u8] {
        self.inner.as_ref().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Add a reference for another consumer
    pub fn retain(&self) -> Result<RcPacket, PoolError> {
        match &self.inner {
            Some(arc) => Ok(RcPacket {
                inner: Some(Arc::clone(arc)),
            }),
            None => Err(PoolError::AlreadyReleased),
        }
    }

    /// Release this handle's share of the packet
    pub fn close(&mut self) -> Result<(), PoolError> {
        match self.inner.take() {
            Some(_) => Ok(()),
            None => Err(PoolError::AlreadyReleased),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_acquire_release_cycle_conserves_pool() {
        let pool = PacketPool::new(32);

        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocations(), 5);
        drop(bufs);
        assert_eq!(pool.pooled(), 5);

        // Reacquiring reuses the pooled buffers without allocating
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocations(), 5);
        assert_eq!(pool.pooled(), 0);
        drop(bufs);
        assert_eq!(pool.pooled(), 5);
    }

    #[test]
    fn test_full_pool_drops_released_buffers() {
        let pool = PacketPool::new(2);

        // Overflow the thread-local cache limit so buffers hit the shared cap
        let bufs: Vec<_> = (0..LOCAL_CACHE_LIMIT + 6).map(|_| pool.acquire()).collect();
        drop(bufs);

        assert!(pool.pooled() <= LOCAL_CACHE_LIMIT + 2);
    }

    #[test]
    fn test_concurrent_cycles_do_not_leak() {
        let pool = PacketPool::new(64);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut buf = pool.acquire();
                        buf.extend_from_slice(&[0xAB; 64]).unwrap();
                        drop(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Nothing in flight: every allocated buffer is either pooled or was
        // deliberately dropped at the cap. Reacquiring pooled buffers must
        // not allocate.
        let idle = pool.pooled();
        let allocated_before = pool.allocations();
        let bufs: Vec<_> = (0..idle).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocations(), allocated_before);
        drop(bufs);
    }

    #[test]
    fn test_buffer_contents_roundtrip() {
        let pool = PacketPool::new(4);
        let mut buf = pool.acquire();

        assert!(buf.is_empty());
        buf.extend_from_slice(b"hello").unwrap();
        assert_eq!(&buf[..], b"hello");

        buf.space()[..4].copy_from_slice(b"spam");
        buf.set_len(4);
        assert_eq!(&buf[..], b"spam");
    }

    #[test]
    fn test_oversize_write_rejected() {
        let pool = PacketPool::new(4);
        let mut buf = pool.acquire();
        let huge = vec![0u8; PACKET_CAPACITY + 1];
        assert!(matches!(
            buf.extend_from_slice(&huge),
            Err(PoolError::Oversize { .. })
        ));
    }

    #[test]
    fn test_rc_packet_fan_out() {
        let pool = PacketPool::new(4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"broadcast me").unwrap();

        let mut first = RcPacket::new(buf);
        let mut second = first.retain().unwrap();

        first.close().unwrap();
        assert_eq!(pool.pooled(), 0, "still held by the second handle");
        assert_eq!(second.data(), b"broadcast me");

        second.close().unwrap();
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_double_close_is_an_error() {
        let pool = PacketPool::new(4);
        let mut packet = RcPacket::new(pool.acquire());

        packet.close().unwrap();
        assert!(matches!(packet.close(), Err(PoolError::AlreadyReleased)));
        assert!(packet.retain().is_err());
        assert_eq!(pool.pooled(), 1, "no double-free");
    }
}
