// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The shared packet buffer pool.
//!
//! Buffers are allocated once at environment initialization and recycled
//! through a multi-producer/multi-consumer ring: the poller takes them for
//! received frames, the membership engine takes them for transmissions, and
//! dropping a [`PktBuf`] from any thread returns its storage to the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ring::Queue;
use tracing::error;

/// Pool sizing, settable once through the environment-init command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total number of buffers.
    pub buffers: usize,
    /// Usable bytes per buffer, headroom included.
    pub buffer_size: usize,
    /// Bytes reserved in front of the frame data of a fresh buffer.
    pub headroom: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffers: 8192,
            buffer_size: 2048,
            headroom: 128,
        }
    }
}

struct PoolInner {
    buffer_size: usize,
    headroom: usize,
    free: Queue<Box<[u8]>>,
    available: AtomicUsize,
}

/// Handle to the buffer pool.  Cheap to clone; all clones share storage.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Allocate every buffer up front.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Pool {
        let free = Queue::new(config.buffers);
        for _ in 0..config.buffers {
            let storage = vec![0u8; config.buffer_size].into_boxed_slice();
            // Cannot fail: the ring holds at least `buffers` slots.
            if free.try_push_mp(storage).is_err() {
                unreachable!("pool ring smaller than buffer count");
            }
        }
        Pool {
            inner: Arc::new(PoolInner {
                buffer_size: config.buffer_size,
                headroom: config.headroom.min(config.buffer_size),
                free,
                available: AtomicUsize::new(config.buffers),
            }),
        }
    }

    /// Take a buffer, empty and with full headroom.  `None` when the pool
    /// is exhausted.
    #[must_use]
    pub fn try_alloc(&self) -> Option<PktBuf> {
        let storage = self.inner.free.try_pop_mc()?;
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        Some(PktBuf {
            storage: Some(storage),
            data_off: self.inner.headroom,
            data_len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently in the pool (not held by anyone).
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Usable bytes per buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// One pool buffer plus the data window inside it.
///
/// Dropping the buffer returns its storage to the pool, whichever thread
/// does it.
pub struct PktBuf {
    storage: Option<Box<[u8]>>,
    data_off: usize,
    data_len: usize,
    pool: Arc<PoolInner>,
}

impl PktBuf {
    fn storage(&self) -> &[u8] {
        // Present from allocation until drop.
        self.storage.as_deref().unwrap_or(&[])
    }

    /// Bytes in the data window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data_len
    }

    /// True when no frame data has been placed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Unused bytes in front of the data window.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Unused bytes behind the data window.
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.storage().len() - self.data_off - self.data_len
    }

    /// Grow the data window forward into the headroom, returning the newly
    /// exposed prefix.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8], BufError> {
        if len > self.data_off {
            return Err(BufError::NotEnoughHeadroom);
        }
        self.data_off -= len;
        self.data_len += len;
        let off = self.data_off;
        let storage = self
            .storage
            .as_deref_mut()
            .ok_or(BufError::NotEnoughHeadroom)?;
        Ok(&mut storage[off..off + len])
    }

    /// Append `bytes` to the data window.
    pub fn append_from(&mut self, bytes: &[u8]) -> Result<(), BufError> {
        if bytes.len() > self.tailroom() {
            return Err(BufError::NotEnoughTailroom);
        }
        let start = self.data_off + self.data_len;
        if let Some(storage) = self.storage.as_deref_mut() {
            storage[start..start + bytes.len()].copy_from_slice(bytes);
        }
        self.data_len += bytes.len();
        Ok(())
    }
}

impl AsRef<[u8]> for PktBuf {
    fn as_ref(&self) -> &[u8] {
        &self.storage()[self.data_off..self.data_off + self.data_len]
    }
}

impl std::fmt::Debug for PktBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktBuf")
            .field("off", &self.data_off)
            .field("len", &self.data_len)
            .finish()
    }
}

impl Drop for PktBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            if self.pool.free.try_push_mp(storage).is_err() {
                // The ring is sized for every buffer the pool ever made, so
                // this indicates a foreign buffer or double accounting.
                error!("buffer return overflowed the pool ring");
                return;
            }
            self.pool.available.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Buffer window manipulation failures.
#[derive(Debug, thiserror::Error)]
pub enum BufError {
    /// Not enough headroom in the buffer.
    #[error("not enough headroom in packet buffer")]
    NotEnoughHeadroom,
    /// Not enough tailroom in the buffer.
    #[error("not enough tailroom in packet buffer")]
    NotEnoughTailroom,
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_pool() -> Pool {
        Pool::new(&PoolConfig {
            buffers: 4,
            buffer_size: 256,
            headroom: 32,
        })
    }

    #[test]
    fn alloc_and_drop_round_trip() {
        let pool = small_pool();
        assert_eq!(pool.available(), 4);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_eq!(pool.available(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = small_pool();
        let held: Vec<_> = (0..4).map(|_| pool.try_alloc().unwrap()).collect();
        assert!(pool.try_alloc().is_none());
        drop(held);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn window_operations() {
        let pool = small_pool();
        let mut buf = pool.try_alloc().unwrap();
        assert_eq!(buf.headroom(), 32);
        assert!(buf.is_empty());

        buf.append_from(b"payload").unwrap();
        assert_eq!(buf.as_ref(), b"payload");

        let header = buf.prepend(4).unwrap();
        header.copy_from_slice(b"hdr!");
        assert_eq!(buf.as_ref(), b"hdr!payload");
        assert_eq!(buf.headroom(), 28);

        assert!(buf.prepend(100).is_err());
        let big = vec![0u8; 400];
        assert!(matches!(
            buf.append_from(&big),
            Err(BufError::NotEnoughTailroom)
        ));
    }

    #[test]
    fn cross_thread_return() {
        let pool = small_pool();
        let buf = pool.try_alloc().unwrap();
        let handle = std::thread::spawn(move || drop(buf));
        handle.join().unwrap();
        assert_eq!(pool.available(), 4);
    }
}
