//! First-fit block allocator over an instance's app heap.
//!
//! The app heap is a contiguous region of guest linear memory appended at
//! instantiation. [`GuestHeap`] only does the bookkeeping; bytes are read and
//! written through the instance's memory export.

use std::collections::BTreeMap;

/// Every block starts and ends on this boundary.
pub const BLOCK_ALIGN: u32 = 8;

/// Allocation statistics of a [`GuestHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Blocks currently allocated.
    pub live_blocks: usize,
    /// Bytes currently allocated, after rounding.
    pub bytes_in_use: u64,
    /// Total bytes managed.
    pub capacity: u64,
}

/// Free-list allocator over `[base, base + capacity)` in guest address space.
///
/// Guest address 0 is never handed out, so it can stand for "no block".
#[derive(Debug)]
pub struct GuestHeap {
    base: u32,
    capacity: u32,
    /// Free blocks by address, coalesced.
    free: BTreeMap<u32, u32>,
    /// Live blocks by address.
    live: BTreeMap<u32, u32>,
}

impl GuestHeap {
    /// Manage `len` bytes starting at guest address `base`.
    ///
    /// The region is shrunk to [`BLOCK_ALIGN`] boundaries and never includes
    /// address 0.
    pub fn new(base: u32, len: u32) -> Self {
        let end = base.saturating_add(len) & !(BLOCK_ALIGN - 1);
        let start = align_up(base.max(1)).unwrap_or(end).min(end);

        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }

        Self {
            base: start,
            capacity: end - start,
            free,
            live: BTreeMap::new(),
        }
    }

    /// First managed address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Allocate `size` bytes. Zero-sized requests still get a unique block.
    ///
    /// Returns `None` if no free block is large enough.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        let size = align_up(size.max(1))?;

        let (&address, &len) = self.free.iter().find(|&(_, &len)| len >= size)?;
        self.free.remove(&address);
        if len > size {
            self.free.insert(address + size, len - size);
        }
        self.live.insert(address, size);

        Some(address)
    }

    /// Free the block at `address`, returning its size.
    ///
    /// Returns `None` if no live block starts there.
    pub fn free(&mut self, address: u32) -> Option<u32> {
        let size = self.live.remove(&address)?;

        let mut start = address;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free.range(..address).next_back() {
            if prev + prev_len == address {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&(address + size)) {
            len += next_len;
        }

        self.free.insert(start, len);
        Some(size)
    }

    /// Size of the live block at `address`.
    pub fn block_size(&self, address: u32) -> Option<u32> {
        self.live.get(&address).copied()
    }

    /// Current statistics.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_blocks: self.live.len(),
            bytes_in_use: self.live.values().map(|&len| u64::from(len)).sum(),
            capacity: u64::from(self.capacity),
        }
    }
}

fn align_up(value: u32) -> Option<u32> {
    value
        .checked_add(BLOCK_ALIGN - 1)
        .map(|v| v & !(BLOCK_ALIGN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_hands_out_zero() {
        let mut heap = GuestHeap::new(0, 64);
        assert_eq!(heap.base(), 8);

        let first = heap.alloc(4).unwrap();
        assert_ne!(first, 0);
        assert_eq!(first % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_alloc_rounds_and_aligns() {
        let mut heap = GuestHeap::new(65536, 4096);

        let a = heap.alloc(3).unwrap();
        let b = heap.alloc(0).unwrap();
        let c = heap.alloc(17).unwrap();

        assert_eq!(a, 65536);
        assert_eq!(b, a + 8);
        assert_eq!(c, b + 8);
        assert_eq!(heap.block_size(c), Some(24));

        let stats = heap.stats();
        assert_eq!(stats.live_blocks, 3);
        assert_eq!(stats.bytes_in_use, 40);
        assert_eq!(stats.capacity, 4096);
    }

    #[test]
    fn test_exhaustion() {
        let mut heap = GuestHeap::new(1024, 32);

        assert!(heap.alloc(32).is_some());
        assert!(heap.alloc(1).is_none());
    }

    #[test]
    fn test_free_coalesces() {
        let mut heap = GuestHeap::new(1024, 48);

        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        let c = heap.alloc(16).unwrap();
        assert!(heap.alloc(8).is_none());

        assert_eq!(heap.free(a), Some(16));
        assert_eq!(heap.free(c), Some(16));
        assert_eq!(heap.free(b), Some(16));

        // Whole region is one block again
        assert_eq!(heap.alloc(48), Some(1024));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut heap = GuestHeap::new(1024, 64);
        let a = heap.alloc(8).unwrap();

        assert_eq!(heap.free(a), Some(8));
        assert_eq!(heap.free(a), None);
        assert_eq!(heap.free(4), None);
        assert_eq!(heap.stats().live_blocks, 0);
    }
}
