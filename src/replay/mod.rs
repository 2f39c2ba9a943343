//! Replay protection
//!
//! Two filters: a bit-ring sliding window over monotone packet ids
//! (per UDP session) and a time-bounded accept-once pool for handshake
//! salts and auth ids (shared across connections).

use dashmap::DashMap;

const BLOCK_BIT_LOG: u64 = 6;
const BLOCK_BITS: u64 = 64;
const RING_BLOCKS: u64 = 128;
const BLOCK_MASK: u64 = RING_BLOCKS - 1;
const BIT_MASK: u64 = BLOCK_BITS - 1;
/// Distance below `last` that is still representable in the ring
const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;

/// Accept-once filter over 64-bit packet ids.
///
/// A fixed ring of 128 64-bit blocks tracks the 8128 ids below the
/// highest id seen. This is deliberately not a set: memory stays O(1)
/// no matter how fast ids grow.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    last: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for SlidingWindow {
    fn default() -> Self {
        SlidingWindow {
            last: 0,
            ring: [0; RING_BLOCKS as usize],
        }
    }
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `counter` would be accepted. No side effects.
    pub fn check(&self, counter: u64) -> bool {
        if counter > self.last {
            return true;
        }
        if self.last - counter > WINDOW_SIZE {
            return false;
        }
        let block = self.ring[((counter >> BLOCK_BIT_LOG) & BLOCK_MASK) as usize];
        (block >> (counter & BIT_MASK)) & 1 == 0
    }

    /// Record `counter` as seen. Callers must `check` first.
    pub fn add(&mut self, counter: u64) {
        if counter > self.last {
            let mut diff = (counter >> BLOCK_BIT_LOG) - (self.last >> BLOCK_BIT_LOG);
            if diff > RING_BLOCKS {
                diff = RING_BLOCKS;
            }
            for i in 1..=diff {
                let index = (((self.last >> BLOCK_BIT_LOG) + i) & BLOCK_MASK) as usize;
                self.ring[index] = 0;
            }
            self.last = counter;
        }
        self.ring[((counter >> BLOCK_BIT_LOG) & BLOCK_MASK) as usize] |= 1 << (counter & BIT_MASK);
    }
}

/// Time-bounded accept-once pool for salts and auth ids.
///
/// Thread-safe; expired entries are pruned on insert.
pub struct SaltPool {
    window: u64,
    entries: DashMap<Vec<u8>, u64>,
}

impl SaltPool {
    /// `window` is the retention period in seconds.
    pub fn new(window: u64) -> Self {
        SaltPool {
            window,
            entries: DashMap::new(),
        }
    }

    /// Register a salt. Returns false if it was already seen inside the
    /// retention window.
    pub fn insert(&self, salt: &[u8], now: u64) -> bool {
        let expiry_floor = now.saturating_sub(self.window);
        self.entries.retain(|_, seen| *seen > expiry_floor);

        if let Some(seen) = self.entries.get(salt) {
            if *seen > expiry_floor {
                return false;
            }
        }
        self.entries.insert(salt.to_vec(), now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_is_idempotent() {
        let mut window = SlidingWindow::new();
        assert!(window.check(10));
        assert!(window.check(10));
        window.add(10);
        assert!(!window.check(10));
        assert!(window.check(11));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = SlidingWindow::new();
        window.add(1000);
        for id in [999, 500, 0] {
            assert!(window.check(id), "id {} should be fresh", id);
            window.add(id);
            assert!(!window.check(id));
        }
    }

    #[test]
    fn test_too_old_rejected() {
        let mut window = SlidingWindow::new();
        window.add(10_000);
        assert!(!window.check(10_000 - WINDOW_SIZE - 1));
    }

    #[test]
    fn test_advance_clears_passed_blocks() {
        let mut window = SlidingWindow::new();
        window.add(5);
        // Jump far enough that the old block is recycled.
        window.add(5 + RING_BLOCKS * BLOCK_BITS);
        // Counter 5 now falls outside the window.
        assert!(!window.check(5));
        // A fresh id in the recycled region right below last is accepted.
        assert!(window.check(5 + RING_BLOCKS * BLOCK_BITS - 1));
    }

    #[test]
    fn test_salt_pool_rejects_repeat() {
        let pool = SaltPool::new(60);
        assert!(pool.insert(b"salt-a", 100));
        assert!(!pool.insert(b"salt-a", 130));
        assert!(pool.insert(b"salt-b", 130));
    }

    #[test]
    fn test_salt_pool_expires() {
        let pool = SaltPool::new(60);
        assert!(pool.insert(b"salt-a", 100));
        assert!(pool.insert(b"salt-a", 161));
        // The stale entry for salt-a was replaced, not duplicated.
        assert_eq!(pool.len(), 1);
    }
}
