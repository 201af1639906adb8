//! Sliding-bitmap replay protection (RFC 6479 style).
//!
//! Tracks the highest nonce accepted on a receive direction and a ring of
//! bitmap words covering the nonces below it. A nonce's bit position is
//! fixed by its value, so advancing the window only clears the words being
//! recycled and never moves existing bits. Duplicates and nonces whose words
//! have been recycled are rejected; nonces ahead of the window advance it.
//! The floor is word-granular: the effective span varies between
//! `size - 63` and `size` nonces.

/// Default window span in nonces.
pub const DEFAULT_WINDOW_SIZE: usize = 2048;

/// Bounded record of recently-accepted nonces for one receive direction.
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>,
}

impl ReplayWindow {
    /// Creates a window spanning `size` nonces, rounded up to a multiple of 64.
    pub fn new(size: usize) -> Self {
        let words = size.max(64).div_ceil(64);
        Self {
            highest: 0,
            bitmap: vec![0u64; words],
        }
    }

    fn word_index(&self, nonce: u64) -> usize {
        ((nonce / 64) % self.bitmap.len() as u64) as usize
    }

    /// Whether the word holding `nonce` has been recycled for newer nonces.
    fn below_floor(&self, nonce: u64) -> bool {
        nonce / 64 + self.bitmap.len() as u64 <= self.highest / 64
    }

    /// Whether `nonce` would currently be accepted: not a duplicate and not
    /// below the window floor. Does not modify the window.
    pub fn permits(&self, nonce: u64) -> bool {
        if nonce > self.highest {
            return true;
        }
        if self.below_floor(nonce) {
            return false;
        }
        self.bitmap[self.word_index(nonce)] & (1u64 << (nonce % 64)) == 0
    }

    /// Marks `nonce` as seen. Call only after the message authenticated, so a
    /// forged ciphertext can never poison the window.
    pub fn record(&mut self, nonce: u64) {
        if nonce > self.highest {
            let current = self.highest / 64;
            let advanced = nonce / 64;
            if advanced - current >= self.bitmap.len() as u64 {
                self.bitmap.fill(0);
            } else {
                for word in (current + 1)..=advanced {
                    let index = (word % self.bitmap.len() as u64) as usize;
                    self.bitmap[index] = 0;
                }
            }
            self.highest = nonce;
        }
        if !self.below_floor(nonce) {
            let index = self.word_index(nonce);
            self.bitmap[index] |= 1u64 << (nonce % 64);
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
