//! Tokenized concurrent bitmap
//!
//! One `AtomicU64` packs 56 data bits with an 8-bit modification token. Every
//! mutation bumps the token, and `try_clear` only commits while the observed
//! token is still current. A consumer that scanned a bit, found the
//! underlying queue empty, and wants to retract the signal therefore cannot
//! race away a concurrent producer's freshly set bit: the producer's `set`
//! invalidated the consumer's token.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SchedError, SchedResult};

/// Number of usable data bits
pub const BITMAP_WIDTH: usize = 56;

const TOKEN_SHIFT: u32 = 56;
const DATA_MASK: u64 = (1 << TOKEN_SHIFT) - 1;

/// A consistent (bits, token) observation of the bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapView {
    /// The 56 data bits at observation time
    pub bits: u64,
    /// Modification token at observation time
    pub token: u8,
}

impl BitmapView {
    /// Whether the given bit was set in this observation
    pub fn is_set(&self, bit: usize) -> bool {
        bit < BITMAP_WIDTH && self.bits & (1 << bit) != 0
    }

    /// Lowest set bit at or above `start`, if any
    pub fn first_set_from(&self, start: usize) -> Option<usize> {
        if start >= BITMAP_WIDTH {
            return None;
        }
        let masked = self.bits & !((1u64 << start) - 1);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros() as usize)
        }
    }
}

/// 56-bit concurrent bitmap with a modification token
#[derive(Debug, Default)]
pub struct TokenBitmap {
    word: AtomicU64,
}

impl TokenBitmap {
    /// Create an all-clear bitmap
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Validate a bit index against the 56-bit width
    pub fn check_bit(bit: usize) -> SchedResult<()> {
        if bit >= BITMAP_WIDTH {
            return Err(SchedError::BitOutOfRange(bit));
        }
        Ok(())
    }

    fn pack(bits: u64, token: u8) -> u64 {
        (u64::from(token) << TOKEN_SHIFT) | (bits & DATA_MASK)
    }

    fn unpack(word: u64) -> (u64, u8) {
        (word & DATA_MASK, (word >> TOKEN_SHIFT) as u8)
    }

    /// Atomically observe bits and token together
    pub fn snapshot(&self) -> BitmapView {
        let (bits, token) = Self::unpack(self.word.load(Ordering::Acquire));
        BitmapView { bits, token }
    }

    /// Set `bit`, bumping the token; returns whether the bit was newly set
    ///
    /// The token bump happens even when the bit was already set, so every
    /// producer-side signal invalidates in-flight clear attempts.
    pub fn set(&self, bit: usize) -> bool {
        debug_assert!(bit < BITMAP_WIDTH);
        let mask = 1u64 << bit;
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let (bits, token) = Self::unpack(current);
            let next = Self::pack(bits | mask, token.wrapping_add(1));
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return bits & mask == 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear `bit` only if the token still matches `expected_token`
    ///
    /// Returns `true` when the clear committed. A `false` return means a
    /// concurrent mutation happened since the snapshot; the caller must
    /// re-scan instead of assuming the bit state.
    pub fn try_clear(&self, bit: usize, expected_token: u8) -> bool {
        debug_assert!(bit < BITMAP_WIDTH);
        let mask = 1u64 << bit;
        let current = self.word.load(Ordering::Acquire);
        let (bits, token) = Self::unpack(current);
        if token != expected_token || bits & mask == 0 {
            return false;
        }
        let next = Self::pack(bits & !mask, token.wrapping_add(1));
        self.word
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether `bit` is currently set (point-in-time)
    pub fn is_set(&self, bit: usize) -> bool {
        self.snapshot().is_set(bit)
    }

    /// Whether every data bit is clear (point-in-time)
    pub fn is_clear(&self) -> bool {
        self.snapshot().bits == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_snapshot() {
        let bitmap = TokenBitmap::new();
        assert!(bitmap.is_clear());

        assert!(bitmap.set(3));
        assert!(!bitmap.set(3));

        let view = bitmap.snapshot();
        assert!(view.is_set(3));
        assert!(!view.is_set(4));
        assert_eq!(view.first_set_from(0), Some(3));
        assert_eq!(view.first_set_from(4), None);
    }

    #[test]
    fn test_token_guards_clear() {
        let bitmap = TokenBitmap::new();
        bitmap.set(5);

        let view = bitmap.snapshot();

        // A concurrent set invalidates the observed token, even on a
        // different bit.
        bitmap.set(9);
        assert!(!bitmap.try_clear(5, view.token));
        assert!(bitmap.is_set(5));

        // A fresh snapshot clears fine.
        let view = bitmap.snapshot();
        assert!(bitmap.try_clear(5, view.token));
        assert!(!bitmap.is_set(5));
        assert!(bitmap.is_set(9));
    }

    #[test]
    fn test_set_on_set_bit_still_bumps_token() {
        let bitmap = TokenBitmap::new();
        bitmap.set(2);

        let view = bitmap.snapshot();
        bitmap.set(2);

        assert!(!bitmap.try_clear(2, view.token));
    }

    #[test]
    fn test_check_bit_range() {
        assert!(TokenBitmap::check_bit(55).is_ok());
        assert_eq!(
            TokenBitmap::check_bit(56),
            Err(SchedError::BitOutOfRange(56))
        );
    }

    #[test]
    fn test_concurrent_set_never_loses_bits() {
        let bitmap = Arc::new(TokenBitmap::new());
        let mut handles = Vec::new();

        for bit in 0..8 {
            let bitmap = bitmap.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    bitmap.set(bit);
                }
            }));
        }
        for handle in handles {
            handle.join().ok();
        }

        let view = bitmap.snapshot();
        for bit in 0..8 {
            assert!(view.is_set(bit));
        }
    }

    #[test]
    fn test_clear_race_preserves_producer_signal() {
        // Consumer snapshots, producer sets, consumer's clear must fail.
        let bitmap = Arc::new(TokenBitmap::new());
        bitmap.set(0);

        for _ in 0..500 {
            let view = bitmap.snapshot();
            let producer = {
                let bitmap = bitmap.clone();
                thread::spawn(move || {
                    bitmap.set(0);
                })
            };
            // Whether or not the clear wins, the producer's set either
            // invalidated the token or landed after the clear committed.
            let _ = bitmap.try_clear(0, view.token);
            producer.join().ok();
            assert!(bitmap.is_set(0));
        }
    }
}
