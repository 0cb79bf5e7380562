//! Completion notification path
//!
//! Two backends report finished buffers: the interrupt path
//! ([`irq`]) and the poll path ([`poll`]). Both implement
//! [`CompletionSource`] and hand their result to
//! [`ChannelCore::publish`](crate::channel::ChannelCore::publish), which
//! updates the channel's [`IndexCell`] and wakes the consumer.

pub mod irq;
pub mod poll;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::INVALID_INDEX;

/// A buffer index freshly reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewIndex(pub u8);

/// One way of learning about completed buffers
pub trait CompletionSource: Send {
    /// Returns the newly completed buffer index, if the engine moved on
    fn observe(&mut self) -> Option<NewIndex>;
}

const INDEX_MASK: u64 = 0xFF;
const UPDATED: u64 = 1 << 8;
const GEN_SHIFT: u32 = 16;

/// A buffer index and its "updated" flag in one atomic word.
///
/// Bits 0..7 hold the index, bit 8 the updated flag, bits 16.. a
/// generation counter bumped on every publish or reset.
pub struct IndexCell(AtomicU64);

impl IndexCell {
    pub const fn new() -> Self {
        Self(AtomicU64::new(INVALID_INDEX as u64))
    }

    fn pack(index: u8, updated: bool, gen: u64) -> u64 {
        let mut v = (gen << GEN_SHIFT) | index as u64;
        if updated {
            v |= UPDATED;
        }
        v
    }

    fn update<F: Fn(u64) -> Option<u64>>(&self, f: F) -> Result<u64, u64> {
        self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
    }

    /// Stores `index` and raises the updated flag
    pub fn publish(&self, index: u8) {
        let _ = self.update(|v| Some(Self::pack(index, true, (v >> GEN_SHIFT) + 1)));
    }

    /// Back to the invalid sentinel with the flag cleared
    pub fn reset(&self) {
        let _ = self.update(|v| Some(Self::pack(INVALID_INDEX, false, (v >> GEN_SHIFT) + 1)));
    }

    /// Clears the updated flag and returns the index it guarded
    pub fn take(&self) -> Option<u8> {
        self.update(|v| if v & UPDATED != 0 { Some(v & !UPDATED) } else { None })
            .ok()
            .map(|prev| (prev & INDEX_MASK) as u8)
    }

    pub fn index(&self) -> u8 {
        (self.0.load(Ordering::Acquire) & INDEX_MASK) as u8
    }

    pub fn is_updated(&self) -> bool {
        self.0.load(Ordering::Acquire) & UPDATED != 0
    }

    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::Acquire) >> GEN_SHIFT
    }
}

impl Default for IndexCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_cell_is_invalid() {
        let cell = IndexCell::new();
        assert_eq!(cell.index(), INVALID_INDEX);
        assert!(!cell.is_updated());
        assert_eq!(cell.take(), None);
    }

    #[test]
    fn test_publish_then_take_once() {
        let cell = IndexCell::new();
        cell.publish(7);
        assert!(cell.is_updated());
        assert_eq!(cell.take(), Some(7));
        assert_eq!(cell.take(), None);
        assert_eq!(cell.index(), 7);
    }

    #[test]
    fn test_latest_publish_wins() {
        let cell = IndexCell::new();
        cell.publish(3);
        cell.publish(4);
        assert_eq!(cell.generation(), 2);
        assert_eq!(cell.take(), Some(4));
    }

    #[test]
    fn test_reset_discards_pending_update() {
        let cell = IndexCell::new();
        cell.publish(9);
        cell.reset();
        assert_eq!(cell.take(), None);
        assert_eq!(cell.index(), INVALID_INDEX);
        assert_eq!(cell.generation(), 2);
    }
}
