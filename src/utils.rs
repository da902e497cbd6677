use crate::sync::{AtomicUsize, Ordering};
use core::ops::Range;

pub(crate) trait RangeSplitAtHalf {
    fn split_at_half(&self) -> (Range<usize>, Range<usize>);
}

impl RangeSplitAtHalf for Range<usize> {
    #[inline]
    fn split_at_half(&self) -> (Range<usize>, Range<usize>) {
        let len = self
            .end
            .checked_sub(self.start)
            .expect("RangeSplitAtHalf::split_at");
        let mid = len / 2;
        let mid_abs = self.start + mid;
        (self.start..mid_abs, mid_abs..self.end)
    }
}

/// Splittable index range with an atomic lower bound and a fixed upper bound.
///
/// The cursor covers `cursor..end`. [`RangeCursor::try_split`] hands the lower
/// half to the caller and keeps the upper half, as long as both halves hold at
/// least `grain` elements.
#[derive(Debug)]
pub struct RangeCursor {
    cursor: AtomicUsize,
    end: usize,
    grain: usize,
}

impl RangeCursor {
    /// # Panics
    /// If `grain` is zero or the range is inverted.
    pub fn new(range: Range<usize>, grain: usize) -> Self {
        assert!(grain > 0, "RangeCursor::new: zero grain");
        assert!(range.start <= range.end, "RangeCursor::new: inverted range");
        Self {
            cursor: AtomicUsize::new(range.start),
            end: range.end,
            grain,
        }
    }

    /// The range this cursor still covers.
    pub fn remaining(&self) -> Range<usize> {
        self.cursor.load(Ordering::Acquire)..self.end
    }

    /// Minimum number of elements each half must keep after a split.
    pub fn grain(&self) -> usize {
        self.grain
    }

    /// Detach the lower half of the remaining range.
    ///
    /// Returns `None` if either half would fall below the grain.
    pub fn try_split(&self) -> Option<Range<usize>> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let (lower, upper) = (current..self.end).split_at_half();
            if lower.len() < self.grain || upper.len() < self.grain {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                upper.start,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(lower),
                Err(observed) => current = observed,
            }
        }
    }

    /// Claim everything that is left, leaving the cursor empty.
    pub(crate) fn take(&self) -> Range<usize> {
        self.cursor.swap(self.end, Ordering::AcqRel)..self.end
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn split_at_half_covers_the_range() {
        assert_eq!((0..10).split_at_half(), (0..5, 5..10));
        assert_eq!((3..4).split_at_half(), (3..3, 3..4));
    }

    #[test]
    fn grain_sized_range_refuses_to_split() {
        let cursor = RangeCursor::new(0..1024, 1024);
        assert_eq!(cursor.try_split(), None);
        assert_eq!(cursor.remaining(), 0..1024);
    }

    #[test]
    fn double_grain_splits_into_equal_halves() {
        let cursor = RangeCursor::new(0..2048, 1024);
        assert_eq!(cursor.try_split(), Some(0..1024));
        assert_eq!(cursor.remaining(), 1024..2048);
        assert_eq!(cursor.try_split(), None);
    }

    #[test]
    fn odd_remainder_goes_to_the_kept_half() {
        let cursor = RangeCursor::new(100..2149, 1024);
        assert_eq!(cursor.try_split(), Some(100..1124));
        assert_eq!(cursor.remaining(), 1124..2149);
    }

    #[test]
    fn take_empties_the_cursor() {
        let cursor = RangeCursor::new(5..50, 8);
        assert_eq!(cursor.take(), 5..50);
        assert!(cursor.remaining().is_empty());
    }
}
