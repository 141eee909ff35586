//! Sliding-window codebook usage tracking.
//!
//! A fixed number of slots holds the most recently assigned codes. Slots start
//! out holding code 0, so the window is always full and its length never
//! changes. Per-code counts are maintained incrementally, which keeps each
//! update proportional to the batch rather than to the window.

use crate::error::TritokError;

/// FIFO history of recently assigned codebook indices.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    slots: Vec<u32>,
    /// Position of the oldest slot, which is the next one to be overwritten.
    cursor: usize,
    counts: Vec<u32>,
    distinct: usize,
}

impl UsageTracker {
    /// Create a tracker with `capacity` slots for a codebook of `codebook_size`.
    ///
    /// # Errors
    ///
    /// Returns [`TritokError::InvalidConfig`] if either size is zero or the
    /// capacity does not fit the per-code counters.
    pub fn new(capacity: usize, codebook_size: usize) -> Result<Self, TritokError> {
        if capacity == 0 || codebook_size == 0 {
            return Err(TritokError::InvalidConfig(format!(
                "usage history needs a positive capacity and codebook size, got {capacity} and {codebook_size}"
            )));
        }
        let full = u32::try_from(capacity).map_err(|_| {
            TritokError::InvalidConfig(format!("usage capacity {capacity} is too large"))
        })?;
        let mut counts = vec![0u32; codebook_size];
        counts[0] = full;
        Ok(Self {
            slots: vec![0; capacity],
            cursor: 0,
            counts,
            distinct: 1,
        })
    }

    /// Number of slots. Fixed at construction.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of distinct codes currently in the window.
    pub fn distinct(&self) -> usize {
        self.distinct
    }

    /// Fraction of the codebook present in the window, in `[0, 1]`.
    pub fn usage(&self) -> f32 {
        self.distinct as f32 / self.counts.len() as f32
    }

    /// Append `indices` in order, evicting the oldest entries.
    ///
    /// When `indices` is longer than the window only its last `capacity`
    /// entries are kept.
    ///
    /// # Errors
    ///
    /// Returns [`TritokError::IndexOutOfRange`] before touching the window if
    /// any index is outside the codebook.
    pub fn record(&mut self, indices: &[i64]) -> Result<(), TritokError> {
        let size = self.counts.len();
        if let Some(&index) = indices
            .iter()
            .find(|&&index| index < 0 || index as usize >= size)
        {
            return Err(TritokError::IndexOutOfRange { index, size });
        }

        let skip = indices.len().saturating_sub(self.slots.len());
        for &index in &indices[skip..] {
            self.push(index as u32);
        }
        Ok(())
    }

    /// Window contents from oldest to newest.
    pub fn snapshot(&self) -> Vec<u32> {
        let (newer, older) = self.slots.split_at(self.cursor);
        older.iter().chain(newer.iter()).copied().collect()
    }

    fn push(&mut self, code: u32) {
        let evicted = self.slots[self.cursor] as usize;
        self.counts[evicted] -= 1;
        if self.counts[evicted] == 0 {
            self.distinct -= 1;
        }

        let added = code as usize;
        if self.counts[added] == 0 {
            self.distinct += 1;
        }
        self.counts[added] += 1;

        self.slots[self.cursor] = code;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_of_code_zero() {
        let tracker = UsageTracker::new(8, 4).expect("tracker");
        assert_eq!(tracker.len(), 8);
        assert_eq!(tracker.distinct(), 1);
        assert!((tracker.usage() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn record_shifts_fifo() {
        let mut tracker = UsageTracker::new(4, 8).expect("tracker");
        tracker.record(&[1, 2]).unwrap();
        assert_eq!(tracker.snapshot(), vec![0, 0, 1, 2]);
        tracker.record(&[3, 4, 5]).unwrap();
        assert_eq!(tracker.snapshot(), vec![2, 3, 4, 5]);
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.distinct(), 4);
        assert!((tracker.usage() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn oversized_batch_keeps_most_recent() {
        let mut tracker = UsageTracker::new(3, 10).expect("tracker");
        tracker.record(&[9, 8, 7, 6, 5]).unwrap();
        assert_eq!(tracker.snapshot(), vec![7, 6, 5]);
        assert_eq!(tracker.distinct(), 3);
    }

    #[test]
    fn distinct_matches_brute_force() {
        let mut tracker = UsageTracker::new(16, 6).expect("tracker");
        let stream: Vec<i64> = (0..100).map(|i| (i * 7 % 13 % 6) as i64).collect();
        for chunk in stream.chunks(5) {
            tracker.record(chunk).unwrap();
            let mut seen = tracker.snapshot();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), tracker.distinct());
            assert_eq!(tracker.len(), 16);
            assert!((0.0..=1.0).contains(&tracker.usage()));
        }
    }

    #[test]
    fn empty_sizes_are_rejected() {
        assert!(matches!(
            UsageTracker::new(0, 4),
            Err(TritokError::InvalidConfig(_))
        ));
        assert!(matches!(
            UsageTracker::new(4, 0),
            Err(TritokError::InvalidConfig(_))
        ));
    }

    #[test]
    fn out_of_range_leaves_window_untouched() {
        let mut tracker = UsageTracker::new(4, 4).expect("tracker");
        tracker.record(&[1]).unwrap();
        let before = tracker.snapshot();
        let err = tracker.record(&[2, 4]).unwrap_err();
        assert_eq!(err, TritokError::IndexOutOfRange { index: 4, size: 4 });
        assert_eq!(tracker.snapshot(), before);
    }
}
