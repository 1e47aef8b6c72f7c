//! Fixed-capacity ring buffer for long-running detectors.
//!
//! Every detector that keeps history over a night reads through this type,
//! so session length can never grow memory. Oldest entries are overwritten
//! on push; callers only ever receive copies.

/// Default capacity: 6000 entries ≈ 10 minutes at 10 Hz metering.
pub const DEFAULT_CAPACITY: usize = 6_000;

#[derive(Debug, Clone)]
pub struct BoundedSampleBuffer<T> {
    items: Vec<T>,
    /// Next write slot once `items` is full.
    head: usize,
    capacity: usize,
}

impl<T: Clone> BoundedSampleBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity.min(1 << 16)),
            head: 0,
            capacity,
        }
    }

    /// Append an item, overwriting the oldest one when full. O(1).
    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.items[self.head] = item;
        }
        self.head = (self.head + 1) % self.capacity;
    }

    /// The `n` most recent items, newest first. Clamped to what is held.
    pub fn last(&self, n: usize) -> Vec<T> {
        self.iter_chronological().rev().take(n).cloned().collect()
    }

    /// Everything currently held, oldest first.
    pub fn all(&self) -> Vec<T> {
        self.iter_chronological().cloned().collect()
    }

    /// The `n` most recent items, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.iter_chronological().skip(skip).cloned().collect()
    }

    /// Mean of `selector` over all held items; `0.0` when empty.
    pub fn average<F>(&self, selector: F) -> f64
    where
        F: Fn(&T) -> f64,
    {
        if self.items.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.items.iter().map(&selector).sum();
        sum / self.items.len() as f64
    }

    /// Linearly interpolated percentile (`p` in 0–100) of `selector` over
    /// all held items; `0.0` when empty.
    pub fn percentile<F>(&self, p: f64, selector: F) -> f64
    where
        F: Fn(&T) -> f64,
    {
        if self.items.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.items.iter().map(&selector).collect();
        values.sort_by(|a, b| a.total_cmp(b));

        let rank = (p.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return values[lower];
        }
        values[lower] + (values[upper] - values[lower]) * (rank - lower as f64)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.head = 0;
    }

    fn iter_chronological(&self) -> impl DoubleEndedIterator<Item = &T> {
        // Until the first wrap, `head == items.len()` and the split is a no-op.
        let split = if self.items.len() < self.capacity {
            0
        } else {
            self.head
        };
        let (newer, older) = self.items.split_at(split);
        older.iter().chain(newer.iter())
    }
}

impl<T: Clone> Default for BoundedSampleBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
