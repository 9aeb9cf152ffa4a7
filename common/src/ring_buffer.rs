//! Fixed capacity circular storage that overwrites its oldest element

/// Ring buffer pre-filled with a default value so no slot is ever empty
///
/// Indexing is relative to recency: `get(0)` is the newest element and
/// `get(capacity - 1)` the oldest one.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    /// Where the next element is written
    cursor: usize,
    writes: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Panics if `capacity` is zero
    pub fn new(capacity: usize, fill: T) -> Self {
        assert!(capacity > 0, "Ring buffer needs a capacity of at least 1");

        Self {
            slots: vec![fill; capacity],
            cursor: 0,
            writes: 0,
        }
    }
}

impl<T> RingBuffer<T> {
    /// Stores `element` in place of the oldest one, which is returned
    pub fn add(&mut self, element: T) -> T {
        let old = std::mem::replace(&mut self.slots[self.cursor], element);

        self.cursor = (self.cursor + 1) % self.slots.len();
        self.writes = (self.writes + 1).min(self.slots.len());

        old
    }

    /// `index` is the age of the element, panics if it is not below the capacity
    pub fn get(&self, index: usize) -> &T {
        let capacity = self.slots.len();
        assert!(
            index < capacity,
            "Ring buffer index {index} out of range for capacity {capacity}"
        );

        let newest = self.cursor + capacity - 1;
        &self.slots[(newest - index) % capacity]
    }

    /// Number of writes so far, capped at the capacity
    pub fn size(&self) -> usize {
        self.writes
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// All slots from newest to oldest, including pre-filled ones
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.slots.len()).map(|index| self.get(index))
    }
}
