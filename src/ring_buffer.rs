use anyhow::bail;

/// A fixed-capacity circular store addressed relative to a moving head.
///
/// [`RingBuffer::push`] advances the head modulo the capacity, overwriting the oldest
///  slot when the buffer is full - these are store-the-N-most-recent semantics, there is
///  no error on overflow. Index `0` is always the most recently pushed item; positive and
///  negative offsets wrap modulo the capacity.
///
/// The buffer is used for keep-alive history (push + scan) and for the reliable receive
///  window (set / get with absolute sequence numbers, which wrap the same way).
pub struct RingBuffer<T> {
    slots: Vec<T>,
    head: usize,
}

impl<T: Clone + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        RingBuffer {
            slots: vec![T::default(); capacity],
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Advances the head and stores `item` there, overwriting the oldest slot.
    pub fn push(&mut self, item: T) {
        if self.slots.is_empty() {
            return;
        }

        self.head += 1;
        if self.head >= self.slots.len() {
            self.head = 0;
        }
        self.slots[self.head] = item;
    }

    pub fn get(&self, index: i64) -> anyhow::Result<&T> {
        let resolved = self.resolve(index)?;
        Ok(&self.slots[resolved])
    }

    pub fn get_mut(&mut self, index: i64) -> anyhow::Result<&mut T> {
        let resolved = self.resolve(index)?;
        Ok(&mut self.slots[resolved])
    }

    pub fn set(&mut self, index: i64, item: T) -> anyhow::Result<()> {
        let resolved = self.resolve(index)?;
        self.slots[resolved] = item;
        Ok(())
    }

    fn resolve(&self, index: i64) -> anyhow::Result<usize> {
        if self.slots.is_empty() {
            bail!("ring buffer has no capacity for any items");
        }

        let len = self.slots.len() as i64;
        let mut resolved = (self.head as i64 + index) % len;
        if resolved < 0 {
            resolved += len;
        }
        Ok(resolved as usize)
    }
}
