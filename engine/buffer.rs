// ========================================================================================
//                          Growable block descriptor storage
// ========================================================================================
//
// The number of blocks a circuit compiles to is only known after every group has
// been walked. This buffer grows in fixed increments from a per-group estimate so
// the compiler never reallocates per descriptor, then trims to the exact length.

use crate::types::BlockDescriptor;

#[derive(Debug)]
pub struct DescriptorBuffer {
    slots: Vec<BlockDescriptor>,
    cursor: usize,
    growth_increment: usize,
}

impl DescriptorBuffer {
    /// Creates a buffer with one increment of zeroed slots already in place.
    ///
    /// `growth_increment` must be non-zero; the compiler validates it upfront.
    pub fn new(growth_increment: usize) -> Self {
        debug_assert!(growth_increment > 0);
        Self {
            slots: vec![BlockDescriptor::default(); growth_increment],
            cursor: 0,
            growth_increment,
        }
    }

    /// Number of descriptors written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Number of slots currently allocated, written or not.
    #[cfg(test)]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Makes sure at least `estimated_slots` more descriptors fit without growing.
    ///
    /// The shortfall is rounded up to a whole number of increments.
    pub fn reserve_estimate(&mut self, estimated_slots: usize) {
        let needed = self.cursor + estimated_slots;
        let current = self.slots.len();
        if needed > current {
            let increase = (needed - current).div_ceil(self.growth_increment) * self.growth_increment;
            log::trace!(
                "Growing descriptor buffer from {current} to {} slots",
                current + increase
            );
            self.slots.resize(current + increase, BlockDescriptor::default());
        }
    }

    /// Appends one descriptor. An underestimated reservation costs one more
    /// increment, never a lost entry.
    #[inline]
    pub fn push(&mut self, desc: BlockDescriptor) {
        if self.cursor == self.slots.len() {
            self.reserve_estimate(1);
        }
        self.slots[self.cursor] = desc;
        self.cursor += 1;
    }

    /// Read-only view of the written prefix.
    #[cfg(test)]
    #[inline]
    pub fn as_slice(&self) -> &[BlockDescriptor] {
        &self.slots[..self.cursor]
    }

    /// Drops the unwritten tail and hands back exactly the written descriptors.
    pub fn into_trimmed(mut self) -> Vec<BlockDescriptor> {
        self.slots.truncate(self.cursor);
        self.slots.shrink_to_fit();
        self.slots
    }
}
