// ========================================================================================
//                          The per-node flow accumulator
// ========================================================================================
//
// One f32 slot per global node. Phase 1 combines block partial sums into it from
// many threads at once; phase 2 only reads it. There is no atomic float add in
// `std`, so each slot stores the f32 bit pattern in an `AtomicU32` and adds through
// a compare-and-swap loop. Addition is commutative, so the final value does not
// depend on which thread wins a race, only on rounding order.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct FlowAccumulator {
    slots: Vec<AtomicU32>,
}

impl FlowAccumulator {
    /// A zeroed accumulator for `num_nodes` global nodes.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            slots: (0..num_nodes).map(|_| AtomicU32::new(0.0f32.to_bits())).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resets every slot to zero. Takes `&mut self`, so no phase can be running.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot.get_mut() = 0.0f32.to_bits();
        }
    }

    /// Atomically adds `value` to the slot of `node`.
    #[inline]
    pub fn add(&self, node: usize, value: f32) {
        let slot = &self.slots[node];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let updated = (f32::from_bits(current) + value).to_bits();
            match slot.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                // Another block landed first; retry on top of its result.
                Err(observed) => current = observed,
            }
        }
    }

    /// Reads the accumulated flow of `node`.
    #[inline(always)]
    pub fn get(&self, node: usize) -> f32 {
        f32::from_bits(self.slots[node].load(Ordering::Relaxed))
    }

    /// Copies the current totals out, one entry per node.
    pub fn to_vec(&self) -> Vec<f32> {
        (0..self.slots.len()).map(|node| self.get(node)).collect()
    }
}
