// ========================================================================================
//
//                      The kernels: flow aggregation and parameter update
//
// ========================================================================================
//
// This module contains the innermost loops of the EM update. Both kernels execute a
// pre-compiled block schedule and contain no structural decisions: a block is a
// strided run of `size` entries, read eight lanes at a time with masked gathers so
// that the ragged tail of a block is simply a partially enabled vector.

use crate::accumulator::FlowAccumulator;
use crate::types::BlockDescriptor;
use std::marker::PhantomData;
use std::simd::cmp::SimdPartialOrd;
use std::simd::num::SimdFloat;
use std::simd::{Simd, f32x8};

// --- Type Aliases for Readability ---
pub type SimdVec = f32x8;
pub const LANE_COUNT: usize = SimdVec::LEN;
type IndexVec = Simd<usize, LANE_COUNT>;

const LANE_OFFSETS: IndexVec = Simd::from_array([0, 1, 2, 3, 4, 5, 6, 7]);

// ========================================================================================
//                            Public API & type definitions
// ========================================================================================

/// The blending constants of one EM step, already validated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendConstants {
    pub step_size: f32,
    pub pseudocount: f32,
}

/// A `Send + Sync` handle to the parameter array for the update phase.
///
/// The array is written from many threads at once through this handle. That is
/// sound only because a compiled schedule never lets two blocks address the same
/// parameter, and the orchestrator checks the array length against the schedule's
/// extent before the first write.
#[derive(Clone, Copy)]
pub struct SharedParams<'a> {
    // Cast to usize to keep the handle Send + Sync for rayon closures.
    addr: usize,
    len: usize,
    marker: PhantomData<&'a mut [f32]>,
}

impl<'a> SharedParams<'a> {
    pub fn new(params: &'a mut [f32]) -> Self {
        Self {
            addr: params.as_mut_ptr() as usize,
            len: params.len(),
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// `index < self.len()`, and no other thread writes this index concurrently.
    #[inline(always)]
    unsafe fn read(&self, index: usize) -> f32 {
        debug_assert!(index < self.len);
        unsafe { (self.addr as *const f32).add(index).read() }
    }

    /// # Safety
    /// `index < self.len()`, and no other thread reads or writes this index concurrently.
    #[inline(always)]
    unsafe fn write(&self, index: usize, value: f32) {
        debug_assert!(index < self.len);
        unsafe { (self.addr as *mut f32).add(index).write(value) }
    }
}

/// Zero is the only degenerate value: a node without recorded flow, or without
/// children, normalizes by one instead of dividing by zero.
#[inline(always)]
pub fn floor_to_one(value: f32) -> f32 {
    if value == 0.0 { 1.0 } else { value }
}

// ========================================================================================
//                              Phase 1: flow aggregation
// ========================================================================================

/// Sums the `size` valid strided flow entries of one block. Lanes past `size` are
/// masked off and contribute nothing.
#[inline]
pub fn block_flow_sum(flows: &[f32], block: &BlockDescriptor) -> f32 {
    let size = block.size as usize;
    let limit = IndexVec::splat(size);
    let stride = IndexVec::splat(block.interval as usize);
    let origin = IndexVec::splat(block.flow_offset);

    let mut acc = SimdVec::splat(0.0);
    for base in (0..size).step_by(LANE_COUNT) {
        let lanes = IndexVec::splat(base) + LANE_OFFSETS;
        let enable = lanes.simd_lt(limit);
        let idxs = origin + lanes * stride;
        acc += SimdVec::gather_select(flows, enable, idxs, SimdVec::splat(0.0));
    }
    acc.reduce_sum()
}

/// Aggregates one work unit of blocks into the shared per-node accumulator.
#[cfg_attr(not(feature = "no-inline-profiling"), inline)]
#[cfg_attr(feature = "no-inline-profiling", inline(never))]
pub fn aggregate_unit(blocks: &[BlockDescriptor], flows: &[f32], cum_flows: &FlowAccumulator) {
    for block in blocks {
        let nflows = block_flow_sum(flows, block);
        cum_flows.add(block.node_id.index(), nflows);
    }
}

// ========================================================================================
//                              Phase 2: parameter update
// ========================================================================================

/// Re-estimates and blends the parameters of one block in place:
///
/// `new = (flow + pseudocount / nch) / (node_flow + pseudocount)`
/// `param = (1 - step_size) * param + step_size * new`
///
/// # Safety
/// Every parameter index of `block` must be `< params.len()`, and no other thread
/// may touch those indices while this runs.
#[inline]
pub unsafe fn update_block(
    params: &SharedParams<'_>,
    flows: &[f32],
    block: &BlockDescriptor,
    node_flow: f32,
    node_nch: f32,
    constants: BlendConstants,
) {
    let size = block.size as usize;
    let limit = IndexVec::splat(size);
    let stride = IndexVec::splat(block.interval as usize);
    let origin = IndexVec::splat(block.flow_offset);

    let prior = SimdVec::splat(constants.pseudocount / node_nch);
    let denom = SimdVec::splat(node_flow + constants.pseudocount);
    let keep = 1.0 - constants.step_size;

    for base in (0..size).step_by(LANE_COUNT) {
        let lanes = IndexVec::splat(base) + LANE_OFFSETS;
        let enable = lanes.simd_lt(limit);
        let idxs = origin + lanes * stride;
        let pflows = SimdVec::gather_select(flows, enable, idxs, SimdVec::splat(0.0));
        let new_param = ((pflows + prior) / denom).to_array();

        let active = LANE_COUNT.min(size - base);
        for (lane, &target) in new_param.iter().take(active).enumerate() {
            let index = block.param_index(base + lane);
            // SAFETY: the caller guarantees `index` is in bounds and exclusively ours.
            unsafe {
                let old_param = params.read(index);
                params.write(index, keep * old_param + constants.step_size * target);
            }
        }
    }
}

/// Updates every block of one work unit against the completed accumulator.
///
/// # Safety
/// Same contract as [`update_block`], for every block of the unit.
#[cfg_attr(not(feature = "no-inline-profiling"), inline)]
#[cfg_attr(feature = "no-inline-profiling", inline(never))]
pub unsafe fn update_unit(
    blocks: &[BlockDescriptor],
    params: &SharedParams<'_>,
    flows: &[f32],
    cum_flows: &FlowAccumulator,
    nchs: &[f32],
    constants: BlendConstants,
) {
    for block in blocks {
        let node = block.node_id.index();
        let node_flow = floor_to_one(cum_flows.get(node));
        let node_nch = floor_to_one(nchs[node]);
        // SAFETY: forwarded from this function's contract.
        unsafe { update_block(params, flows, block, node_flow, node_nch, constants) };
    }
}
