// ========================================================================================
//
//               The schedule "compiler"
//
// ========================================================================================
//
// This module flattens the ragged, group-structured edge layout of a circuit into a
// flat list of fixed-width block descriptors. The result is compiled once per circuit
// topology and replayed by the update kernels for every EM step.

use crate::buffer::DescriptorBuffer;
use crate::types::{BlockDescriptor, CompiledSchedule, NodeGroupLayout, NodeId};
use itertools::Itertools;
use std::ops::Range;
use std::time::Instant;
use thiserror::Error;

/// The default number of strided entries handled by one block.
pub const DEFAULT_BLOCK_SIZE: usize = 32;
/// The default number of descriptor slots added whenever the buffer runs short.
pub const DEFAULT_GROWTH_INCREMENT: usize = 10_000;
/// Blocks wider than this would no longer fit the kernel's per-block loop counters.
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Width of a block in strided entries. Must be a power of two.
    pub block_size: usize,
    /// Amortization granularity of the descriptor buffer.
    pub growth_increment: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Block size must be a non-zero power of two, but was {0}.")]
    BlockSizeNotPowerOfTwo(usize),
    #[error("Block size {0} exceeds the supported maximum of {max}.", max = MAX_BLOCK_SIZE)]
    BlockSizeTooLarge(usize),
    #[error("The descriptor buffer growth increment must be positive.")]
    ZeroGrowthIncrement,
    #[error(
        "Group {group}: edge {edge} belongs to local node-group {parent}, but the group only has {num_node_groups} node-groups."
    )]
    EdgeParentOutOfRange {
        group: usize,
        edge: usize,
        parent: u32,
        num_node_groups: usize,
    },
    #[error("Group {group}: group size {group_size} does not fit a 32-bit block interval.")]
    GroupSizeOverflow { group: usize, group_size: usize },
    #[error("Group {group}: its {which} range holds {available} entries but its edges address {required}.")]
    RangeTooSmall {
        group: usize,
        which: &'static str,
        available: usize,
        required: usize,
    },
    #[error("Groups {first} and {second} both claim parameters in {overlap:?}.")]
    OverlappingParamRanges {
        first: usize,
        second: usize,
        overlap: Range<usize>,
    },
    #[error("Group {group}: its edges address more entries than fit in memory.")]
    AddressOverflow { group: usize },
    #[error("The circuit has more than {max} independent sum nodes.", max = u32::MAX)]
    TooManyNodes,
}

/// Compiles with the default block size and growth increment.
pub fn compile_with_defaults<'a, I>(groups: I) -> Result<CompiledSchedule, CompileError>
where
    I: IntoIterator<Item = &'a NodeGroupLayout>,
{
    compile(groups, &CompileOptions::default())
}

/// Walks the node-groups in traversal order and emits one block descriptor per
/// (local node-group, chunk of `block_size` child slots, output node).
///
/// Product, input, and tied groups are skipped. Every node of a scheduled group
/// receives a global node id, including nodes without a single edge.
pub fn compile<'a, I>(groups: I, options: &CompileOptions) -> Result<CompiledSchedule, CompileError>
where
    I: IntoIterator<Item = &'a NodeGroupLayout>,
{
    let block_size = options.block_size;
    if !block_size.is_power_of_two() {
        return Err(CompileError::BlockSizeNotPowerOfTwo(block_size));
    }
    if block_size > MAX_BLOCK_SIZE {
        return Err(CompileError::BlockSizeTooLarge(block_size));
    }
    if options.growth_increment == 0 {
        return Err(CompileError::ZeroGrowthIncrement);
    }

    let start_time = Instant::now();
    let mut buffer = DescriptorBuffer::new(options.growth_increment);
    let mut node_child_counts: Vec<f32> = Vec::new();
    let mut claimed_params: Vec<(Range<usize>, usize)> = Vec::new();
    let mut param_extent = 0;
    let mut flow_extent = 0;
    let mut num_scheduled_groups = 0;

    for (group, ns) in groups.into_iter().enumerate() {
        if !ns.is_independent_sum() {
            continue;
        }
        num_scheduled_groups += 1;

        let interval = u32::try_from(ns.group_size).map_err(|_| CompileError::GroupSizeOverflow {
            group,
            group_size: ns.group_size,
        })?;
        let total_nodes = ns
            .num_node_groups
            .checked_mul(ns.group_size)
            .and_then(|num_nodes| num_nodes.checked_add(node_child_counts.len()));
        if total_nodes.is_none_or(|total| total > u32::MAX as usize) {
            return Err(CompileError::TooManyNodes);
        }

        let num_edges_per_ng = count_edges_per_node_group(ns, group)?;

        // Every edge owns `ch_group_size * group_size` parameters and as many flows.
        let required = ns
            .edge_parents
            .len()
            .checked_mul(ns.ch_group_size)
            .and_then(|per_group| per_group.checked_mul(ns.group_size))
            .ok_or(CompileError::AddressOverflow { group })?;
        check_range(group, "parameter", &ns.param_range, required)?;
        check_range(group, "parameter-flow", &ns.param_flow_range, required)?;
        if required > 0 {
            let addressed = ns.param_range.start..ns.param_range.start + required;
            param_extent = param_extent.max(addressed.end);
            flow_extent = flow_extent.max(ns.param_flow_range.start + required);
            claimed_params.push((addressed, group));
        }

        let est_num_slots = required.div_ceil(block_size).saturating_add(ns.num_nodes());
        buffer.reserve_estimate(est_num_slots);

        let blocks_before = buffer.len();
        record_group_blocks(
            &mut buffer,
            &mut node_child_counts,
            ns,
            &num_edges_per_ng,
            interval,
            block_size,
        );
        log::debug!(
            "Group {group}: {} node-groups of {} nodes, {} edges -> {} blocks",
            ns.num_node_groups,
            ns.group_size,
            ns.edge_parents.len(),
            buffer.len() - blocks_before
        );
    }

    check_disjoint(&mut claimed_params)?;

    let blocks = buffer.into_trimmed();
    log::info!(
        "Compiled {} blocks over {} nodes from {} sum groups in {:.2?} (block size {})",
        blocks.len(),
        node_child_counts.len(),
        num_scheduled_groups,
        start_time.elapsed(),
        block_size
    );

    Ok(CompiledSchedule::new(
        blocks,
        node_child_counts,
        block_size,
        param_extent,
        flow_extent,
    ))
}

/// Counts how many edges each local node-group owns.
fn count_edges_per_node_group(ns: &NodeGroupLayout, group: usize) -> Result<Vec<usize>, CompileError> {
    let mut counts = vec![0usize; ns.num_node_groups];
    for (edge, &parent) in ns.edge_parents.iter().enumerate() {
        let slot = counts
            .get_mut(parent as usize)
            .ok_or(CompileError::EdgeParentOutOfRange {
                group,
                edge,
                parent,
                num_node_groups: ns.num_node_groups,
            })?;
        *slot += 1;
    }
    Ok(counts)
}

fn check_range(
    group: usize,
    which: &'static str,
    range: &Range<usize>,
    required: usize,
) -> Result<(), CompileError> {
    let available = range.end.saturating_sub(range.start);
    if available < required {
        return Err(CompileError::RangeTooSmall {
            group,
            which,
            available,
            required,
        });
    }
    Ok(())
}

/// The update kernel writes parameters from many threads at once; that is only
/// sound if no parameter is addressed by two groups.
fn check_disjoint(claimed: &mut [(Range<usize>, usize)]) -> Result<(), CompileError> {
    claimed.sort_unstable_by_key(|(range, _)| range.start);
    for ((a, first), (b, second)) in claimed.iter().tuple_windows() {
        if a.end > b.start {
            return Err(CompileError::OverlappingParamRanges {
                first: *first,
                second: *second,
                overlap: b.start..a.end.min(b.end),
            });
        }
    }
    Ok(())
}

/// The inner compilation loop for one sum group.
///
/// For local node-group `k` with `num_chs` child slots per node, the slots are cut
/// into chunks of `block_size`, and each chunk yields one descriptor per node of the
/// group. Entries of different nodes interleave with a stride of `group_size`.
fn record_group_blocks(
    buffer: &mut DescriptorBuffer,
    node_child_counts: &mut Vec<f32>,
    ns: &NodeGroupLayout,
    num_edges_per_ng: &[usize],
    interval: u32,
    block_size: usize,
) {
    let group_size = ns.group_size;
    let mut local_offset = 0;

    for &num_edges in num_edges_per_ng {
        let num_chs = num_edges * ns.ch_group_size;
        let global_nid = node_child_counts.len();
        let par_start = ns.param_range.start + local_offset;
        let pflow_start = ns.param_flow_range.start + local_offset;

        for sid in (0..num_chs).step_by(block_size) {
            let blk_size = block_size.min(num_chs - sid);
            for gid in 0..group_size {
                buffer.push(BlockDescriptor {
                    param_offset: par_start + sid * group_size + gid,
                    flow_offset: pflow_start + sid * group_size + gid,
                    size: blk_size as u32,
                    interval,
                    node_id: NodeId((global_nid + gid) as u32),
                });
            }
        }

        node_child_counts.extend(std::iter::repeat_n(num_chs as f32, group_size));
        local_offset += num_chs * group_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupKind;

    fn sum_group(
        num_node_groups: usize,
        group_size: usize,
        ch_group_size: usize,
        edge_parents: Vec<u32>,
        start: usize,
    ) -> NodeGroupLayout {
        let len = edge_parents.len() * ch_group_size * group_size;
        NodeGroupLayout {
            kind: GroupKind::Sum,
            tied: false,
            num_node_groups,
            group_size,
            ch_group_size,
            edge_parents,
            param_range: start..start + len,
            param_flow_range: start..start + len,
        }
    }

    #[test]
    fn rejects_block_sizes_that_are_not_powers_of_two() {
        for bad in [0, 3, 24, 33] {
            let options = CompileOptions {
                block_size: bad,
                growth_increment: 10,
            };
            let groups: Vec<NodeGroupLayout> = Vec::new();
            assert_eq!(
                compile(&groups, &options).unwrap_err(),
                CompileError::BlockSizeNotPowerOfTwo(bad)
            );
        }
    }

    #[test]
    fn rejects_zero_growth_increment() {
        let options = CompileOptions {
            block_size: 8,
            growth_increment: 0,
        };
        let groups: Vec<NodeGroupLayout> = Vec::new();
        assert_eq!(compile(&groups, &options).unwrap_err(), CompileError::ZeroGrowthIncrement);
    }

    #[test]
    fn single_node_with_two_children_yields_one_block() {
        let groups = vec![sum_group(1, 1, 1, vec![0, 0], 0)];
        let schedule = compile_with_defaults(&groups).unwrap();

        assert_eq!(schedule.tot_num_nodes(), 1);
        assert_eq!(schedule.node_child_counts(), &[2.0]);
        assert_eq!(
            schedule.blocks(),
            &[BlockDescriptor {
                param_offset: 0,
                flow_offset: 0,
                size: 2,
                interval: 1,
                node_id: NodeId(0),
            }]
        );
        assert_eq!(schedule.param_extent(), 2);
    }

    #[test]
    fn wide_node_groups_are_split_into_chunks() {
        // One node-group of two nodes, five edges of three children each: 15 slots.
        let groups = vec![sum_group(1, 2, 3, vec![0; 5], 100)];
        let options = CompileOptions {
            block_size: 4,
            growth_increment: 1,
        };
        let schedule = compile(&groups, &options).unwrap();

        // ceil(15 / 4) = 4 chunks, one block per node per chunk.
        assert_eq!(schedule.num_blocks(), 8);
        let sizes: Vec<u32> = schedule.blocks().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4, 4, 4, 4, 4, 4, 3, 3]);
        let offsets: Vec<usize> = schedule.blocks().iter().map(|b| b.param_offset).collect();
        assert_eq!(offsets, vec![100, 101, 108, 109, 116, 117, 124, 125]);
        assert!(schedule.blocks().iter().all(|b| b.interval == 2));
    }

    #[test]
    fn local_node_groups_follow_each_other_in_the_range() {
        // Node-group 0 owns one edge, node-group 1 owns two.
        let groups = vec![sum_group(2, 2, 1, vec![1, 0, 1], 0)];
        let schedule = compile_with_defaults(&groups).unwrap();

        assert_eq!(schedule.tot_num_nodes(), 4);
        assert_eq!(schedule.node_child_counts(), &[1.0, 1.0, 2.0, 2.0]);
        let summary: Vec<(usize, u32, u32)> = schedule
            .blocks()
            .iter()
            .map(|b| (b.param_offset, b.size, b.node_id.0))
            .collect();
        assert_eq!(summary, vec![(0, 1, 0), (1, 1, 1), (2, 2, 2), (3, 2, 3)]);
    }

    #[test]
    fn edgeless_node_groups_still_take_node_ids() {
        let groups = vec![
            sum_group(3, 2, 1, vec![2], 0),
            sum_group(1, 1, 1, vec![0], 2),
        ];
        let schedule = compile_with_defaults(&groups).unwrap();

        assert_eq!(schedule.tot_num_nodes(), 7);
        assert_eq!(schedule.node_child_counts(), &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let node_ids: Vec<u32> = schedule.blocks().iter().map(|b| b.node_id.0).collect();
        assert_eq!(node_ids, vec![4, 5, 6]);
    }

    #[test]
    fn skips_tied_and_non_sum_groups() {
        let mut tied = sum_group(1, 4, 1, vec![0, 0], 0);
        tied.tied = true;
        let mut product = sum_group(1, 4, 1, vec![0], 0);
        product.kind = GroupKind::Product;
        let owner = sum_group(1, 4, 1, vec![0, 0], 0);

        let groups = vec![tied, product, owner];
        let schedule = compile_with_defaults(&groups).unwrap();
        assert_eq!(schedule.tot_num_nodes(), 4);
        assert_eq!(schedule.num_blocks(), 4);
    }

    #[test]
    fn rejects_edges_pointing_past_the_node_groups() {
        let groups = vec![sum_group(2, 1, 1, vec![0, 2], 0)];
        assert_eq!(
            compile_with_defaults(&groups).unwrap_err(),
            CompileError::EdgeParentOutOfRange {
                group: 0,
                edge: 1,
                parent: 2,
                num_node_groups: 2,
            }
        );
    }

    #[test]
    fn rejects_ranges_too_short_for_the_edges() {
        let mut group = sum_group(1, 2, 2, vec![0, 0], 0);
        group.param_flow_range = 0..7;
        assert_eq!(
            compile_with_defaults(&[group]).unwrap_err(),
            CompileError::RangeTooSmall {
                group: 0,
                which: "parameter-flow",
                available: 7,
                required: 8,
            }
        );
    }

    #[test]
    fn rejects_overlapping_parameter_ranges() {
        let groups = vec![sum_group(1, 2, 1, vec![0, 0], 0), sum_group(1, 2, 1, vec![0], 3)];
        assert_eq!(
            compile_with_defaults(&groups).unwrap_err(),
            CompileError::OverlappingParamRanges {
                first: 0,
                second: 1,
                overlap: 3..4,
            }
        );
    }

    #[test]
    fn rejects_sizes_that_overflow_the_address_space() {
        let huge = NodeGroupLayout {
            kind: GroupKind::Sum,
            tied: false,
            num_node_groups: 1,
            group_size: 2,
            ch_group_size: usize::MAX / 2 + 1,
            edge_parents: vec![0],
            param_range: 0..usize::MAX,
            param_flow_range: 0..usize::MAX,
        };
        assert_eq!(
            compile_with_defaults(&[huge]).unwrap_err(),
            CompileError::AddressOverflow { group: 0 }
        );

        let too_many = NodeGroupLayout {
            kind: GroupKind::Sum,
            tied: false,
            num_node_groups: usize::MAX,
            group_size: 2,
            ch_group_size: 1,
            edge_parents: Vec::new(),
            param_range: 0..0,
            param_flow_range: 0..0,
        };
        assert_eq!(
            compile_with_defaults(&[too_many]).unwrap_err(),
            CompileError::TooManyNodes
        );
    }
}
