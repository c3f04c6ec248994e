// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use crate::accumulator::FlowAccumulator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// The structural role of a node-group inside a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// A weighted sum over child groups. The only kind that owns trainable parameters.
    Sum,
    Product,
    Input,
}

/// A read-only view of one node-group, as handed over by the node-graph layer.
///
/// Parameters of a sum group are stored block-tied: for every local node-group,
/// each child slot `c` owns `group_size` consecutive entries, one per output node.
/// Local node-groups follow each other in ascending index order inside
/// `param_range`, and `param_flow_range` mirrors the exact same layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupLayout {
    pub kind: GroupKind,
    /// A tied group aliases the parameters of another group and is never
    /// scheduled on its own.
    #[serde(default)]
    pub tied: bool,
    pub num_node_groups: usize,
    pub group_size: usize,
    pub ch_group_size: usize,
    /// For every edge, the local node-group index that owns it.
    #[serde(default)]
    pub edge_parents: Vec<u32>,
    #[serde(default = "empty_range")]
    pub param_range: Range<usize>,
    #[serde(default = "empty_range")]
    pub param_flow_range: Range<usize>,
}

fn empty_range() -> Range<usize> {
    0..0
}

impl NodeGroupLayout {
    /// Whether this group performs a weighted sum of its own, i.e. is scheduled.
    #[inline]
    pub fn is_independent_sum(&self) -> bool {
        self.kind == GroupKind::Sum && !self.tied
    }

    /// Total number of output nodes in this group.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.num_node_groups * self.group_size
    }
}

/// A flattened index over every output node of every scheduled sum group.
///
/// `#[repr(transparent)]` keeps the descriptor layout identical to a bare `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One fixed-width unit of aggregation/update work.
///
/// Entry `j` of the block (for `j < size`) lives at `param_offset + j * interval`
/// in the parameter array and at `flow_offset + j * interval` in the flow array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BlockDescriptor {
    pub param_offset: usize,
    pub flow_offset: usize,
    pub size: u32,
    pub interval: u32,
    pub node_id: NodeId,
}

impl BlockDescriptor {
    /// Index of the `j`-th parameter entry covered by this block.
    #[inline(always)]
    pub fn param_index(&self, j: usize) -> usize {
        self.param_offset + j * self.interval as usize
    }

    /// Index of the `j`-th flow entry covered by this block.
    #[inline(always)]
    pub fn flow_index(&self, j: usize) -> usize {
        self.flow_offset + j * self.interval as usize
    }
}

/// A "proof token" holding a compiled, replayable update schedule.
///
/// The successful creation of this struct guarantees that every block addresses
/// an entry of its own group's ranges, that no two blocks address the same
/// parameter, and that `node_child_counts` has one entry per global node. It is
/// immutable after compilation and can be shared across any number of update calls.
#[derive(Debug, Clone)]
pub struct CompiledSchedule {
    blocks: Vec<BlockDescriptor>,
    node_child_counts: Vec<f32>,
    block_size: usize,
    param_extent: usize,
    flow_extent: usize,
}

impl CompiledSchedule {
    /// Only the `compile` module constructs this token.
    pub(crate) fn new(
        blocks: Vec<BlockDescriptor>,
        node_child_counts: Vec<f32>,
        block_size: usize,
        param_extent: usize,
        flow_extent: usize,
    ) -> Self {
        Self {
            blocks,
            node_child_counts,
            block_size,
            param_extent,
            flow_extent,
        }
    }

    #[inline(always)]
    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.blocks
    }

    #[inline(always)]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of independent output nodes, i.e. the accumulator length.
    #[inline(always)]
    pub fn tot_num_nodes(&self) -> usize {
        self.node_child_counts.len()
    }

    /// Number of sibling entries per global node.
    #[inline(always)]
    pub fn node_child_counts(&self) -> &[f32] {
        &self.node_child_counts
    }

    #[inline(always)]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The minimum parameter array length this schedule can be replayed on.
    #[inline(always)]
    pub fn param_extent(&self) -> usize {
        self.param_extent
    }

    /// The minimum flow array length this schedule can be replayed on.
    #[inline(always)]
    pub fn flow_extent(&self) -> usize {
        self.flow_extent
    }

    /// Number of blocks handled by one parallel work unit. Mirrors a launch
    /// geometry of 2048 lanes per unit.
    #[inline(always)]
    pub fn blocks_per_unit(&self) -> usize {
        (2048 / self.block_size).max(1)
    }

    /// Number of parallel work units needed to cover every block once.
    #[inline(always)]
    pub fn num_units(&self) -> usize {
        self.blocks.len().div_ceil(self.blocks_per_unit())
    }

    /// A zeroed flow accumulator sized for this schedule's nodes.
    pub fn new_accumulator(&self) -> FlowAccumulator {
        FlowAccumulator::new(self.tot_num_nodes())
    }
}
