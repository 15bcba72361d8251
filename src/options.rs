//! Per-operation options.
//!
//! `tensor_name` is the caching key: with collective caching enabled, the
//! substrate may reuse internal plan state across calls that share a name.

use crate::datatype::ReduceOp;

/// Options for [`ProcessGroup::broadcast`](crate::ProcessGroup::broadcast).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Rank whose buffer is sent
    pub root_rank: usize,
    /// Caching key
    pub tensor_name: String,
}

/// Options for [`ProcessGroup::allreduce`](crate::ProcessGroup::allreduce).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllreduceOptions {
    /// Reduction operator
    pub reduce_op: ReduceOp,
    /// Caching key
    pub tensor_name: String,
}

/// Options for the coalesced all-reduce entry point.
pub type AllreduceCoalescedOptions = AllreduceOptions;

/// Options for [`ProcessGroup::reduce`](crate::ProcessGroup::reduce).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    /// Reduction operator
    pub reduce_op: ReduceOp,
    /// Rank receiving the result
    pub root_rank: usize,
    /// Caching key
    pub tensor_name: String,
}

/// Options for the all-gather family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllgatherOptions {
    /// Caching key
    pub tensor_name: String,
}

/// Options for [`ProcessGroup::gather`](crate::ProcessGroup::gather).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherOptions {
    /// Rank receiving every contribution
    pub root_rank: usize,
    /// Caching key
    pub tensor_name: String,
}

/// Options for [`ProcessGroup::scatter`](crate::ProcessGroup::scatter).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterOptions {
    /// Rank sending one buffer to every rank
    pub root_rank: usize,
    /// Caching key
    pub tensor_name: String,
}

/// Options for the reduce-scatter entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceScatterOptions {
    /// Reduction operator
    pub reduce_op: ReduceOp,
}

/// Options for the all-to-all family.
///
/// Split sizes count rows of dimension 0, one entry per rank. Empty lists
/// mean "divide evenly across the group".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllToAllOptions {
    /// Rows of the output received from each rank
    pub output_split_sizes: Vec<usize>,
    /// Rows of the input sent to each rank
    pub input_split_sizes: Vec<usize>,
    /// Caching key
    pub tensor_name: String,
}

impl AllToAllOptions {
    /// Uneven exchange with explicit per-rank row counts.
    pub fn with_splits(output_split_sizes: Vec<usize>, input_split_sizes: Vec<usize>) -> Self {
        AllToAllOptions {
            output_split_sizes,
            input_split_sizes,
            tensor_name: String::new(),
        }
    }

    /// True when neither side carries explicit splits.
    pub fn is_even(&self) -> bool {
        self.output_split_sizes.is_empty() && self.input_split_sizes.is_empty()
    }
}

/// Options for [`ProcessGroup::barrier`](crate::ProcessGroup::barrier).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierOptions {}
