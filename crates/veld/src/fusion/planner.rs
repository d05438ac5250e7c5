//! Greedy bottom-up fusion planning.
//!
//! The planner walks the DAG below a requested root and decides where fusion
//! must stop. A node becomes a partition boundary (a forced materialization
//! point) when any of:
//!
//! - it is a buffer leaf or was materialized by an earlier evaluation
//!   (already available, supplies an input, never recomputed);
//! - its fused depth inside the current region reaches the configured height
//!   limit (bounds per-kernel complexity and argument pressure);
//! - it has more than one distinct unevaluated consumer and is not trivially
//!   cheap to recompute;
//! - it is consumed by an indexing operation, which must read materialized
//!   data;
//! - it is the requested root.
//!
//! Each computed boundary heads one kernel partition covering the maximal
//! fused region below it. Partitions come out in dependency order: every
//! partition's inputs are leaf buffers or outputs of strictly earlier
//! partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::ComputeBackend;
use crate::graph::{Node, NodeId};

/// One fused kernel launch: interior nodes in topological order, the
/// boundary nodes it reads, and the single node it computes.
pub struct KernelPartition<B: ComputeBackend + 'static> {
    /// Nodes computed inside this kernel, children before parents. The last
    /// entry is always `root`.
    pub nodes: Vec<Arc<Node<B>>>,
    /// Boundary nodes read as kernel inputs, in first-use order. Each is a
    /// buffer leaf, a previously materialized node, or the root of an
    /// earlier partition in the same plan.
    pub inputs: Vec<Arc<Node<B>>>,
    /// The node whose value this kernel writes out.
    pub root: Arc<Node<B>>,
}

/// Partitions the DAG rooted at `root` into an ordered list of kernels.
///
/// `materialized` names nodes whose buffers an earlier evaluation already
/// produced. A root that is itself available yields the empty plan.
pub fn plan<B: ComputeBackend + 'static>(
    root: &Arc<Node<B>>,
    materialized: &HashSet<NodeId>,
    height_limit: usize,
) -> Vec<KernelPartition<B>> {
    let height_limit = height_limit.max(1);
    if is_available(root, materialized) {
        return Vec::new();
    }

    // Post-order collection: children appear before parents.
    let topo = topo_order(root);
    let topo_index: HashMap<NodeId, usize> = topo
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id(), idx))
        .collect();

    // Distinct consumer counts within the planned subgraph, plus the set of
    // nodes feeding an indexing operation.
    let mut consumers: HashMap<NodeId, usize> = HashMap::new();
    let mut index_read: HashSet<NodeId> = HashSet::new();
    for node in &topo {
        let fuses_through = node
            .operation()
            .map(|op| op.fuses_through_operands())
            .unwrap_or(true);
        let mut seen = HashSet::new();
        for child in node.children() {
            if seen.insert(child.id()) {
                *consumers.entry(child.id()).or_insert(0) += 1;
            }
            if !fuses_through {
                index_read.insert(child.id());
            }
        }
    }

    // Boundary classification with fused-depth tracking. Boundary children
    // contribute zero depth to their consumers.
    let mut boundary: HashSet<NodeId> = HashSet::new();
    let mut fused_depth: HashMap<NodeId, usize> = HashMap::new();
    for node in &topo {
        let id = node.id();
        if is_available(node, materialized) {
            boundary.insert(id);
            continue;
        }
        let depth = 1 + node
            .children()
            .iter()
            .map(|child| {
                if boundary.contains(&child.id()) {
                    0
                } else {
                    fused_depth[&child.id()]
                }
            })
            .max()
            .unwrap_or(0);
        fused_depth.insert(id, depth);

        let shared = consumers.get(&id).copied().unwrap_or(0) > 1;
        let cheap = node
            .operation()
            .map(|op| op.is_trivially_cheap())
            .unwrap_or(false);
        if id == root.id()
            || depth >= height_limit
            || (shared && !cheap)
            || index_read.contains(&id)
        {
            boundary.insert(id);
        }
    }

    // One partition per computed boundary, gathered back to the previous
    // boundaries. Trivially cheap shared nodes are not boundaries and may be
    // re-gathered into several partitions; everything else appears exactly
    // once.
    let mut partitions = Vec::new();
    for node in &topo {
        if !boundary.contains(&node.id()) || is_available(node, materialized) {
            continue;
        }
        partitions.push(gather_partition(node, &boundary, materialized, &topo_index));
    }
    partitions
}

fn is_available<B: ComputeBackend + 'static>(
    node: &Arc<Node<B>>,
    materialized: &HashSet<NodeId>,
) -> bool {
    node.is_buffer() || materialized.contains(&node.id())
}

/// Iterative post-order traversal; each node visited once by identity.
fn topo_order<B: ComputeBackend + 'static>(root: &Arc<Node<B>>) -> Vec<Arc<Node<B>>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Arc<Node<B>>, bool)> = vec![(Arc::clone(root), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for child in node.children() {
            if !visited.contains(&child.id()) {
                stack.push((Arc::clone(child), false));
            }
        }
    }
    order
}

/// Collects the maximal fused region headed by `head`: interior nodes in
/// topological order, boundary/available children as inputs in first-use
/// order.
fn gather_partition<B: ComputeBackend + 'static>(
    head: &Arc<Node<B>>,
    boundary: &HashSet<NodeId>,
    materialized: &HashSet<NodeId>,
    topo_index: &HashMap<NodeId, usize>,
) -> KernelPartition<B> {
    let mut interior: Vec<Arc<Node<B>>> = Vec::new();
    let mut interior_seen: HashSet<NodeId> = HashSet::new();
    let mut inputs: Vec<Arc<Node<B>>> = Vec::new();
    let mut input_seen: HashSet<NodeId> = HashSet::new();

    let mut stack: Vec<Arc<Node<B>>> = vec![Arc::clone(head)];
    while let Some(node) = stack.pop() {
        let id = node.id();
        let cut = !Arc::ptr_eq(&node, head)
            && (boundary.contains(&id) || is_available(&node, materialized));
        if cut {
            if input_seen.insert(id) {
                inputs.push(node);
            }
            continue;
        }
        if !interior_seen.insert(id) {
            continue;
        }
        interior.push(Arc::clone(&node));
        for child in node.children() {
            stack.push(Arc::clone(child));
        }
    }

    interior.sort_by_key(|node| topo_index[&node.id()]);
    KernelPartition {
        nodes: interior,
        inputs,
        root: Arc::clone(head),
    }
}
