//! Chain compaction for the insertion graph.
//!
//! Sequential typing produces long linear runs: each node is the only
//! successor of the one before it, and nothing else points into the run.
//! Such a run is recorded as a chain so the walk can emit it in one step
//! instead of pushing and popping every node.
//!
//! Invariants of a chain `[m0, m1, .., mk]`, k >= 1:
//! - each `m(i+1)` was appended directly after `m(i)`, and is `m(i)`'s
//!   only successor;
//! - no member after the head has predecessors or other successors;
//! - only the last member may have successors outside the chain.
//!
//! Any new edge that would break these tears the whole chain down. The
//! members simply become ordinary nodes again, so tearing down is always
//! safe; it only costs speed.

use rustc_hash::FxHashMap;

use crate::list::graph::Insertion;
use crate::list::graph::NodeIdx;

const NONE: NodeIdx = NodeIdx::MAX;

/// Counters describing how well the graph is compressed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChainStats {
    /// Insertions in the graph.
    pub nodes: usize,
    /// Live chains.
    pub chains: usize,
    /// Insertions that are members of some chain.
    pub chained_nodes: usize,
    /// Nodes per walk step: `nodes / (nodes - chained_nodes + chains)`.
    pub compaction_ratio: f64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Chains {
    /// Head of the chain each node belongs to, or `NONE`.
    head_of: Vec<NodeIdx>,
    members: FxHashMap<NodeIdx, Vec<NodeIdx>>,
}

impl Chains {
    pub(crate) fn new() -> Chains {
        return Chains::default();
    }

    /// Make room for a newly created node.
    pub(crate) fn push_node(&mut self) {
        self.head_of.push(NONE);
    }

    /// Members of the chain headed by `node`, if `node` is a head.
    pub(crate) fn headed_by(&self, node: NodeIdx) -> Option<&[NodeIdx]> {
        return self.members.get(&node).map(|m| m.as_slice());
    }

    pub(crate) fn is_chained(&self, node: NodeIdx) -> bool {
        return self.head_of.get(node as usize).is_some_and(|h| *h != NONE);
    }

    /// Update chains after `dependent` was linked as a successor of `anchor`.
    pub(crate) fn on_successor(&mut self, nodes: &[Insertion], anchor: NodeIdx, dependent: NodeIdx) {
        let a = &nodes[anchor as usize];
        let d = &nodes[dependent as usize];
        let linear = a.is_append()
            && d.is_append()
            && a.successors.len() == 1
            && d.predecessors.is_empty()
            && d.successors.is_empty()
            && !self.is_chained(dependent);
        if !linear {
            self.tear_down(anchor);
            self.tear_down(dependent);
            return;
        }

        let head = self.head_of[anchor as usize];
        if head == NONE {
            self.members.insert(anchor, vec![anchor, dependent]);
            self.head_of[anchor as usize] = anchor;
            self.head_of[dependent as usize] = anchor;
            return;
        }
        let Some(members) = self.members.get_mut(&head) else {
            return;
        };
        if members.last() == Some(&anchor) {
            members.push(dependent);
            self.head_of[dependent as usize] = head;
        } else {
            self.tear_down(head);
        }
    }

    /// Update chains after `dependent` was linked as a predecessor of `anchor`.
    pub(crate) fn on_predecessor(&mut self, anchor: NodeIdx, dependent: NodeIdx) {
        // The head itself may gain predecessors: the walk visits them before
        // emitting the chain. Any other member may not.
        if self.head_of[anchor as usize] != anchor {
            self.tear_down(anchor);
        }
        self.tear_down(dependent);
    }

    /// Dissolve the chain containing `node`, if any.
    pub(crate) fn tear_down(&mut self, node: NodeIdx) {
        let head = match self.head_of.get(node as usize) {
            Some(h) if *h != NONE => *h,
            _ => return,
        };
        if let Some(members) = self.members.remove(&head) {
            tracing::trace!(head, len = members.len(), "chain torn down");
            for m in members {
                self.head_of[m as usize] = NONE;
            }
        }
    }

    pub(crate) fn stats(&self, nodes: usize) -> ChainStats {
        let chains = self.members.len();
        let chained_nodes: usize = self.members.values().map(|m| m.len()).sum();
        let steps = (nodes - chained_nodes + chains).max(1);
        return ChainStats {
            nodes,
            chains,
            chained_nodes,
            compaction_ratio: nodes as f64 / steps as f64,
        };
    }
}
