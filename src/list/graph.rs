//! The insertion graph behind a list.
//!
//! Every insertion is a node in an arena. An append links its node as a
//! successor of its anchor; a prepend links it as a predecessor. Inserts
//! at the start or end become roots. The visible order is a depth-first
//! walk from the roots:
//!
//! - a node's predecessors come before it, oldest first;
//! - a node's successors come after it, newest first;
//! - start roots come newest first, then end roots oldest first.
//!
//! "Newest" is decided by [`OrderKey`], a total order over operations, so
//! every replica that folds the same set of operations walks the same
//! graph no matter what order they arrived in.
//!
//! Deletions are tombstones keyed by the deleted insertion. An operation
//! whose anchor is not known yet waits in `pending` and is linked as soon
//! as the anchor shows up.
//!
//! Complexity:
//! - insert: O(log d) to place among d siblings, amortized O(1) when the
//!   new op is the newest (the common case)
//! - delete: O(1)
//! - flatten: O(n), with chained runs emitted without stack traffic

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde_json::Value;
use smallvec::SmallVec;

use crate::id::OpId;
use crate::id::SessionKey;
use crate::list::chain::ChainStats;
use crate::list::chain::Chains;
use crate::list::op::After;
use crate::list::op::Before;
use crate::list::op::ListOp;

pub(crate) type NodeIdx = u32;

/// Deterministic total order over operations: timestamp, then session,
/// then position inside the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub made_at: u64,
    pub key: SessionKey,
    pub tx_index: u32,
    pub change_idx: u32,
}

impl OrderKey {
    pub fn new(id: &OpId, made_at: u64) -> OrderKey {
        return OrderKey {
            made_at,
            key: id.key,
            tx_index: id.tx_index,
            change_idx: id.change_idx,
        };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    App,
    Pre,
}

#[derive(Clone, Debug)]
pub(crate) struct Insertion {
    pub(crate) id: OpId,
    pub(crate) made_at: u64,
    pub(crate) value: Value,
    pub(crate) kind: Kind,
    /// Ascending by order key; emitted oldest first.
    pub(crate) predecessors: SmallVec<[NodeIdx; 2]>,
    /// Ascending by order key; emitted newest first.
    pub(crate) successors: SmallVec<[NodeIdx; 2]>,
}

impl Insertion {
    pub(crate) fn order_key(&self) -> OrderKey {
        return OrderKey::new(&self.id, self.made_at);
    }

    pub(crate) fn is_append(&self) -> bool {
        return self.kind == Kind::App;
    }
}

/// A deletion as it was merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tombstone {
    pub(crate) id: OpId,
    pub(crate) made_at: u64,
    pub(crate) target: OpId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Successor,
    Predecessor,
}

#[derive(Clone, Debug)]
pub(crate) struct Graph {
    nodes: Vec<Insertion>,
    index: FxHashMap<OpId, NodeIdx>,
    after_start: Vec<NodeIdx>,
    before_end: Vec<NodeIdx>,
    pending: FxHashMap<OpId, SmallVec<[(NodeIdx, Side); 1]>>,
    tombstones: Vec<Tombstone>,
    deleted: FxHashMap<OpId, SmallVec<[u32; 1]>>,
    seen_deletions: FxHashSet<OpId>,
    chains: Chains,
    use_chains: bool,
}

impl Graph {
    pub(crate) fn new(use_chains: bool) -> Graph {
        return Graph {
            nodes: Vec::new(),
            index: FxHashMap::default(),
            after_start: Vec::new(),
            before_end: Vec::new(),
            pending: FxHashMap::default(),
            tombstones: Vec::new(),
            deleted: FxHashMap::default(),
            seen_deletions: FxHashSet::default(),
            chains: Chains::new(),
            use_chains,
        };
    }

    pub(crate) fn node(&self, idx: NodeIdx) -> &Insertion {
        return &self.nodes[idx as usize];
    }

    pub(crate) fn node_count(&self) -> usize {
        return self.nodes.len();
    }

    pub(crate) fn tombstones(&self) -> &[Tombstone] {
        return &self.tombstones;
    }

    pub(crate) fn is_deleted(&self, id: &OpId) -> bool {
        return self.deleted.get(id).is_some_and(|d| !d.is_empty());
    }

    /// Operations waiting for an anchor this replica has not seen.
    pub(crate) fn pending_count(&self) -> usize {
        return self.pending.values().map(|p| p.len()).sum();
    }

    pub(crate) fn chain_stats(&self) -> ChainStats {
        return self.chains.stats(self.nodes.len());
    }

    /// Merge one operation. Returns false if it was already merged.
    pub(crate) fn apply(&mut self, id: OpId, made_at: u64, op: ListOp) -> bool {
        return match op {
            ListOp::App { value, after } => self.insert(id, made_at, value, Kind::App, Anchor::After(after)),
            ListOp::Pre { value, before } => self.insert(id, made_at, value, Kind::Pre, Anchor::Before(before)),
            ListOp::Del { insertion } => self.delete(id, made_at, insertion),
        };
    }

    fn insert(&mut self, id: OpId, made_at: u64, value: Value, kind: Kind, anchor: Anchor) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let idx = self.nodes.len() as NodeIdx;
        self.nodes.push(Insertion {
            id,
            made_at,
            value,
            kind,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
        });
        self.index.insert(id, idx);
        self.chains.push_node();

        match anchor {
            Anchor::After(After::Start) => {
                let pos = position(&self.after_start, idx, &self.nodes);
                self.after_start.insert(pos, idx);
            }
            Anchor::Before(Before::End) => {
                let pos = position(&self.before_end, idx, &self.nodes);
                self.before_end.insert(pos, idx);
            }
            Anchor::After(After::Op(target)) => self.link_or_wait(target, idx, Side::Successor),
            Anchor::Before(Before::Op(target)) => self.link_or_wait(target, idx, Side::Predecessor),
        }

        if let Some(waiting) = self.pending.remove(&id) {
            for (dependent, side) in waiting {
                self.link(idx, dependent, side);
            }
        }
        return true;
    }

    fn link_or_wait(&mut self, target: OpId, dependent: NodeIdx, side: Side) {
        if target == self.nodes[dependent as usize].id {
            // Anchored to itself: never reachable, never linked.
            return;
        }
        match self.index.get(&target) {
            Some(&anchor) => self.link(anchor, dependent, side),
            None => self.pending.entry(target).or_default().push((dependent, side)),
        }
    }

    fn link(&mut self, anchor: NodeIdx, dependent: NodeIdx, side: Side) {
        let a = anchor as usize;
        match side {
            Side::Successor => {
                let pos = position(&self.nodes[a].successors, dependent, &self.nodes);
                self.nodes[a].successors.insert(pos, dependent);
                if self.use_chains {
                    self.chains.on_successor(&self.nodes, anchor, dependent);
                }
            }
            Side::Predecessor => {
                let pos = position(&self.nodes[a].predecessors, dependent, &self.nodes);
                self.nodes[a].predecessors.insert(pos, dependent);
                if self.use_chains {
                    self.chains.on_predecessor(anchor, dependent);
                }
            }
        }
    }

    fn delete(&mut self, id: OpId, made_at: u64, target: OpId) -> bool {
        if !self.seen_deletions.insert(id) {
            return false;
        }
        let slot = self.tombstones.len() as u32;
        self.tombstones.push(Tombstone { id, made_at, target });
        self.deleted.entry(target).or_default().push(slot);
        return true;
    }

    /// The visible nodes, in list order.
    pub(crate) fn flatten(&self) -> Vec<NodeIdx> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeIdx, bool)> = Vec::new();
        for &root in self.after_start.iter().rev() {
            self.walk(root, &mut stack, &mut out);
        }
        for &root in self.before_end.iter() {
            self.walk(root, &mut stack, &mut out);
        }
        return out;
    }

    fn walk(&self, root: NodeIdx, stack: &mut Vec<(NodeIdx, bool)>, out: &mut Vec<NodeIdx>) {
        stack.push((root, false));
        while let Some((idx, preds_done)) = stack.pop() {
            let node = self.node(idx);
            if !preds_done && !node.predecessors.is_empty() {
                stack.push((idx, true));
                // Oldest predecessor must pop first.
                for &p in node.predecessors.iter().rev() {
                    stack.push((p, false));
                }
                continue;
            }

            let mut last = idx;
            match self.chains.headed_by(idx) {
                Some(members) => {
                    for &m in members {
                        self.emit(m, out);
                    }
                    if let Some(&tail) = members.last() {
                        last = tail;
                    }
                }
                None => self.emit(idx, out),
            }

            // Newest successor must pop first.
            for &s in self.node(last).successors.iter() {
                stack.push((s, false));
            }
        }
    }

    #[inline]
    fn emit(&self, idx: NodeIdx, out: &mut Vec<NodeIdx>) {
        if !self.is_deleted(&self.node(idx).id) {
            out.push(idx);
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Anchor {
    After(After),
    Before(Before),
}

/// Where `idx` belongs in a list kept ascending by order key.
fn position(list: &[NodeIdx], idx: NodeIdx, nodes: &[Insertion]) -> usize {
    let key = nodes[idx as usize].order_key();
    return list.partition_point(|&n| nodes[n as usize].order_key() < key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SessionId;
    use crate::id::TxId;
    use crate::key::KeyPair;
    use serde_json::json;

    fn session(seed: u8) -> SessionKey {
        return SessionKey::main(SessionId::with_nonce(KeyPair::from_seed([seed; 32]).key_pub, 0));
    }

    fn id(seed: u8, tx: u32) -> OpId {
        return TxId {
            key: session(seed),
            tx_index: tx,
        }
        .op(0);
    }

    fn values(graph: &Graph) -> Vec<Value> {
        return graph.flatten().into_iter().map(|i| graph.node(i).value.clone()).collect();
    }

    fn app(value: &str, after: After) -> ListOp {
        return ListOp::App {
            value: json!(value),
            after,
        };
    }

    #[test]
    fn successors_emit_newest_first() {
        for chains in [false, true] {
            let mut g = Graph::new(chains);
            g.apply(id(1, 0), 1, app("a", After::Start));
            g.apply(id(1, 1), 2, app("old", After::Op(id(1, 0))));
            g.apply(id(1, 2), 3, app("new", After::Op(id(1, 0))));
            assert_eq!(values(&g), vec![json!("a"), json!("new"), json!("old")]);
        }
    }

    #[test]
    fn predecessors_emit_oldest_first() {
        let mut g = Graph::new(true);
        g.apply(id(1, 0), 1, app("x", After::Start));
        g.apply(
            id(1, 1),
            2,
            ListOp::Pre {
                value: json!("a"),
                before: Before::Op(id(1, 0)),
            },
        );
        g.apply(
            id(1, 2),
            3,
            ListOp::Pre {
                value: json!("b"),
                before: Before::Op(id(1, 0)),
            },
        );
        assert_eq!(values(&g), vec![json!("a"), json!("b"), json!("x")]);
    }

    #[test]
    fn ties_break_by_session() {
        let mut g = Graph::new(true);
        g.apply(id(1, 0), 1, app("root", After::Start));
        g.apply(id(2, 0), 5, app("two", After::Op(id(1, 0))));
        g.apply(id(3, 0), 5, app("three", After::Op(id(1, 0))));

        let mut h = Graph::new(true);
        h.apply(id(3, 0), 5, app("three", After::Op(id(1, 0))));
        h.apply(id(1, 0), 1, app("root", After::Start));
        h.apply(id(2, 0), 5, app("two", After::Op(id(1, 0))));
        assert_eq!(values(&g), values(&h));
    }

    #[test]
    fn dangling_anchors_link_when_resolved() {
        let mut g = Graph::new(true);
        g.apply(id(1, 1), 2, app("b", After::Op(id(1, 0))));
        assert_eq!(g.pending_count(), 1);
        assert!(values(&g).is_empty());
        g.apply(id(1, 0), 1, app("a", After::Start));
        assert_eq!(g.pending_count(), 0);
        assert_eq!(values(&g), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn deletions_are_idempotent_and_speculative() {
        let mut g = Graph::new(true);
        let del = ListOp::Del { insertion: id(1, 0) };
        assert!(g.apply(id(2, 0), 2, del.clone()));
        assert!(!g.apply(id(2, 0), 2, del));
        assert!(g.is_deleted(&id(1, 0)));
        g.apply(id(1, 0), 1, app("gone", After::Start));
        assert!(values(&g).is_empty());
        assert_eq!(g.tombstones().len(), 1);
    }

    #[test]
    fn duplicate_insertions_are_ignored() {
        let mut g = Graph::new(true);
        assert!(g.apply(id(1, 0), 1, app("a", After::Start)));
        assert!(!g.apply(id(1, 0), 1, app("a", After::Start)));
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn self_anchored_ops_are_unreachable() {
        let mut g = Graph::new(true);
        g.apply(id(1, 0), 1, app("loop", After::Op(id(1, 0))));
        assert!(values(&g).is_empty());
    }

    #[test]
    fn sequential_typing_forms_one_chain() {
        let mut g = Graph::new(true);
        let mut after = After::Start;
        for (i, c) in "hello".chars().enumerate() {
            let op = id(1, i as u32);
            g.apply(op, i as u64 + 1, app(&c.to_string(), after));
            after = After::Op(op);
        }
        let stats = g.chain_stats();
        assert_eq!(stats.nodes, 5);
        assert_eq!(stats.chains, 1);
        assert_eq!(stats.chained_nodes, 5);
        assert_eq!(stats.compaction_ratio, 5.0);
        assert_eq!(values(&g).len(), 5);
    }

    #[test]
    fn branching_tears_chain_down() {
        let mut g = Graph::new(true);
        g.apply(id(1, 0), 1, app("a", After::Start));
        g.apply(id(1, 1), 2, app("b", After::Op(id(1, 0))));
        g.apply(id(1, 2), 3, app("c", After::Op(id(1, 1))));
        assert_eq!(g.chain_stats().chains, 1);
        g.apply(id(2, 0), 4, app("x", After::Op(id(1, 1))));
        assert_eq!(g.chain_stats().chains, 0);
        assert_eq!(values(&g), vec![json!("a"), json!("b"), json!("x"), json!("c")]);
    }

    #[test]
    fn prepends_never_chain() {
        let mut g = Graph::new(true);
        g.apply(id(1, 0), 1, app("a", After::Start));
        g.apply(
            id(1, 1),
            2,
            ListOp::Pre {
                value: json!("p"),
                before: Before::Op(id(1, 0)),
            },
        );
        g.apply(id(1, 2), 3, app("q", After::Op(id(1, 1))));
        assert_eq!(g.chain_stats().chains, 0);
        assert_eq!(values(&g), vec![json!("p"), json!("q"), json!("a")]);
    }
}
