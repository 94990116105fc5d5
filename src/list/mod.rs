//! Collaborative ordered lists.
//!
//! A [`CoList`] is a view over a [`DocLog`]: it folds every valid
//! transaction of the document into an insertion graph and reads the list
//! off that graph. Writes become transactions in the local session's log
//! and are folded straight back in, exactly like remote ones.
//!
//! Replicas that have seen the same transactions show the same list,
//! whatever order those transactions arrived in.

pub mod chain;
pub mod graph;
pub mod op;
pub mod pack;

use std::ops::Range;
use std::sync::OnceLock;

use serde_json::Value;

use crate::header::DocId;
use crate::header::DocKind;
use crate::id::OpId;
use crate::id::SessionKey;
use crate::id::TxId;
use crate::log::Cursor;
use crate::log::DocLog;
use crate::log::Privacy;
use crate::log::Session;
use crate::log::TxError;
use crate::log::ValidTransaction;

pub use chain::ChainStats;
pub use graph::OrderKey;
pub use op::After;
pub use op::Before;
pub use op::ListOp;
pub use pack::ListPacker;
pub use pack::Packer;
pub use pack::TextPacker;
pub use pack::packer_for;

use graph::Graph;
use graph::NodeIdx;

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("unknown list operation {0:?}")]
    UnknownOp(String),
    #[error("malformed list operation: {0}")]
    Malformed(String),
    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("document is unusable after a protocol violation: {0}")]
    Poisoned(String),
    #[error("expected a {expected:?} document, found {found:?}")]
    WrongKind { expected: DocKind, found: DocKind },
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// Who inserted an element, and when.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edit<'a> {
    pub op: OpId,
    pub by: SessionKey,
    pub made_at: u64,
    pub value: &'a Value,
}

/// Who deleted which element, and when.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletionEdit {
    pub op: OpId,
    pub by: SessionKey,
    pub made_at: u64,
    pub target: OpId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&CoList) + Send>;

#[derive(Debug)]
struct Snapshot {
    nodes: Vec<NodeIdx>,
    values: Vec<Value>,
    ops: Vec<OpId>,
}

pub struct CoList {
    log: DocLog,
    session: Session,
    graph: Graph,
    cursor: Cursor,
    newest_made_at: u64,
    snapshot: OnceLock<Snapshot>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_listener: u64,
    poisoned: Option<String>,
}

impl CoList {
    /// Open a list over `log`, writing as `session`. Everything already in
    /// the log is folded in.
    pub fn new(log: DocLog, session: Session) -> Result<CoList, ListError> {
        let graph = Graph::new(log.config().chains);
        let mut list = CoList {
            log,
            session,
            graph,
            cursor: Cursor::default(),
            newest_made_at: 0,
            snapshot: OnceLock::new(),
            listeners: Vec::new(),
            next_listener: 0,
            poisoned: None,
        };
        list.rebuild()?;
        return Ok(list);
    }

    pub fn id(&self) -> &DocId {
        return self.log.id();
    }

    pub fn kind(&self) -> DocKind {
        return self.log.header().kind;
    }

    pub fn log(&self) -> &DocLog {
        return &self.log;
    }

    /// Mutable access for feeding in remote transactions. Call
    /// [`process_new_transactions`](CoList::process_new_transactions) after.
    pub fn log_mut(&mut self) -> &mut DocLog {
        return &mut self.log;
    }

    pub fn session(&self) -> &Session {
        return &self.session;
    }

    pub fn is_poisoned(&self) -> bool {
        return self.poisoned.is_some();
    }

    fn check_poisoned(&self) -> Result<(), ListError> {
        return match &self.poisoned {
            Some(reason) => Err(ListError::Poisoned(reason.clone())),
            None => Ok(()),
        };
    }

    // ====================================================================
    // Merging
    // ====================================================================

    /// Fold in transactions that became valid since the last call.
    /// Returns true if the list changed.
    pub fn process_new_transactions(&mut self) -> Result<bool, ListError> {
        self.check_poisoned()?;
        let batch = self.log.valid_transactions_since(&mut self.cursor);
        let oldest = batch.transactions.first().map(|tx| tx.made_at);
        if batch.revalidated || oldest.is_some_and(|t| t < self.newest_made_at) {
            tracing::debug!(doc = %self.log.id(), revalidated = batch.revalidated, "rebuilding list");
            self.rebuild()?;
            return Ok(true);
        }
        if batch.transactions.is_empty() {
            return Ok(false);
        }
        let changed = self.fold(batch.transactions)?;
        if changed {
            self.refresh();
        }
        return Ok(changed);
    }

    /// Throw away all merged state and fold every valid transaction again.
    pub fn rebuild(&mut self) -> Result<(), ListError> {
        self.check_poisoned()?;
        self.graph = Graph::new(self.log.config().chains);
        self.cursor = Cursor::default();
        self.newest_made_at = 0;
        let batch = self.log.valid_transactions_since(&mut self.cursor);
        self.fold(batch.transactions)?;
        self.refresh();
        return Ok(());
    }

    fn fold(&mut self, transactions: Vec<ValidTransaction>) -> Result<bool, ListError> {
        let packer = packer_for(self.kind());
        let mut changed = false;
        for tx in transactions {
            let ops = match packer.unpack(&tx.changes) {
                Ok(ops) => ops,
                Err(err) => return Err(self.poison(&tx.id, err)),
            };
            for (i, op) in ops.into_iter().enumerate() {
                changed |= self.graph.apply(tx.id.op(i as u32), tx.made_at, op);
            }
            self.newest_made_at = self.newest_made_at.max(tx.made_at);
        }
        return Ok(changed);
    }

    fn poison(&mut self, tx: &TxId, err: ListError) -> ListError {
        let reason = format!("{err} in transaction {} of {}", tx.tx_index, tx.key);
        tracing::error!(doc = %self.log.id(), %reason, "list poisoned");
        self.poisoned = Some(reason);
        return err;
    }

    /// Drop the cached snapshot and tell listeners if the list changed.
    fn refresh(&mut self) {
        let before = self.snapshot.take();
        if self.listeners.is_empty() {
            return;
        }
        let unchanged = before.is_some_and(|old| old.ops == self.snapshot().ops);
        if unchanged {
            return;
        }
        let mut listeners = std::mem::take(&mut self.listeners);
        for (_, listener) in listeners.iter_mut() {
            listener(&*self);
        }
        self.listeners = listeners;
    }

    // ====================================================================
    // Reading
    // ====================================================================

    fn snapshot(&self) -> &Snapshot {
        return self.snapshot.get_or_init(|| {
            let nodes = self.graph.flatten();
            let values = nodes.iter().map(|&n| self.graph.node(n).value.clone()).collect();
            let ops = nodes.iter().map(|&n| self.graph.node(n).id).collect();
            Snapshot { nodes, values, ops }
        });
    }

    /// The visible elements in order.
    pub fn as_array(&self) -> &[Value] {
        return &self.snapshot().values;
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        return self.snapshot().values.get(index);
    }

    pub fn len(&self) -> usize {
        return self.snapshot().values.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    /// The insertion op behind each visible element.
    pub fn op_ids(&self) -> &[OpId] {
        return &self.snapshot().ops;
    }

    pub fn edit_at(&self, index: usize) -> Option<Edit<'_>> {
        let &node = self.snapshot().nodes.get(index)?;
        let insertion = self.graph.node(node);
        return Some(Edit {
            op: insertion.id,
            by: insertion.id.key,
            made_at: insertion.made_at,
            value: &insertion.value,
        });
    }

    /// Every merged deletion, in merge order.
    pub fn deletion_edits(&self) -> Vec<DeletionEdit> {
        return self
            .graph
            .tombstones()
            .iter()
            .map(|t| DeletionEdit {
                op: t.id,
                by: t.id.key,
                made_at: t.made_at,
                target: t.target,
            })
            .collect();
    }

    pub fn is_deleted(&self, insertion: &OpId) -> bool {
        return self.graph.is_deleted(insertion);
    }

    /// Operations waiting on an anchor this replica has not received.
    pub fn dangling(&self) -> usize {
        return self.graph.pending_count();
    }

    pub fn chain_stats(&self) -> ChainStats {
        return self.graph.chain_stats();
    }

    // ====================================================================
    // Writing
    // ====================================================================

    fn anchor_after(&self, after: Option<usize>) -> Result<After, ListError> {
        let ops = self.op_ids();
        let len = ops.len();
        let index = after.unwrap_or(len.saturating_sub(1));
        if len == 0 {
            if index != 0 {
                return Err(ListError::IndexOutOfRange { index, len });
            }
            return Ok(After::Start);
        }
        return ops
            .get(index)
            .map(|op| After::Op(*op))
            .ok_or(ListError::IndexOutOfRange { index, len });
    }

    fn anchor_before(&self, before: Option<usize>) -> Result<Before, ListError> {
        let ops = self.op_ids();
        let len = ops.len();
        let index = before.unwrap_or(0);
        if index == len {
            return Ok(Before::End);
        }
        return ops
            .get(index)
            .map(|op| Before::Op(*op))
            .ok_or(ListError::IndexOutOfRange { index, len });
    }

    fn target(&self, index: usize) -> Result<OpId, ListError> {
        let ops = self.op_ids();
        return ops.get(index).copied().ok_or(ListError::IndexOutOfRange { index, len: ops.len() });
    }

    /// Log `ops` as one transaction and fold it in.
    fn commit(&mut self, ops: Vec<ListOp>, privacy: Privacy) -> Result<Vec<OpId>, ListError> {
        self.check_poisoned()?;
        let changes = if self.log.config().pack_changes {
            packer_for(self.kind()).pack(&ops)
        } else {
            ops.iter().map(ListOp::to_value).collect()
        };
        let tx = self.log.make_transaction(&mut self.session, &changes, privacy)?;
        self.process_new_transactions()?;
        return Ok((0..ops.len() as u32).map(|i| tx.op(i)).collect());
    }

    /// Insert `item` right after the element at `after` (default: the last
    /// element). Into an empty list, `after` must be 0 or absent.
    pub fn append(&mut self, item: Value, after: Option<usize>, privacy: Privacy) -> Result<OpId, ListError> {
        let ids = self.append_items(vec![item], after, privacy)?;
        return ids.into_iter().next().ok_or(ListError::Malformed("empty append".into()));
    }

    /// Insert `items`, in order, right after the element at `after`.
    pub fn append_items(&mut self, items: Vec<Value>, after: Option<usize>, privacy: Privacy) -> Result<Vec<OpId>, ListError> {
        let anchor = self.anchor_after(after)?;
        // Successors of one anchor show newest first, so the last item goes first.
        let ops: Vec<ListOp> = items
            .into_iter()
            .rev()
            .map(|value| ListOp::App { value, after: anchor })
            .collect();
        let mut ids = self.commit(ops, privacy)?;
        ids.reverse();
        return Ok(ids);
    }

    /// Insert `item` right before the element at `before` (default: the
    /// first element). `before == len` inserts at the end.
    pub fn prepend(&mut self, item: Value, before: Option<usize>, privacy: Privacy) -> Result<OpId, ListError> {
        let ids = self.prepend_items(vec![item], before, privacy)?;
        return ids.into_iter().next().ok_or(ListError::Malformed("empty prepend".into()));
    }

    /// Insert `items`, in order, right before the element at `before`.
    pub fn prepend_items(&mut self, items: Vec<Value>, before: Option<usize>, privacy: Privacy) -> Result<Vec<OpId>, ListError> {
        let anchor = self.anchor_before(before)?;
        let ops = items
            .into_iter()
            .map(|value| ListOp::Pre { value, before: anchor })
            .collect();
        return self.commit(ops, privacy);
    }

    pub fn delete(&mut self, index: usize, privacy: Privacy) -> Result<OpId, ListError> {
        let target = self.target(index)?;
        let ids = self.commit(vec![ListOp::Del { insertion: target }], privacy)?;
        return ids.into_iter().next().ok_or(ListError::Malformed("empty delete".into()));
    }

    /// Delete every element in `range` in one transaction.
    pub fn delete_range(&mut self, range: Range<usize>, privacy: Privacy) -> Result<Vec<OpId>, ListError> {
        let len = self.len();
        if range.end > len || range.start > range.end {
            return Err(ListError::IndexOutOfRange { index: range.end, len });
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let ops = self.op_ids()[range]
            .iter()
            .map(|op| ListOp::Del { insertion: *op })
            .collect();
        return self.commit(ops, privacy);
    }

    /// Swap the element at `index` for `item`, atomically.
    pub fn replace(&mut self, index: usize, item: Value, privacy: Privacy) -> Result<OpId, ListError> {
        let target = self.target(index)?;
        let ops = vec![
            ListOp::App {
                value: item,
                after: After::Op(target),
            },
            ListOp::Del { insertion: target },
        ];
        let ids = self.commit(ops, privacy)?;
        return ids.into_iter().next().ok_or(ListError::Malformed("empty replace".into()));
    }

    // ====================================================================
    // Subscriptions
    // ====================================================================

    /// Call `listener` after every merge that changes the list.
    pub fn subscribe(&mut self, listener: impl FnMut(&CoList) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        return id;
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        return self.listeners.len() != before;
    }
}

impl std::fmt::Debug for CoList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("CoList")
            .field("id", self.id())
            .field("items", &self.as_array())
            .field("poisoned", &self.poisoned)
            .finish();
    }
}
