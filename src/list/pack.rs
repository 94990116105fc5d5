//! Compact encodings for change batches.
//!
//! Typing produces long runs of appends that share one anchor, and
//! deleting a selection produces long runs of deletions. Such runs are
//! stored as the first change in full, flagged `"compacted": true`, followed
//! by only the payloads of the remaining changes:
//!
//! ```text
//! [{"op":"app","value":"a","after":X,"compacted":true}, "b", "c"]
//! [{"op":"del","insertion":A,"compacted":true}, B, C]
//! ```
//!
//! Plain text goes one step further and concatenates the trailing
//! single-grapheme strings into one string, split again on unpack.
//!
//! Anything else passes through as plain change objects.

use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

use crate::header::DocKind;
use crate::id::OpId;
use crate::list::ListError;
use crate::list::op::After;
use crate::list::op::ListOp;
use crate::list::op::op_id_from_value;
use crate::list::op::op_id_to_value;

const COMPACTED: &str = "compacted";

pub trait Packer: Send + Sync {
    fn pack(&self, ops: &[ListOp]) -> Vec<Value>;
    fn unpack(&self, changes: &[Value]) -> Result<Vec<ListOp>, ListError>;
}

/// Packer for documents holding arbitrary JSON values.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListPacker;

/// Packer for plain text, whose values are single graphemes.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextPacker;

pub fn packer_for(kind: DocKind) -> &'static dyn Packer {
    return match kind {
        DocKind::List => &ListPacker,
        DocKind::PlainText => &TextPacker,
    };
}

/// The shape of a batch, as far as compaction cares.
enum Run<'a> {
    Appends { values: Vec<&'a Value> },
    Deletions { targets: Vec<&'a OpId> },
    Mixed,
}

fn classify(ops: &[ListOp]) -> Run<'_> {
    if ops.len() < 2 {
        return Run::Mixed;
    }
    match &ops[0] {
        ListOp::App { after: anchor, .. } => {
            let mut values = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    ListOp::App { value, after } if after == anchor => values.push(value),
                    _ => return Run::Mixed,
                }
            }
            return Run::Appends { values };
        }
        ListOp::Del { .. } => {
            let mut targets = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    ListOp::Del { insertion } => targets.push(insertion),
                    _ => return Run::Mixed,
                }
            }
            return Run::Deletions { targets };
        }
        ListOp::Pre { .. } => return Run::Mixed,
    }
}

fn compacted_head(op: &ListOp) -> Value {
    let mut head = op.to_value();
    if let Value::Object(map) = &mut head {
        map.insert(COMPACTED.into(), Value::Bool(true));
    }
    return head;
}

fn is_compacted(change: &Value) -> bool {
    return change.get(COMPACTED).and_then(Value::as_bool).unwrap_or(false);
}

fn passthrough(ops: &[ListOp]) -> Vec<Value> {
    return ops.iter().map(ListOp::to_value).collect();
}

/// Expand a compacted batch, with `expand` turning one trailing payload
/// into the values it stands for.
fn unpack_with(changes: &[Value], expand: impl Fn(&Value, &mut Vec<Value>)) -> Result<Vec<ListOp>, ListError> {
    let Some(first) = changes.first() else {
        return Ok(Vec::new());
    };
    if !is_compacted(first) {
        return changes.iter().map(ListOp::from_value).collect();
    }
    let head = ListOp::from_value(first)?;
    let mut ops = Vec::with_capacity(changes.len());
    match &head {
        ListOp::App { after, .. } => {
            let after: After = *after;
            ops.push(head.clone());
            let mut values = Vec::new();
            for payload in &changes[1..] {
                expand(payload, &mut values);
            }
            ops.extend(values.into_iter().map(|value| ListOp::App { value, after }));
        }
        ListOp::Del { .. } => {
            ops.push(head.clone());
            for payload in &changes[1..] {
                ops.push(ListOp::Del {
                    insertion: op_id_from_value(payload)?,
                });
            }
        }
        ListOp::Pre { .. } => {
            return Err(ListError::Malformed("prepends are never compacted".into()));
        }
    }
    return Ok(ops);
}

impl Packer for ListPacker {
    fn pack(&self, ops: &[ListOp]) -> Vec<Value> {
        return match classify(ops) {
            Run::Appends { values } => {
                let mut out = Vec::with_capacity(values.len());
                out.push(compacted_head(&ops[0]));
                out.extend(values[1..].iter().map(|v| (*v).clone()));
                out
            }
            Run::Deletions { targets } => {
                let mut out = Vec::with_capacity(targets.len());
                out.push(compacted_head(&ops[0]));
                out.extend(targets[1..].iter().map(|t| op_id_to_value(t)));
                out
            }
            Run::Mixed => passthrough(ops),
        };
    }

    fn unpack(&self, changes: &[Value]) -> Result<Vec<ListOp>, ListError> {
        return unpack_with(changes, |payload, out| out.push(payload.clone()));
    }
}

fn is_single_grapheme(value: &Value) -> bool {
    return match value.as_str() {
        Some(s) => s.graphemes(true).count() == 1,
        None => false,
    };
}

impl Packer for TextPacker {
    fn pack(&self, ops: &[ListOp]) -> Vec<Value> {
        return match classify(ops) {
            Run::Appends { values } if values.iter().all(|v| is_single_grapheme(v)) => {
                let tail: String = values[1..].iter().filter_map(|v| v.as_str()).collect();
                // Neighbouring graphemes can fuse ("\r" + "\n", paired flags).
                let splits_back = tail.graphemes(true).eq(values[1..].iter().filter_map(|v| v.as_str()));
                if splits_back {
                    vec![compacted_head(&ops[0]), Value::String(tail)]
                } else {
                    passthrough(ops)
                }
            }
            // Trailing strings are split on unpack, so longer ones must not be compacted.
            Run::Appends { .. } => passthrough(ops),
            _ => ListPacker.pack(ops),
        };
    }

    fn unpack(&self, changes: &[Value]) -> Result<Vec<ListOp>, ListError> {
        return unpack_with(changes, |payload, out| match payload {
            Value::String(text) => out.extend(text.graphemes(true).map(|g| Value::String(g.to_string()))),
            other => out.push(other.clone()),
        });
    }
}
