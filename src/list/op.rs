//! List operations as they are stored in transactions.
//!
//! Every change names a stable anchor instead of a position, so it can be
//! merged with concurrent edits:
//! - `app`: "this value goes right after element X" (or at the start)
//! - `pre`: "this value goes right before element X" (or at the end)
//! - `del`: "element X is gone"
//!
//! On the wire a change is a JSON object tagged by `op`.

use serde_json::Map;
use serde_json::Value;

use crate::id::OpId;
use crate::list::ListError;

/// Anchor of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum After {
    Start,
    Op(OpId),
}

/// Anchor of a prepend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Before {
    End,
    Op(OpId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListOp {
    App { value: Value, after: After },
    Pre { value: Value, before: Before },
    Del { insertion: OpId },
}

pub(crate) fn op_id_to_value(id: &OpId) -> Value {
    let mut map = Map::new();
    map.insert("sessionID".into(), Value::String(id.key.to_string()));
    map.insert("txIndex".into(), Value::from(id.tx_index));
    map.insert("changeIdx".into(), Value::from(id.change_idx));
    return Value::Object(map);
}

pub(crate) fn op_id_from_value(value: &Value) -> Result<OpId, ListError> {
    return serde_json::from_value(value.clone()).map_err(|e| ListError::Malformed(format!("bad op id: {e}")));
}

impl After {
    pub fn to_value(&self) -> Value {
        return match self {
            After::Start => Value::String("start".into()),
            After::Op(id) => op_id_to_value(id),
        };
    }

    pub fn from_value(value: &Value) -> Result<After, ListError> {
        if value.as_str() == Some("start") {
            return Ok(After::Start);
        }
        return op_id_from_value(value).map(After::Op);
    }
}

impl Before {
    pub fn to_value(&self) -> Value {
        return match self {
            Before::End => Value::String("end".into()),
            Before::Op(id) => op_id_to_value(id),
        };
    }

    pub fn from_value(value: &Value) -> Result<Before, ListError> {
        if value.as_str() == Some("end") {
            return Ok(Before::End);
        }
        return op_id_from_value(value).map(Before::Op);
    }
}

fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value, ListError> {
    return obj.get(name).ok_or_else(|| ListError::Malformed(format!("missing field {name:?}")));
}

impl ListOp {
    /// The wire tag.
    pub fn tag(&self) -> &'static str {
        return match self {
            ListOp::App { .. } => "app",
            ListOp::Pre { .. } => "pre",
            ListOp::Del { .. } => "del",
        };
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("op".into(), Value::String(self.tag().into()));
        match self {
            ListOp::App { value, after } => {
                map.insert("value".into(), value.clone());
                map.insert("after".into(), after.to_value());
            }
            ListOp::Pre { value, before } => {
                map.insert("value".into(), value.clone());
                map.insert("before".into(), before.to_value());
            }
            ListOp::Del { insertion } => {
                map.insert("insertion".into(), op_id_to_value(insertion));
            }
        }
        return Value::Object(map);
    }

    /// Parse one change. Unknown tags are an error the caller must treat as
    /// fatal for the document.
    pub fn from_value(change: &Value) -> Result<ListOp, ListError> {
        let obj = change
            .as_object()
            .ok_or_else(|| ListError::Malformed(format!("change is not an object: {change}")))?;
        let tag = match obj.get("op") {
            Some(Value::String(tag)) => tag.as_str(),
            Some(other) => return Err(ListError::UnknownOp(other.to_string())),
            None => return Err(ListError::UnknownOp(String::new())),
        };
        return match tag {
            "app" => Ok(ListOp::App {
                value: field(obj, "value")?.clone(),
                after: After::from_value(field(obj, "after")?)?,
            }),
            "pre" => Ok(ListOp::Pre {
                value: field(obj, "value")?.clone(),
                before: Before::from_value(field(obj, "before")?)?,
            }),
            "del" => Ok(ListOp::Del {
                insertion: op_id_from_value(field(obj, "insertion")?)?,
            }),
            other => Err(ListError::UnknownOp(other.to_string())),
        };
    }
}
