use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::header::DocId;
use crate::header::Header;
use crate::id::SessionKey;
use crate::key::Signature;
use crate::log::Transaction;
use crate::sync::KnownState;

/// Relative urgency of content. Lower is more urgent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGH: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(3);
    pub const LOW: Priority = Priority(6);
}

/// New transactions of one session, starting after `after`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContent {
    pub after: usize,
    #[serde(rename = "newTransactions")]
    pub transactions: Vec<Transaction>,
    #[serde(rename = "lastSignature")]
    pub last_signature: Signature,
}

/// A bundle of transactions for one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub id: DocId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
    pub priority: Priority,
    pub new: BTreeMap<SessionKey, SessionContent>,
}

impl Content {
    /// Content carrying nothing.
    pub fn empty(id: DocId) -> Content {
        return Content {
            id,
            header: None,
            priority: Priority::MEDIUM,
            new: BTreeMap::new(),
        };
    }

    pub fn is_empty(&self) -> bool {
        return self.header.is_none() && self.new.is_empty();
    }

    /// What the sender of this content must hold.
    pub fn known_state(&self) -> KnownState {
        let mut known = KnownState::empty(self.id);
        known.header = self.header.is_some();
        for (key, session) in &self.new {
            known.update(*key, session.after + session.transactions.len());
        }
        return known;
    }

    pub fn transaction_count(&self) -> usize {
        return self.new.values().map(|s| s.transactions.len()).sum();
    }
}

/// A message between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// Open a subscription: here is what I have, send what I lack.
    Load(KnownState),
    /// A statement of what the sender holds. A correction means the
    /// receiver's picture of the sender was wrong and must be replaced.
    Known {
        #[serde(flatten)]
        known: KnownState,
        #[serde(rename = "isCorrection", default, skip_serializing_if = "is_false")]
        is_correction: bool,
    },
    /// Ask for everything missing from the given state, once, without
    /// subscribing.
    Pull(KnownState),
    /// Pushed content. Accepted under its old name `push` too.
    #[serde(alias = "push")]
    Content(Content),
    /// Reply to a pull. `known` is false when the sender lacks the document.
    Data {
        #[serde(flatten)]
        content: Content,
        known: bool,
    },
    /// Acknowledges applied content with the receiver's new state.
    Ack(KnownState),
}

fn is_false(value: &bool) -> bool {
    return !*value;
}

impl SyncMessage {
    /// The document this message is about.
    pub fn id(&self) -> &DocId {
        return match self {
            SyncMessage::Load(known) => &known.id,
            SyncMessage::Known { known, .. } => &known.id,
            SyncMessage::Pull(known) => &known.id,
            SyncMessage::Content(content) => &content.id,
            SyncMessage::Data { content, .. } => &content.id,
            SyncMessage::Ack(known) => &known.id,
        };
    }

    /// The wire tag, for logging.
    pub fn action(&self) -> &'static str {
        return match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Pull(_) => "pull",
            SyncMessage::Content(_) => "content",
            SyncMessage::Data { .. } => "data",
            SyncMessage::Ack(_) => "ack",
        };
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        return serde_json::to_string(self);
    }

    pub fn from_json(text: &str) -> Result<SyncMessage, serde_json::Error> {
        return serde_json::from_str(text);
    }
}
