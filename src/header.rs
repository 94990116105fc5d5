//! Document headers and the ids derived from them.

use std::fmt;
use std::str::FromStr;

use rand_core::OsRng;
use rand_core::RngCore;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;

use crate::key::Hash;
use crate::key::hex;
use crate::key::unhex_array;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocKind {
    #[serde(rename = "colist")]
    List,
    #[serde(rename = "coplaintext")]
    PlainText,
}

/// Immutable facts about a document, fixed at creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub kind: DocKind,
    #[serde(default)]
    pub meta: Option<Value>,
    pub uniqueness: String,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// A document id: `co_z` followed by the hex hash of the header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(pub Hash);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid document id: {0}")]
pub struct ParseDocIdError(pub String);

impl Header {
    /// A header for a new document of the given kind, unique by construction.
    pub fn new(kind: DocKind) -> Header {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        return Header {
            kind,
            meta: None,
            uniqueness: hex(&nonce),
            created_at: None,
        };
    }

    pub fn list() -> Header {
        return Header::new(DocKind::List);
    }

    pub fn plain_text() -> Header {
        return Header::new(DocKind::PlainText);
    }

    pub fn with_meta(mut self, meta: Value) -> Header {
        self.meta = Some(meta);
        return self;
    }

    pub fn with_uniqueness(mut self, uniqueness: impl Into<String>) -> Header {
        self.uniqueness = uniqueness.into();
        return self;
    }

    /// Derive the document id. Every field contributes.
    pub fn id(&self) -> DocId {
        let mut hasher = blake3::Hasher::new();
        let kind: &[u8] = match self.kind {
            DocKind::List => b"colist",
            DocKind::PlainText => b"coplaintext",
        };
        hasher.update(&(kind.len() as u64).to_le_bytes());
        hasher.update(kind);
        hasher.update(&(self.uniqueness.len() as u64).to_le_bytes());
        hasher.update(self.uniqueness.as_bytes());
        match self.created_at {
            Some(t) => {
                hasher.update(&[1]);
                hasher.update(&t.to_le_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        // Object keys serialize sorted, so the text is canonical.
        let meta = self.meta.as_ref().map(|m| m.to_string()).unwrap_or_default();
        hasher.update(&(meta.len() as u64).to_le_bytes());
        hasher.update(meta.as_bytes());
        return DocId(Hash(*hasher.finalize().as_bytes()));
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "co_z{}", hex(&self.0.0));
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "DocId(co_z{})", hex(&self.0.0[..8]));
    }
}

impl FromStr for DocId {
    type Err = ParseDocIdError;

    fn from_str(text: &str) -> Result<DocId, ParseDocIdError> {
        let bytes = text
            .strip_prefix("co_z")
            .and_then(unhex_array::<32>)
            .ok_or_else(|| ParseDocIdError(text.to_string()))?;
        return Ok(DocId(Hash(bytes)));
    }
}

impl Serialize for DocId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        return s.collect_str(self);
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<DocId, D::Error> {
        let text = String::deserialize(d)?;
        return text.parse().map_err(serde::de::Error::custom);
    }
}
