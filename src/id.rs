//! Identifiers for sessions, branches, transactions and operations.

use std::fmt;
use std::str::FromStr;

use rand_core::OsRng;
use rand_core::RngCore;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::key::KeyPub;
use crate::key::hash;
use crate::key::hex;
use crate::key::unhex_array;

/// One writer on one device: an agent key plus a per-device nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SessionId {
    pub agent: KeyPub,
    pub nonce: u64,
}

/// A named branch. Derived from the branch name so replicas agree on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BranchId(pub u64);

/// The key a session log is stored under: a session, optionally scoped to a
/// branch. Two branch scopes of the same session are independent logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SessionKey {
    pub session: SessionId,
    pub branch: Option<BranchId>,
}

/// Addresses one transaction in a document.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TxId {
    pub key: SessionKey,
    pub tx_index: u32,
}

/// Addresses one change inside a transaction. This is the identity of a
/// list element or a deletion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub key: SessionKey,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
    #[serde(rename = "changeIdx")]
    pub change_idx: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session key: {0}")]
pub struct ParseIdError(pub String);

impl SessionId {
    /// A new session for an agent, with a random nonce.
    pub fn new(agent: KeyPub) -> SessionId {
        return SessionId {
            agent,
            nonce: OsRng.next_u64(),
        };
    }

    pub fn with_nonce(agent: KeyPub, nonce: u64) -> SessionId {
        return SessionId { agent, nonce };
    }
}

impl BranchId {
    pub fn named(name: &str) -> BranchId {
        let digest = hash(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.0[..8]);
        return BranchId(u64::from_le_bytes(bytes));
    }
}

impl SessionKey {
    /// The main-line key for a session.
    pub fn main(session: SessionId) -> SessionKey {
        return SessionKey { session, branch: None };
    }

    pub fn on_branch(session: SessionId, branch: BranchId) -> SessionKey {
        return SessionKey {
            session,
            branch: Some(branch),
        };
    }

    pub fn agent(&self) -> &KeyPub {
        return &self.session.agent;
    }
}

impl TxId {
    pub fn op(&self, change_idx: u32) -> OpId {
        return OpId {
            key: self.key,
            tx_index: self.tx_index,
            change_idx,
        };
    }
}

impl OpId {
    pub fn tx(&self) -> TxId {
        return TxId {
            key: self.key,
            tx_index: self.tx_index,
        };
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_{:016x}", hex(&self.session.agent.0), self.session.nonce)?;
        if let Some(branch) = self.branch {
            write!(f, "_branch_{:016x}", branch.0)?;
        }
        return Ok(());
    }
}

impl FromStr for SessionKey {
    type Err = ParseIdError;

    fn from_str(text: &str) -> Result<SessionKey, ParseIdError> {
        let bad = || ParseIdError(text.to_string());
        let (agent, rest) = text.split_once("_session_").ok_or_else(bad)?;
        let agent = unhex_array::<32>(agent).map(KeyPub).ok_or_else(bad)?;
        let (nonce, branch) = match rest.split_once("_branch_") {
            Some((nonce, branch)) => (nonce, Some(branch)),
            None => (rest, None),
        };
        let nonce = u64::from_str_radix(nonce, 16).map_err(|_| bad())?;
        let branch = match branch {
            Some(b) => Some(BranchId(u64::from_str_radix(b, 16).map_err(|_| bad())?)),
            None => None,
        };
        return Ok(SessionKey {
            session: SessionId { agent, nonce },
            branch,
        });
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        return s.collect_str(self);
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<SessionKey, D::Error> {
        let text = String::deserialize(d)?;
        return text.parse().map_err(serde::de::Error::custom);
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}#{}.{}", self.key, self.tx_index, self.change_idx);
    }
}
