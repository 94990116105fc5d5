//! Per-document causal transaction logs.
//!
//! A document is a set of session logs, one per writer session (and per
//! branch scope). Each session log is append-only and signed: transaction
//! hashes are arranged into a 16-ary merkle tree and the roots are signed
//! along with the log length, so a peer can verify an extension without
//! the secret key.
//!
//! Validity is decided lazily. Signatures and sizes are checked when
//! transactions arrive; write permissions and read keys are checked when a
//! consumer asks for [`DocLog::valid_transactions_since`], because they
//! can change after the fact.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::clock::ClockMode;
use crate::clock::SessionClock;
use crate::config::Config;
use crate::header::DocId;
use crate::header::Header;
use crate::id::BranchId;
use crate::id::SessionId;
use crate::id::SessionKey;
use crate::id::TxId;
use crate::key::CryptoError;
use crate::key::Hash;
use crate::key::KeyId;
use crate::key::KeyPair;
use crate::key::KeyPub;
use crate::key::Sealed;
use crate::key::Signature;
use crate::permissions::Permissions;
use crate::sync::Content;
use crate::sync::KnownState;
use crate::sync::Priority;
use crate::sync::SessionContent;

/// Type constant for leaf node hashes (transaction hashes).
pub const TYPE_LEAF: u8 = 0x00;

/// Type constant for parent node hashes (internal tree nodes).
pub const TYPE_PARENT: u8 = 0x01;

/// Type constant for the signed root message.
pub const TYPE_ROOT: u8 = 0x02;

/// The branching factor of the tree.
pub const BRANCHING: usize = 16;

/// The latest `made_at` a transaction may carry. Leaves room for clocks to
/// keep ticking past anything a replica accepts.
pub const MAX_MADE_AT: u64 = i64::MAX as u64;

/// Hash transaction bytes to produce a leaf hash with domain separation.
pub fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TYPE_LEAF]);
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    return Hash(*hasher.finalize().as_bytes());
}

/// Hash a set of child hashes to produce a parent hash with domain separation.
pub fn hash_parent(children: &[Hash]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TYPE_PARENT]);
    hasher.update(&(children.len() as u64).to_le_bytes());
    for child in children {
        hasher.update(&child.0);
    }
    return Hash(*hasher.finalize().as_bytes());
}

/// Collapse leaves into the roots of the 16-tree. Full groups fold into a
/// parent; a trailing partial group stays as separate roots.
pub fn compute_roots(leaves: &[Hash]) -> Vec<Hash> {
    let mut current = leaves.to_vec();
    while current.len() >= BRANCHING {
        let mut next = Vec::with_capacity(current.len() / BRANCHING + BRANCHING);
        for group in current.chunks(BRANCHING) {
            if group.len() == BRANCHING {
                next.push(hash_parent(group));
            } else {
                next.extend_from_slice(group);
            }
        }
        current = next;
    }
    return current;
}

/// The message a session signs: document, session, roots and length.
fn signable(doc: &DocId, key: &SessionKey, roots: &[Hash], length: u64) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[TYPE_ROOT]);
    hasher.update(&doc.0.0);
    hasher.update(key.to_string().as_bytes());
    hasher.update(&length.to_le_bytes());
    hasher.update(&(roots.len() as u64).to_le_bytes());
    for root in roots {
        hasher.update(&root.0);
    }
    return hasher.finalize().as_bytes().to_vec();
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("gap in session {key}: have {have} transactions, batch starts after {after}")]
    Gap { key: SessionKey, have: usize, after: usize },
    #[error("invalid signature for session {0}")]
    BadSignature(SessionKey),
    #[error("transaction stamped at {made_at} is beyond the latest allowed time")]
    BadTimestamp { made_at: u64 },
    #[error("session {0} has conflicting history")]
    Fork(SessionKey),
    #[error("agent {0:?} may not write")]
    PermissionDenied(KeyPub),
    #[error("no read key available to seal a private transaction")]
    NoReadKey,
    #[error("header does not hash to document id {0}")]
    IdMismatch(DocId),
    #[error("malformed transaction payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privacy {
    Private,
    Trusting,
}

/// The payload of a transaction: plain JSON text, or sealed JSON text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum TxBody {
    Trusting {
        changes: String,
    },
    Private {
        #[serde(rename = "keyUsed")]
        key_used: KeyId,
        sealed: Sealed,
    },
}

/// An atomic batch of changes from one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "madeAt")]
    pub made_at: u64,
    #[serde(flatten)]
    pub body: TxBody,
}

/// What a transaction decodes to under the current permissions.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Changes(Vec<Value>),
    /// Private, and this replica lacks the key. May become valid later.
    MissingKey(KeyId),
    Invalid(String),
}

impl Transaction {
    pub fn trusting(made_at: u64, changes: &[Value]) -> Result<Transaction, TxError> {
        let changes = serde_json::to_string(changes)?;
        return Ok(Transaction {
            made_at,
            body: TxBody::Trusting { changes },
        });
    }

    pub fn private(made_at: u64, changes: &[Value], key_used: KeyId, key: &crate::key::ReadKey) -> Result<Transaction, TxError> {
        let plain = serde_json::to_vec(changes)?;
        let sealed = key.seal(&plain)?;
        return Ok(Transaction {
            made_at,
            body: TxBody::Private { key_used, sealed },
        });
    }

    pub fn privacy(&self) -> Privacy {
        return match self.body {
            TxBody::Trusting { .. } => Privacy::Trusting,
            TxBody::Private { .. } => Privacy::Private,
        };
    }

    /// Size of the payload in bytes, as counted against the limit.
    pub fn payload_len(&self) -> usize {
        return match &self.body {
            TxBody::Trusting { changes } => changes.len(),
            TxBody::Private { sealed, .. } => sealed.ciphertext.len(),
        };
    }

    /// Canonical bytes hashed into the session's merkle tree.
    fn canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len() + 64);
        out.extend_from_slice(&self.made_at.to_le_bytes());
        match &self.body {
            TxBody::Trusting { changes } => {
                out.push(0);
                out.extend_from_slice(changes.as_bytes());
            }
            TxBody::Private { key_used, sealed } => {
                out.push(1);
                out.extend_from_slice(&key_used.0);
                out.extend_from_slice(&sealed.nonce);
                out.extend_from_slice(&sealed.ciphertext);
            }
        }
        return out;
    }

    pub fn hash(&self) -> Hash {
        return hash_leaf(&self.canonical());
    }

    pub fn decode(&self, permissions: &dyn Permissions) -> Decoded {
        let bytes = match &self.body {
            TxBody::Trusting { changes } => changes.as_bytes().to_vec(),
            TxBody::Private { key_used, sealed } => {
                let Some(key) = permissions.read_key(key_used) else {
                    return Decoded::MissingKey(*key_used);
                };
                match key.open(sealed) {
                    Ok(plain) => plain,
                    Err(e) => return Decoded::Invalid(e.to_string()),
                }
            }
        };
        return match serde_json::from_slice::<Vec<Value>>(&bytes) {
            Ok(changes) => Decoded::Changes(changes),
            Err(e) => Decoded::Invalid(e.to_string()),
        };
    }
}

/// A writer: a signing keypair, a session identity and its clock.
#[derive(Clone, Debug)]
pub struct Session {
    key: SessionKey,
    keys: KeyPair,
    clock: SessionClock,
}

impl Session {
    /// A new session for `keys`, with a fresh random nonce.
    pub fn new(keys: KeyPair, mode: ClockMode) -> Session {
        let session = SessionId::new(keys.key_pub);
        return Session {
            key: SessionKey::main(session),
            keys,
            clock: SessionClock::new(mode),
        };
    }

    /// Resume a known session id.
    pub fn resume(keys: KeyPair, nonce: u64, mode: ClockMode) -> Session {
        let session = SessionId::with_nonce(keys.key_pub, nonce);
        return Session {
            key: SessionKey::main(session),
            keys,
            clock: SessionClock::new(mode),
        };
    }

    /// The same session writing into a branch-scoped log.
    pub fn on_branch(&self, branch: BranchId) -> Session {
        let mut session = self.clone();
        session.key = SessionKey::on_branch(self.key.session, branch);
        return session;
    }

    pub fn key(&self) -> SessionKey {
        return self.key;
    }

    pub fn agent(&self) -> KeyPub {
        return self.keys.key_pub;
    }

    pub fn clock(&self) -> &SessionClock {
        return &self.clock;
    }
}

/// The append-only log of one session.
#[derive(Clone, Debug, Default)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    leaves: Vec<Hash>,
    last_signature: Option<Signature>,
}

impl SessionLog {
    pub fn len(&self) -> usize {
        return self.transactions.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.transactions.is_empty();
    }

    pub fn transactions(&self) -> &[Transaction] {
        return &self.transactions;
    }

    pub fn get(&self, index: usize) -> Option<&Transaction> {
        return self.transactions.get(index);
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        return self.last_signature.as_ref();
    }

    pub fn roots(&self) -> Vec<Hash> {
        return compute_roots(&self.leaves);
    }
}

/// A transaction that passed validation, with its changes decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidTransaction {
    pub id: TxId,
    pub made_at: u64,
    pub changes: Vec<Value>,
}

/// The result of [`DocLog::valid_transactions_since`].
#[derive(Clone, Debug, Default)]
pub struct NewTransactions {
    /// Sorted by `(made_at, session key, tx index)`.
    pub transactions: Vec<ValidTransaction>,
    /// Permissions changed since the cursor last read; earlier answers
    /// may be stale and the consumer should start over.
    pub revalidated: bool,
}

/// How far a consumer has read into a document's logs.
#[derive(Clone, Debug, Default)]
pub struct Cursor {
    frontier: FxHashMap<SessionKey, usize>,
    deferred: Vec<(TxId, u64)>,
    epoch: Option<u64>,
}

impl Cursor {
    /// Private transactions waiting for a read key.
    pub fn deferred(&self) -> usize {
        return self.deferred.len();
    }
}

/// All session logs of one document.
pub struct DocLog {
    id: DocId,
    header: Header,
    sessions: BTreeMap<SessionKey, SessionLog>,
    permissions: Arc<dyn Permissions>,
    config: Config,
    newest_made_at: u64,
}

impl DocLog {
    pub fn new(header: Header, permissions: Arc<dyn Permissions>, config: Config) -> DocLog {
        return DocLog {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
            permissions,
            config,
            newest_made_at: 0,
        };
    }

    /// Open a log for a header received from a peer, checking it matches
    /// the id it arrived under.
    pub fn from_header(id: DocId, header: Header, permissions: Arc<dyn Permissions>, config: Config) -> Result<DocLog, TxError> {
        if header.id() != id {
            return Err(TxError::IdMismatch(id));
        }
        return Ok(DocLog::new(header, permissions, config));
    }

    pub fn id(&self) -> &DocId {
        return &self.id;
    }

    pub fn header(&self) -> &Header {
        return &self.header;
    }

    pub fn config(&self) -> &Config {
        return &self.config;
    }

    pub fn permissions(&self) -> &Arc<dyn Permissions> {
        return &self.permissions;
    }

    pub fn session(&self, key: &SessionKey) -> Option<&SessionLog> {
        return self.sessions.get(key);
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionKey, &SessionLog)> {
        return self.sessions.iter();
    }

    pub fn transaction(&self, id: &TxId) -> Option<&Transaction> {
        return self.sessions.get(&id.key)?.get(id.tx_index as usize);
    }

    /// Total transactions across all sessions, valid or not.
    pub fn transaction_count(&self) -> usize {
        return self.sessions.values().map(|s| s.len()).sum();
    }

    /// Newest `made_at` of any stored transaction.
    pub fn newest_made_at(&self) -> u64 {
        return self.newest_made_at;
    }

    fn check_size(&self, tx: &Transaction) -> Result<(), TxError> {
        let size = tx.payload_len();
        if size > self.config.max_tx_size {
            return Err(TxError::TooLarge {
                size,
                limit: self.config.max_tx_size,
            });
        }
        return Ok(());
    }

    /// Append a locally authored transaction to `session`'s log and sign it.
    pub fn make_transaction(&mut self, session: &mut Session, changes: &[Value], privacy: Privacy) -> Result<TxId, TxError> {
        session.clock.observe(self.newest_made_at);
        let made_at = session.clock.tick();
        if made_at > MAX_MADE_AT {
            return Err(TxError::BadTimestamp { made_at });
        }
        if !self.permissions.can_write(&session.agent(), made_at) {
            return Err(TxError::PermissionDenied(session.agent()));
        }
        let tx = match privacy {
            Privacy::Trusting => Transaction::trusting(made_at, changes)?,
            Privacy::Private => {
                let (key_id, key) = self.permissions.current_read_key().ok_or(TxError::NoReadKey)?;
                Transaction::private(made_at, changes, key_id, &key)?
            }
        };
        self.check_size(&tx)?;

        let doc = self.id;
        let key = session.key();
        let log = self.sessions.entry(key).or_default();
        log.leaves.push(tx.hash());
        log.transactions.push(tx);
        let roots = compute_roots(&log.leaves);
        let signature = session.keys.sign(&signable(&doc, &key, &roots, log.len() as u64));
        log.last_signature = Some(signature);
        self.newest_made_at = self.newest_made_at.max(made_at);

        let tx_index = (log.len() - 1) as u32;
        tracing::trace!(doc = %doc, session = %key, tx_index, made_at, "made transaction");
        return Ok(TxId { key, tx_index });
    }

    /// Extend a session's log with transactions received from elsewhere.
    ///
    /// `after` is how many transactions of this session the sender assumed we
    /// have. Overlap with what we already hold is skipped. Returns how many
    /// transactions were actually added.
    pub fn try_add_transactions(
        &mut self,
        key: &SessionKey,
        after: usize,
        transactions: &[Transaction],
        signature: &Signature,
    ) -> Result<usize, TxError> {
        let have = self.sessions.get(key).map(|s| s.len()).unwrap_or(0);
        if after > have {
            return Err(TxError::Gap { key: *key, have, after });
        }
        for tx in transactions {
            self.check_size(tx)?;
            if tx.made_at > MAX_MADE_AT {
                return Err(TxError::BadTimestamp { made_at: tx.made_at });
            }
        }

        let hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash()).collect();
        let existing = self.sessions.get(key);
        let mut leaves: Vec<Hash> = existing.map(|s| s.leaves[..after].to_vec()).unwrap_or_default();
        leaves.extend_from_slice(&hashes);
        let roots = compute_roots(&leaves);
        let message = signable(&self.id, key, &roots, leaves.len() as u64);
        if !key.agent().verify(&message, signature) {
            return Err(TxError::BadSignature(*key));
        }

        // The overlap must agree with what we already hold.
        if let Some(existing) = existing {
            let overlap = (have - after).min(hashes.len());
            if existing.leaves[after..after + overlap] != hashes[..overlap] {
                return Err(TxError::Fork(*key));
            }
        }

        let skip = have - after;
        if skip >= transactions.len() {
            return Ok(0);
        }
        let log = self.sessions.entry(*key).or_default();
        for (tx, hash) in transactions[skip..].iter().zip(&hashes[skip..]) {
            self.newest_made_at = self.newest_made_at.max(tx.made_at);
            log.transactions.push(tx.clone());
            log.leaves.push(*hash);
        }
        log.last_signature = Some(*signature);
        let added = transactions.len() - skip;
        tracing::trace!(doc = %self.id, session = %key, added, "added transactions");
        return Ok(added);
    }

    fn validate(&self, key: &SessionKey, tx: &Transaction) -> Decoded {
        if !self.permissions.can_write(key.agent(), tx.made_at) {
            return Decoded::Invalid(format!("{key} may not write at {}", tx.made_at));
        }
        return tx.decode(self.permissions.as_ref());
    }

    /// Every transaction that became valid since `cursor` last read, sorted
    /// by `(made_at, session key, tx index)`.
    ///
    /// Private transactions whose key is missing are remembered in the
    /// cursor and retried on later calls.
    pub fn valid_transactions_since(&self, cursor: &mut Cursor) -> NewTransactions {
        let epoch = self.permissions.epoch();
        let revalidated = cursor.epoch.is_some_and(|e| e != epoch);
        cursor.epoch = Some(epoch);

        let mut out = Vec::new();
        let mut accept = |id: TxId, tx: &Transaction, deferred: &mut Vec<(TxId, u64)>| match self.validate(&id.key, tx) {
            Decoded::Changes(changes) => out.push(ValidTransaction {
                id,
                made_at: tx.made_at,
                changes,
            }),
            Decoded::MissingKey(key_id) => {
                tracing::debug!(doc = %self.id, session = %id.key, tx = id.tx_index, ?key_id, "deferring private transaction");
                deferred.push((id, tx.made_at));
            }
            Decoded::Invalid(reason) => {
                tracing::debug!(doc = %self.id, session = %id.key, tx = id.tx_index, %reason, "skipping invalid transaction");
            }
        };

        let mut still_deferred = Vec::new();
        for (id, _) in std::mem::take(&mut cursor.deferred) {
            if let Some(tx) = self.transaction(&id) {
                accept(id, tx, &mut still_deferred);
            }
        }

        for (key, log) in &self.sessions {
            let start = cursor.frontier.get(key).copied().unwrap_or(0);
            for (i, tx) in log.transactions.iter().enumerate().skip(start) {
                let id = TxId {
                    key: *key,
                    tx_index: i as u32,
                };
                accept(id, tx, &mut still_deferred);
            }
            cursor.frontier.insert(*key, log.len());
        }
        cursor.deferred = still_deferred;

        out.sort_by(|a, b| (a.made_at, a.id).cmp(&(b.made_at, b.id)));
        return NewTransactions {
            transactions: out,
            revalidated,
        };
    }

    /// What this replica holds, as a known-state summary.
    pub fn known_state(&self) -> KnownState {
        let mut known = KnownState::empty(self.id);
        known.header = true;
        for (key, log) in &self.sessions {
            known.sessions.insert(*key, log.len());
        }
        return known;
    }

    /// Everything `known` is missing. `None` means nothing to send.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Content> {
        let header = match known {
            Some(k) if k.header => None,
            _ => Some(self.header.clone()),
        };
        let mut new = BTreeMap::new();
        for (key, log) in &self.sessions {
            let theirs = known.map(|k| k.get(key)).unwrap_or(0);
            if theirs >= log.len() {
                continue;
            }
            let Some(signature) = log.last_signature else {
                continue;
            };
            new.insert(
                *key,
                SessionContent {
                    after: theirs,
                    transactions: log.transactions[theirs..].to_vec(),
                    last_signature: signature,
                },
            );
        }
        if header.is_none() && new.is_empty() {
            return None;
        }
        return Some(Content {
            id: self.id,
            header,
            priority: Priority::MEDIUM,
            new,
        });
    }
}

impl std::fmt::Debug for DocLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("DocLog")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("transactions", &self.transaction_count())
            .finish();
    }
}
