use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::header::DocId;
use crate::sync::KnownState;

pub type PeerId = String;

/// How eagerly documents are shared with a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// Receives every document this node holds, subscribed or not.
    Server,
    /// Receives only documents it loaded.
    Client,
}

/// What this node believes one peer holds.
///
/// `confirmed` only moves on statements from the peer itself. `optimistic`
/// also moves when we send content, so we don't resend it before the peer
/// has had a chance to answer.
#[derive(Clone, Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    confirmed: FxHashMap<DocId, KnownState>,
    optimistic: FxHashMap<DocId, KnownState>,
    errored: FxHashSet<DocId>,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole) -> PeerState {
        return PeerState {
            id,
            role,
            confirmed: FxHashMap::default(),
            optimistic: FxHashMap::default(),
            errored: FxHashSet::default(),
        };
    }

    pub fn id(&self) -> &PeerId {
        return &self.id;
    }

    pub fn role(&self) -> PeerRole {
        return self.role;
    }

    pub fn confirmed(&self, doc: &DocId) -> Option<&KnownState> {
        return self.confirmed.get(doc);
    }

    pub fn optimistic(&self, doc: &DocId) -> Option<&KnownState> {
        return self.optimistic.get(doc);
    }

    /// Whether `doc` should be pushed to this peer.
    pub fn wants(&self, doc: &DocId) -> bool {
        if self.errored.contains(doc) {
            return false;
        }
        return self.role == PeerRole::Server || self.optimistic.contains_key(doc);
    }

    /// Replace our picture of the peer with what it just told us.
    pub fn set_known(&mut self, known: &KnownState) {
        self.confirmed.insert(known.id, known.clone());
        self.optimistic.insert(known.id, known.clone());
    }

    /// Merge a statement from the peer into both pictures.
    pub fn combine_known(&mut self, known: &KnownState) {
        self.confirmed
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine(known);
        self.combine_optimistic(known);
    }

    /// Record content we sent, before the peer confirms it.
    pub fn combine_optimistic(&mut self, known: &KnownState) {
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine(known);
    }

    /// Stop syncing `doc` with this peer after it sent something invalid.
    pub fn mark_errored(&mut self, doc: DocId) {
        self.errored.insert(doc);
    }

    pub fn is_errored(&self, doc: &DocId) -> bool {
        return self.errored.contains(doc);
    }
}
