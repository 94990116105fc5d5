//! A local node: the documents this process holds and the peers it syncs
//! them with.
//!
//! The node never touches a socket. Incoming messages are handed to
//! [`LocalNode::receive`]; outgoing ones pile up in an outbox that the
//! transport drains with [`LocalNode::drain_outbox`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::header::DocId;
use crate::header::Header;
use crate::list::CoList;
use crate::list::ListError;
use crate::log::DocLog;
use crate::log::Session;
use crate::log::TxError;
use crate::permissions::Permissions;
use crate::sync::Content;
use crate::sync::KnownState;
use crate::sync::PeerId;
use crate::sync::PeerRole;
use crate::sync::PeerState;
use crate::sync::SyncMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Never asked for.
    Unknown,
    /// Asked peers, waiting for an answer.
    Loading,
    Available,
    /// No peer had it. Not retried by the node.
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    List(#[from] ListError),
}

struct DocEntry {
    list: Option<CoList>,
    state: LoadState,
    waiting_on: BTreeSet<PeerId>,
}

impl DocEntry {
    fn new() -> DocEntry {
        return DocEntry {
            list: None,
            state: LoadState::Unknown,
            waiting_on: BTreeSet::new(),
        };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reply {
    /// Acknowledge applied content.
    Ack,
    /// Only speak up on a gap.
    Quiet,
}

pub struct LocalNode {
    session: Session,
    permissions: Arc<dyn Permissions>,
    config: Config,
    docs: FxHashMap<DocId, DocEntry>,
    peers: BTreeMap<PeerId, PeerState>,
    outbox: Vec<(PeerId, SyncMessage)>,
}

impl LocalNode {
    pub fn new(session: Session, permissions: Arc<dyn Permissions>, config: Config) -> LocalNode {
        return LocalNode {
            session,
            permissions,
            config,
            docs: FxHashMap::default(),
            peers: BTreeMap::new(),
            outbox: Vec::new(),
        };
    }

    pub fn session(&self) -> &Session {
        return &self.session;
    }

    // ====================================================================
    // Peers
    // ====================================================================

    /// Connect a peer. Server peers are sent every document right away.
    pub fn add_peer(&mut self, id: impl Into<PeerId>, role: PeerRole) {
        let id = id.into();
        tracing::debug!(peer = %id, ?role, "peer added");
        self.peers.insert(id.clone(), PeerState::new(id.clone(), role));
        if role == PeerRole::Server {
            let docs: Vec<DocId> = self.available().collect();
            for doc in docs {
                self.push_to(&id, &doc);
            }
        }
    }

    /// Disconnect a peer. Messages not yet drained for it are dropped.
    pub fn remove_peer(&mut self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        self.outbox.retain(|(to, _)| to != id);
        let docs: Vec<DocId> = self.docs.keys().copied().collect();
        for doc in docs {
            self.stop_waiting(&doc, id);
        }
        return removed;
    }

    pub fn peer(&self, id: &str) -> Option<&PeerState> {
        return self.peers.get(id);
    }

    fn peer_mut(&mut self, id: &str) -> Result<&mut PeerState, SyncError> {
        return self.peers.get_mut(id).ok_or_else(|| SyncError::UnknownPeer(id.to_string()));
    }

    // ====================================================================
    // Documents
    // ====================================================================

    fn available(&self) -> impl Iterator<Item = DocId> + '_ {
        return self.docs.iter().filter(|(_, e)| e.list.is_some()).map(|(id, _)| *id);
    }

    pub fn list(&self, id: &DocId) -> Option<&CoList> {
        return self.docs.get(id)?.list.as_ref();
    }

    /// Mutable access for local edits. Call
    /// [`sync_local_changes`](LocalNode::sync_local_changes) after editing.
    pub fn list_mut(&mut self, id: &DocId) -> Option<&mut CoList> {
        return self.docs.get_mut(id)?.list.as_mut();
    }

    pub fn load_state(&self, id: &DocId) -> LoadState {
        return self.docs.get(id).map(|e| e.state).unwrap_or(LoadState::Unknown);
    }

    pub fn known_state(&self, id: &DocId) -> Option<KnownState> {
        return self.list(id).map(|l| l.log().known_state());
    }

    /// Create a new document held by this node and offer it to peers.
    pub fn create_list(&mut self, header: Header) -> Result<DocId, SyncError> {
        let log = DocLog::new(header, self.permissions.clone(), self.config.clone());
        let id = *log.id();
        let list = CoList::new(log, self.session.clone())?;
        self.docs.insert(
            id,
            DocEntry {
                list: Some(list),
                state: LoadState::Available,
                waiting_on: BTreeSet::new(),
            },
        );
        self.sync_local_changes(&id);
        return Ok(id);
    }

    /// Ask every peer for a document. Subscribes to its future changes.
    pub fn load(&mut self, id: DocId) -> LoadState {
        let entry = self.docs.entry(id).or_insert_with(DocEntry::new);
        if entry.state != LoadState::Unknown {
            return entry.state;
        }
        entry.waiting_on = self.peers.keys().cloned().collect();
        if entry.waiting_on.is_empty() {
            entry.state = LoadState::Unavailable;
            tracing::info!(doc = %id, "document unavailable: no peers");
            return entry.state;
        }
        entry.state = LoadState::Loading;
        for peer in &entry.waiting_on {
            self.outbox.push((peer.clone(), SyncMessage::Load(KnownState::empty(id))));
        }
        tracing::debug!(doc = %id, peers = entry.waiting_on.len(), "loading");
        return LoadState::Loading;
    }

    /// Ask one peer for a one-off copy of a document, without subscribing.
    pub fn pull(&mut self, id: DocId, peer: &str) -> Result<(), SyncError> {
        self.peer_mut(peer)?;
        let known = self.known_state(&id).unwrap_or_else(|| KnownState::empty(id));
        let entry = self.docs.entry(id).or_insert_with(DocEntry::new);
        if entry.list.is_none() && entry.state != LoadState::Unavailable {
            entry.state = LoadState::Loading;
            entry.waiting_on.insert(peer.to_string());
        }
        self.outbox.push((peer.to_string(), SyncMessage::Pull(known)));
        return Ok(());
    }

    fn stop_waiting(&mut self, id: &DocId, peer: &str) {
        let Some(entry) = self.docs.get_mut(id) else {
            return;
        };
        if entry.state != LoadState::Loading || !entry.waiting_on.remove(peer) {
            return;
        }
        if entry.waiting_on.is_empty() {
            entry.state = LoadState::Unavailable;
            tracing::info!(doc = %id, "document unavailable from every peer");
        }
    }

    /// Send each interested peer whatever it is missing of `id`.
    pub fn sync_local_changes(&mut self, id: &DocId) {
        let targets: Vec<PeerId> = self.peers.values().filter(|p| p.wants(id)).map(|p| p.id().clone()).collect();
        for peer in targets {
            self.push_to(&peer, id);
        }
    }

    fn push_to(&mut self, to: &str, id: &DocId) {
        let Some(list) = self.docs.get(id).and_then(|e| e.list.as_ref()) else {
            return;
        };
        let Some(peer) = self.peers.get_mut(to) else {
            return;
        };
        if peer.is_errored(id) {
            return;
        }
        if let Some(content) = list.log().new_content_since(peer.optimistic(id)) {
            peer.combine_optimistic(&content.known_state());
            tracing::trace!(peer = to, doc = %id, transactions = content.transaction_count(), "pushing content");
            self.outbox.push((to.to_string(), SyncMessage::Content(content)));
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<(PeerId, SyncMessage)> {
        return std::mem::take(&mut self.outbox);
    }

    // ====================================================================
    // Incoming
    // ====================================================================

    pub fn receive(&mut self, from: &str, message: SyncMessage) -> Result<(), SyncError> {
        self.peer_mut(from)?;
        tracing::trace!(peer = from, doc = %message.id(), action = message.action(), "received");
        return match message {
            SyncMessage::Load(known) => self.handle_load(from, known),
            SyncMessage::Known { known, is_correction } => self.handle_known(from, known, is_correction),
            SyncMessage::Pull(known) => self.handle_pull(from, known),
            SyncMessage::Content(content) => self.handle_content(from, content, Reply::Ack),
            SyncMessage::Data { content, known: true } => self.handle_content(from, content, Reply::Quiet),
            SyncMessage::Data { content, known: false } => {
                self.stop_waiting(&content.id, from);
                Ok(())
            }
            SyncMessage::Ack(known) => {
                self.peer_mut(from)?.combine_known(&known);
                Ok(())
            }
        };
    }

    fn handle_load(&mut self, from: &str, known: KnownState) -> Result<(), SyncError> {
        let id = known.id;
        self.peer_mut(from)?.set_known(&known);
        let ours = self.known_state(&id).unwrap_or_else(|| KnownState::empty(id));
        self.outbox.push((
            from.to_string(),
            SyncMessage::Known {
                known: ours,
                is_correction: false,
            },
        ));
        self.push_to(from, &id);
        return Ok(());
    }

    fn handle_known(&mut self, from: &str, known: KnownState, is_correction: bool) -> Result<(), SyncError> {
        let id = known.id;
        let peer = self.peer_mut(from)?;
        if is_correction {
            peer.set_known(&known);
        } else {
            peer.combine_known(&known);
        }
        if self.list(&id).is_none() {
            // Content follows a positive answer; a negative one rules this peer out.
            if !known.header {
                self.stop_waiting(&id, from);
            }
            return Ok(());
        }
        self.push_to(from, &id);
        return Ok(());
    }

    fn handle_pull(&mut self, from: &str, known: KnownState) -> Result<(), SyncError> {
        let id = known.id;
        let reply = match self.list(&id) {
            Some(list) => SyncMessage::Data {
                content: list
                    .log()
                    .new_content_since(Some(&known))
                    .unwrap_or_else(|| Content::empty(id)),
                known: true,
            },
            None => SyncMessage::Data {
                content: Content::empty(id),
                known: false,
            },
        };
        self.outbox.push((from.to_string(), reply));
        return Ok(());
    }

    fn handle_content(&mut self, from: &str, content: Content, reply: Reply) -> Result<(), SyncError> {
        let id = content.id;
        let peer = self.peer_mut(from)?;
        if peer.is_errored(&id) {
            tracing::trace!(peer = from, doc = %id, "ignoring content from errored peer");
            return Ok(());
        }
        // Sending content implies interest. What it holds is credited below,
        // once the content has been applied.
        peer.combine_known(&KnownState::empty(id));

        let entry = self.docs.entry(id).or_insert_with(DocEntry::new);
        if entry.list.is_none() {
            let Some(header) = content.header.clone() else {
                // Nothing can be applied without the header.
                self.outbox.push((
                    from.to_string(),
                    SyncMessage::Known {
                        known: KnownState::empty(id),
                        is_correction: true,
                    },
                ));
                return Ok(());
            };
            match DocLog::from_header(id, header, self.permissions.clone(), self.config.clone()) {
                Ok(log) => {
                    entry.list = Some(CoList::new(log, self.session.clone())?);
                    entry.state = LoadState::Available;
                    entry.waiting_on.clear();
                    tracing::debug!(peer = from, doc = %id, "document available");
                }
                Err(err) => {
                    tracing::warn!(peer = from, doc = %id, %err, "rejected header");
                    self.peer_mut(from)?.mark_errored(id);
                    return Ok(());
                }
            }
        }
        let Some(list) = entry.list.as_mut() else {
            return Ok(());
        };

        let mut added = 0;
        let mut gap = false;
        let mut rejected = false;
        let mut credited = KnownState::empty(id);
        credited.header = content.header.is_some();
        for (key, session) in &content.new {
            match list
                .log_mut()
                .try_add_transactions(key, session.after, &session.transactions, &session.last_signature)
            {
                Ok(n) => {
                    added += n;
                    credited.update(*key, session.after + session.transactions.len());
                }
                Err(TxError::Gap { have, after, .. }) => {
                    tracing::debug!(peer = from, doc = %id, session = %key, have, after, "gap in content");
                    gap = true;
                }
                Err(err) => {
                    tracing::warn!(peer = from, doc = %id, session = %key, %err, "rejected content");
                    rejected = true;
                }
            }
        }
        if added > 0 {
            list.process_new_transactions()?;
        }
        let ours = list.log().known_state();

        self.peer_mut(from)?.combine_known(&credited);
        if rejected {
            self.peer_mut(from)?.mark_errored(id);
        }
        if gap {
            self.outbox.push((
                from.to_string(),
                SyncMessage::Known {
                    known: ours,
                    is_correction: true,
                },
            ));
        } else if reply == Reply::Ack && !rejected {
            self.outbox.push((from.to_string(), SyncMessage::Ack(ours)));
        }
        if added > 0 {
            self.sync_local_changes(&id);
        }
        return Ok(());
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("LocalNode")
            .field("session", &self.session.key())
            .field("docs", &self.docs.len())
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("outbox", &self.outbox.len())
            .finish();
    }
}
