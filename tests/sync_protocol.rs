//! Several nodes syncing documents through the message protocol.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use tandem::ClockMode;
use tandem::Config;
use tandem::DocId;
use tandem::Group;
use tandem::Header;
use tandem::LocalNode;
use tandem::Privacy;
use tandem::Session;
use tandem::SyncMessage;
use tandem::key::KeyPair;
use tandem::sync::LoadState;
use tandem::sync::PeerRole;

const T: Privacy = Privacy::Trusting;

// =============================================================================
// Test network
// =============================================================================

/// Nodes wired together in memory. Every message goes through JSON.
struct Network {
    group: Arc<Group>,
    nodes: BTreeMap<String, LocalNode>,
}

impl Network {
    fn new() -> Network {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        return Network {
            group: Arc::new(Group::allow_all()),
            nodes: BTreeMap::new(),
        };
    }

    fn add(&mut self, name: &str) {
        let config = Config {
            clock: ClockMode::Logical,
            ..Config::default()
        };
        let session = Session::new(KeyPair::generate(), ClockMode::Logical);
        self.nodes.insert(name.to_string(), LocalNode::new(session, self.group.clone(), config));
    }

    /// Connect two nodes; `server` sees `client` as a client and vice versa.
    fn connect(&mut self, client: &str, server: &str) {
        self.node(server).add_peer(client, PeerRole::Client);
        self.node(client).add_peer(server, PeerRole::Server);
    }

    /// Connect two equals that only share what they load.
    fn connect_peers(&mut self, a: &str, b: &str) {
        self.node(a).add_peer(b, PeerRole::Client);
        self.node(b).add_peer(a, PeerRole::Client);
    }

    fn node(&mut self, name: &str) -> &mut LocalNode {
        return self.nodes.get_mut(name).unwrap();
    }

    fn collect(&mut self) -> VecDeque<(String, String, SyncMessage)> {
        let mut queue = VecDeque::new();
        for (name, node) in self.nodes.iter_mut() {
            for (to, message) in node.drain_outbox() {
                queue.push_back((name.clone(), to, message));
            }
        }
        return queue;
    }

    /// Deliver messages until every outbox is empty.
    fn settle(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let queue = self.collect();
            if queue.is_empty() {
                return delivered;
            }
            for (from, to, message) in queue {
                let text = message.to_json().unwrap();
                let message = SyncMessage::from_json(&text).unwrap();
                self.node(&to).receive(&from, message).unwrap();
                delivered += 1;
            }
            assert!(delivered < 10_000, "sync did not settle");
        }
    }

    fn values(&mut self, name: &str, id: &DocId) -> Vec<serde_json::Value> {
        return self.node(name).list(id).unwrap().as_array().to_vec();
    }
}

// =============================================================================
// Loading and relaying
// =============================================================================

#[test]
fn edits_travel_through_a_server() {
    let mut net = Network::new();
    net.add("alice");
    net.add("bob");
    net.add("server");
    net.connect("alice", "server");
    net.connect("bob", "server");

    let id = net.node("alice").create_list(Header::list()).unwrap();
    net.settle();
    assert_eq!(net.node("server").load_state(&id), LoadState::Available);

    assert_eq!(net.node("bob").load(id), LoadState::Loading);
    net.settle();
    assert_eq!(net.node("bob").load_state(&id), LoadState::Available);

    net.node("alice").list_mut(&id).unwrap().append(json!("from alice"), None, T).unwrap();
    net.node("alice").sync_local_changes(&id);
    net.settle();
    assert_eq!(net.values("bob", &id), [json!("from alice")]);

    net.node("bob").list_mut(&id).unwrap().append(json!("from bob"), None, T).unwrap();
    net.node("bob").sync_local_changes(&id);
    net.settle();
    let alice = net.values("alice", &id);
    assert_eq!(alice.len(), 2);
    assert_eq!(alice, net.values("bob", &id));
    assert_eq!(alice, net.values("server", &id));
}

#[test]
fn concurrent_edits_converge_everywhere() {
    let mut net = Network::new();
    for name in ["a", "b", "c", "hub"] {
        net.add(name);
    }
    for name in ["a", "b", "c"] {
        net.connect(name, "hub");
    }
    let id = net.node("a").create_list(Header::list()).unwrap();
    net.settle();
    net.node("b").load(id);
    net.node("c").load(id);
    net.settle();

    for (round, name) in ["a", "b", "c", "a", "c"].iter().enumerate() {
        let node = net.node(name);
        node.list_mut(&id).unwrap().append(json!(round), Some(0).filter(|_| round > 0), T).unwrap();
        node.sync_local_changes(&id);
    }
    net.settle();

    let hub = net.values("hub", &id);
    assert_eq!(hub.len(), 5);
    for name in ["a", "b", "c"] {
        assert_eq!(net.values(name, &id), hub);
        assert_eq!(net.node(name).known_state(&id), net.node("hub").known_state(&id));
    }
}

#[test]
fn unknown_documents_are_unavailable() {
    let mut net = Network::new();
    net.add("a");
    net.add("b");
    net.add("c");
    net.connect_peers("a", "b");
    net.connect_peers("a", "c");

    let id = Header::list().id();
    net.node("a").load(id);
    net.settle();
    assert_eq!(net.node("a").load_state(&id), LoadState::Unavailable);
    assert!(net.node("a").list(&id).is_none());
}

#[test]
fn one_peer_having_the_document_is_enough() {
    let mut net = Network::new();
    net.add("a");
    net.add("b");
    net.add("c");
    net.connect_peers("a", "b");
    net.connect_peers("a", "c");
    let id = net.node("c").create_list(Header::list()).unwrap();
    net.node("c").list_mut(&id).unwrap().append(json!(1), None, T).unwrap();

    net.node("a").load(id);
    net.settle();
    assert_eq!(net.node("a").load_state(&id), LoadState::Available);
    assert_eq!(net.values("a", &id), [json!(1)]);
}

// =============================================================================
// Misbehaving links
// =============================================================================

fn shared_pair() -> (Network, DocId) {
    let mut net = Network::new();
    net.add("a");
    net.add("b");
    net.connect_peers("a", "b");
    let id = net.node("a").create_list(Header::list()).unwrap();
    net.node("b").load(id);
    net.settle();
    return (net, id);
}

#[test]
fn duplicate_content_is_harmless() {
    let (mut net, id) = shared_pair();
    net.node("a").list_mut(&id).unwrap().append(json!("x"), None, T).unwrap();
    net.node("a").sync_local_changes(&id);
    let outbox = net.node("a").drain_outbox();
    assert_eq!(outbox.len(), 1);
    let (_, content) = outbox.into_iter().next().unwrap();

    net.node("b").receive("a", content.clone()).unwrap();
    net.node("b").receive("a", content).unwrap();
    net.settle();
    assert_eq!(net.values("b", &id), [json!("x")]);
    assert_eq!(net.node("b").list(&id).unwrap().log().transaction_count(), 1);
}

#[test]
fn lost_messages_are_repaired_by_correction() {
    let (mut net, id) = shared_pair();
    net.node("a").list_mut(&id).unwrap().append(json!(1), None, T).unwrap();
    net.node("a").sync_local_changes(&id);
    // Lost in transit.
    net.node("a").drain_outbox();

    net.node("a").list_mut(&id).unwrap().append(json!(2), None, T).unwrap();
    net.node("a").sync_local_changes(&id);
    let outbox = net.node("a").drain_outbox();
    let (_, content) = outbox.into_iter().next().unwrap();
    net.node("b").receive("a", content).unwrap();

    let replies = net.node("b").drain_outbox();
    assert!(matches!(
        replies.as_slice(),
        [(_, SyncMessage::Known { is_correction: true, .. })]
    ));
    for (_, message) in replies {
        net.node("a").receive("b", message).unwrap();
    }
    net.settle();
    assert_eq!(net.values("b", &id), [json!(1), json!(2)]);
}

#[test]
fn tampered_content_cuts_the_peer_off() {
    let (mut net, id) = shared_pair();
    net.node("a").list_mut(&id).unwrap().append(json!("real"), None, T).unwrap();
    net.node("a").sync_local_changes(&id);
    let (_, message) = net.node("a").drain_outbox().into_iter().next().unwrap();
    let SyncMessage::Content(mut content) = message else {
        panic!("expected content");
    };
    for session in content.new.values_mut() {
        session.transactions[0].made_at += 1;
    }
    net.node("b").receive("a", SyncMessage::Content(content)).unwrap();

    assert!(net.node("b").list(&id).unwrap().is_empty());
    assert!(net.node("b").peer("a").unwrap().is_errored(&id));
    assert!(net.node("b").drain_outbox().is_empty());
}

#[test]
fn pulls_do_not_subscribe() {
    let (mut net, id) = shared_pair();
    net.add("c");
    net.connect_peers("a", "c");
    net.node("c").pull(id, "a").unwrap();
    net.settle();
    assert_eq!(net.node("c").load_state(&id), LoadState::Available);

    net.node("a").list_mut(&id).unwrap().append(json!("later"), None, T).unwrap();
    net.node("a").sync_local_changes(&id);
    net.settle();
    assert!(net.node("c").list(&id).unwrap().is_empty());
    assert_eq!(net.values("b", &id), [json!("later")]);
}
