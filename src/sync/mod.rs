//! Reconciling documents between replicas.
//!
//! Peers exchange [`KnownState`] summaries and send each other only the
//! transactions the other side is missing. [`LocalNode`] drives the
//! protocol for every document a process holds.

mod known;
mod message;
mod node;
mod peer;

pub use known::KnownState;
pub use message::Content;
pub use message::Priority;
pub use message::SessionContent;
pub use message::SyncMessage;
pub use node::LoadState;
pub use node::LocalNode;
pub use node::SyncError;
pub use peer::PeerId;
pub use peer::PeerRole;
pub use peer::PeerState;
