//! Who may write, who may read, and which keys unlock private payloads.
//!
//! The log asks a [`Permissions`] implementation about every transaction it
//! validates. Answers depend on the transaction's `made_at`, so a revoked
//! writer's earlier edits stay valid while later ones are dropped.
//!
//! When an answer for an already-validated transaction may have changed,
//! the implementation bumps its [`epoch`](Permissions::epoch). The list
//! engine notices the new epoch and rebuilds from scratch.

use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use rustc_hash::FxHashMap;

use crate::key::KeyId;
use crate::key::KeyPub;
use crate::key::ReadKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Writer,
    Reader,
}

impl Role {
    pub fn can_write(&self) -> bool {
        return matches!(self, Role::Admin | Role::Writer);
    }
}

pub trait Permissions: Send + Sync {
    /// The role `agent` held at time `at`, if any.
    fn role_of(&self, agent: &KeyPub, at: u64) -> Option<Role>;

    fn can_write(&self, agent: &KeyPub, at: u64) -> bool {
        return self.role_of(agent, at).is_some_and(|r| r.can_write());
    }

    fn can_read(&self, agent: &KeyPub, at: u64) -> bool {
        return self.role_of(agent, at).is_some();
    }

    /// Look up a read key by id. `None` means this replica does not hold it.
    fn read_key(&self, id: &KeyId) -> Option<ReadKey>;

    /// The key new private transactions should be sealed with.
    fn current_read_key(&self) -> Option<(KeyId, ReadKey)>;

    /// Changes whenever a previous answer may no longer hold.
    fn epoch(&self) -> u64;
}

#[derive(Clone, Copy, Debug)]
struct Grant {
    from: u64,
    role: Option<Role>,
}

#[derive(Debug, Default)]
struct GroupState {
    everyone: Option<Role>,
    grants: FxHashMap<KeyPub, Vec<Grant>>,
    keys: FxHashMap<KeyId, ReadKey>,
    current: Option<KeyId>,
    epoch: u64,
}

/// An in-memory permission group with time-stamped grants.
///
/// Shared between replicas of the same document through an `Arc`, or
/// rebuilt per replica with the same grants and keys.
#[derive(Debug, Default)]
pub struct Group {
    state: RwLock<GroupState>,
}

impl Group {
    /// An empty group holding one fresh read key.
    pub fn new() -> Group {
        let group = Group::default();
        group.rotate_read_key();
        return group;
    }

    /// A group in which every agent may write.
    pub fn allow_all() -> Group {
        let group = Group::new();
        group.write().everyone = Some(Role::Writer);
        return group;
    }

    fn read(&self) -> RwLockReadGuard<'_, GroupState> {
        return self.state.read().unwrap_or_else(|e| e.into_inner());
    }

    fn write(&self) -> RwLockWriteGuard<'_, GroupState> {
        return self.state.write().unwrap_or_else(|e| e.into_inner());
    }

    /// Give `agent` a role starting at time `from`.
    pub fn add_member(&self, agent: KeyPub, role: Role, from: u64) {
        self.set(agent, Some(role), from);
    }

    /// Take every role away from `agent` as of time `at`.
    pub fn revoke(&self, agent: KeyPub, at: u64) {
        self.set(agent, None, at);
    }

    fn set(&self, agent: KeyPub, role: Option<Role>, from: u64) {
        let mut state = self.write();
        let grants = state.grants.entry(agent).or_default();
        let pos = grants.partition_point(|g| g.from <= from);
        grants.insert(pos, Grant { from, role });
        state.epoch += 1;
        tracing::debug!(?agent, ?role, from, epoch = state.epoch, "group membership changed");
    }

    /// Install a new current read key. Old keys stay available for reading.
    pub fn rotate_read_key(&self) -> KeyId {
        let key = ReadKey::generate();
        let id = key.id();
        let mut state = self.write();
        state.keys.insert(id, key);
        state.current = Some(id);
        return id;
    }

    /// Make a key known to this group, e.g. one shared by another replica.
    pub fn add_read_key(&self, key: ReadKey) -> KeyId {
        let id = key.id();
        let mut state = self.write();
        if state.keys.insert(id, key).is_none() {
            // Deferred private transactions may now open.
            state.epoch += 1;
        }
        if state.current.is_none() {
            state.current = Some(id);
        }
        return id;
    }

    /// Forget a key entirely.
    pub fn drop_read_key(&self, id: &KeyId) {
        let mut state = self.write();
        state.keys.remove(id);
        if state.current == Some(*id) {
            state.current = None;
        }
    }
}

impl Permissions for Group {
    fn role_of(&self, agent: &KeyPub, at: u64) -> Option<Role> {
        let state = self.read();
        if let Some(grants) = state.grants.get(agent) {
            let pos = grants.partition_point(|g| g.from <= at);
            if pos > 0 {
                return grants[pos - 1].role;
            }
        }
        return state.everyone;
    }

    fn read_key(&self, id: &KeyId) -> Option<ReadKey> {
        return self.read().keys.get(id).cloned();
    }

    fn current_read_key(&self) -> Option<(KeyId, ReadKey)> {
        let state = self.read();
        let id = state.current?;
        let key = state.keys.get(&id)?.clone();
        return Some((id, key));
    }

    fn epoch(&self) -> u64 {
        return self.read().epoch;
    }
}
