use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::header::DocId;
use crate::id::SessionKey;

/// A compact summary of what a replica holds of one document: whether it
/// has the header, and how many transactions of each session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: DocId,
    pub header: bool,
    pub sessions: BTreeMap<SessionKey, usize>,
}

impl KnownState {
    /// Knows nothing about `id`, not even the header.
    pub fn empty(id: DocId) -> KnownState {
        return KnownState {
            id,
            header: false,
            sessions: BTreeMap::new(),
        };
    }

    pub fn get(&self, key: &SessionKey) -> usize {
        return self.sessions.get(key).copied().unwrap_or(0);
    }

    /// Raise a session's count; counts never go down.
    pub fn update(&mut self, key: SessionKey, count: usize) {
        let entry = self.sessions.entry(key).or_insert(0);
        *entry = (*entry).max(count);
    }

    /// Pointwise maximum.
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (key, count) in &other.sessions {
            self.update(*key, *count);
        }
    }

    /// True when `other` holds everything this state holds.
    pub fn is_covered_by(&self, other: &KnownState) -> bool {
        if self.header && !other.header {
            return false;
        }
        return self.sessions.iter().all(|(key, count)| other.get(key) >= *count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::id::SessionId;
    use crate::key::KeyPair;

    fn key(seed: u8) -> SessionKey {
        return SessionKey::main(SessionId::with_nonce(KeyPair::from_seed([seed; 32]).key_pub, 0));
    }

    #[test]
    fn combine_takes_maximum() {
        let id = Header::list().id();
        let mut a = KnownState::empty(id);
        a.update(key(1), 3);
        let mut b = KnownState::empty(id);
        b.header = true;
        b.update(key(1), 1);
        b.update(key(2), 4);
        a.combine(&b);
        assert!(a.header);
        assert_eq!(a.get(&key(1)), 3);
        assert_eq!(a.get(&key(2)), 4);
    }

    #[test]
    fn coverage() {
        let id = Header::list().id();
        let mut small = KnownState::empty(id);
        small.update(key(1), 2);
        let mut big = small.clone();
        big.header = true;
        big.update(key(1), 5);
        assert!(small.is_covered_by(&big));
        assert!(!big.is_covered_by(&small));
    }

    #[test]
    fn session_keys_are_json_object_keys() {
        let id = Header::list().id();
        let mut known = KnownState::empty(id);
        known.update(key(1), 7);
        let text = serde_json::to_string(&known).unwrap();
        let back: KnownState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, known);
    }
}
