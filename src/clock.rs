//! Session clocks for stamping transactions.
//!
//! Every transaction carries a `made_at` timestamp. The list engine orders
//! concurrent edits by it, so a session's stamps must never go backwards and
//! must stay ahead of everything the session has already observed.
//!
//! Two modes are supported:
//! - `Wall`: milliseconds since the unix epoch, bumped when the wall clock
//!   stalls or runs behind an observed stamp.
//! - `Logical`: a pure Lamport counter. Deterministic, handy for tests.
//!
//! Complexity:
//! - tick: O(1)
//! - observe: O(1)

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// Which time source stamps a session's transactions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    #[default]
    Wall,
    Logical,
}

/// A monotonic clock owned by one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionClock {
    mode: ClockMode,
    last: u64,
}

impl SessionClock {
    pub fn new(mode: ClockMode) -> SessionClock {
        return SessionClock { mode, last: 0 };
    }

    /// A clock that resumes after `last`.
    pub fn with_time(mode: ClockMode, last: u64) -> SessionClock {
        return SessionClock { mode, last };
    }

    pub fn mode(&self) -> ClockMode {
        return self.mode;
    }

    /// The last stamp handed out or observed.
    #[inline]
    pub fn last(&self) -> u64 {
        return self.last;
    }

    /// Produce a stamp strictly greater than every earlier one.
    ///
    /// Saturates at `u64::MAX`; callers bound stamps well below that.
    pub fn tick(&mut self) -> u64 {
        let now = match self.mode {
            ClockMode::Wall => wall_millis(),
            ClockMode::Logical => 0,
        };
        self.last = now.max(self.last.saturating_add(1));
        return self.last;
    }

    /// Note a stamp seen from elsewhere, so later ticks sort after it.
    #[inline]
    pub fn observe(&mut self, remote: u64) {
        self.last = self.last.max(remote);
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        return Self::new(ClockMode::default());
    }
}

fn wall_millis() -> u64 {
    return SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
}
