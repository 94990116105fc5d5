//! Engine configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::clock::ClockMode;

/// Largest transaction payload accepted, in bytes.
pub const MAX_TX_SIZE: usize = 100 * 1024;

/// Knobs shared by the log, the list engine and the sync node.
///
/// Every field has a default, so a partial JSON object is a valid config:
///
/// ```
/// let config = tandem::Config::from_json(r#"{ "chains": false }"#).unwrap();
/// assert!(!config.chains);
/// assert_eq!(config.max_tx_size, tandem::config::MAX_TX_SIZE);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Transactions whose payload exceeds this are rejected.
    pub max_tx_size: usize,
    /// Collapse linear insertion runs into chains while merging.
    pub chains: bool,
    /// Compact outgoing change batches before they are logged.
    pub pack_changes: bool,
    /// Time source for new transactions.
    pub clock: ClockMode,
}

impl Config {
    pub fn new() -> Config {
        return Config {
            max_tx_size: MAX_TX_SIZE,
            chains: true,
            pack_changes: true,
            clock: ClockMode::Wall,
        };
    }

    pub fn from_json(text: &str) -> Result<Config, serde_json::Error> {
        return serde_json::from_str(text);
    }
}

impl Default for Config {
    fn default() -> Self {
        return Self::new();
    }
}
