//! Tandem - local-first collaborative documents.
//!
//! Every document is a set of signed, append-only session logs. Lists and
//! plain text are merged views over those logs, and replicas converge by
//! swapping the transactions they are missing.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use tandem::ClockMode;
//! use tandem::CoList;
//! use tandem::Config;
//! use tandem::DocLog;
//! use tandem::Group;
//! use tandem::Header;
//! use tandem::Privacy;
//! use tandem::Session;
//! use tandem::key::KeyPair;
//!
//! // Create a user identity and a session to write with
//! let session = Session::new(KeyPair::generate(), ClockMode::Wall);
//!
//! // Create a new list document anyone may write to
//! let log = DocLog::new(Header::list(), Arc::new(Group::allow_all()), Config::default());
//! let mut list = CoList::new(log, session).unwrap();
//!
//! // Edit the document
//! list.append_items(vec!["milk".into(), "eggs".into()], None, Privacy::Trusting).unwrap();
//! list.prepend("bread".into(), Some(0), Privacy::Trusting).unwrap();
//! assert_eq!(list.as_array(), &["bread", "milk", "eggs"]);
//! ```

pub mod clock;
pub mod config;
pub mod header;
pub mod id;
pub mod key;
pub mod list;
pub mod log;
pub mod permissions;
pub mod sync;
pub mod text;

pub use clock::ClockMode;
pub use config::Config;
pub use header::DocId;
pub use header::DocKind;
pub use header::Header;
pub use id::OpId;
pub use id::SessionKey;
pub use list::CoList;
pub use list::ListError;
pub use log::DocLog;
pub use log::Privacy;
pub use log::Session;
pub use log::TxError;
pub use permissions::Group;
pub use permissions::Permissions;
pub use permissions::Role;
pub use sync::LocalNode;
pub use sync::SyncMessage;
pub use text::CoPlainText;
