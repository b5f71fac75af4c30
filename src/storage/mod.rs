//! Contact storage.
//!
//! [`ContactStore`] is the abstract interface; [`InMemoryContactStore`] and,
//! with the `persistent` feature, [`PersistentContactStore`] implement it on
//! top of the same indexed table and staging transaction.

mod memory;
mod table;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryContactStore;
pub use traits::{ContactStore, ContactTransaction, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentContactStore};
