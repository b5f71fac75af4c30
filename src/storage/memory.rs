//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of
//! [`ContactStore`]. It is intended for embedded usage, tests, and as a
//! reference implementation.

use std::sync::{Arc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::contact::{Contact, ContactId};
use crate::storage::table::{ContactTable, TableTransaction};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory contact store with serializable transactions.
pub struct InMemoryContactStore {
    table: RwLock<ContactTable>,
    clock: Arc<dyn Clock>,
}

impl InMemoryContactStore {
    /// Create a new empty store using wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new empty store with an explicit time source.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: RwLock::new(ContactTable::default()),
            clock,
        }
    }

    /// Every committed row, soft-deleted rows included, ordered by id.
    pub fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.snapshot"))?;
        Ok(table.contacts().cloned().collect())
    }
}

impl Default for InMemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let guard = self.table.write().map_err(|_| lock_err("contacts.begin"))?;
        Ok(Box::new(TableTransaction::new(guard, &*self.clock, None)))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.get"))?;
        Ok(table.get(id).cloned())
    }

    fn soft_delete(&self, id: ContactId) -> Result<Contact, StorageError> {
        let guard = self.table.write().map_err(|_| lock_err("contacts.soft_delete"))?;
        let mut tx = TableTransaction::new(guard, &*self.clock, None);
        let contact = tx.stage_soft_delete(id)?;
        Box::new(tx).commit()?;
        Ok(contact)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.len"))?;
        Ok(table.len())
    }
}
