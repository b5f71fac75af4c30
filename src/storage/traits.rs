//! Abstract storage traits for idrecon.
//!
//! These traits define the contract that contact store backends must
//! implement. The resolver only ever talks to a [`ContactTransaction`], so a
//! request either commits every change it made or none of them.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::contact::{Contact, ContactId, LinkedContact, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// A write would break a row-level invariant.
    #[error("Constraint error: {0}")]
    Constraint(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A contact table that hands out transactions.
///
/// # Isolation
/// Backends must give each transaction at least read-committed isolation.
/// The bundled backends are serializable: a transaction holds the table's
/// write lock from [`ContactStore::begin`] until it is committed or dropped.
pub trait ContactStore: Send + Sync {
    /// Open a transaction. Dropping it without [`ContactTransaction::commit`]
    /// rolls back every staged change.
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError>;

    /// Read a committed contact, soft-deleted rows included.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Stamp `deleted_at` on a contact. Idempotent; never removes the row.
    fn soft_delete(&self, id: ContactId) -> Result<Contact, StorageError>;

    /// Number of rows ever inserted, soft-deleted rows included.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if no contact has ever been inserted.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// One unit of work against a [`ContactStore`].
///
/// All reads see the transaction's own staged writes. All operations ignore
/// soft-deleted rows.
pub trait ContactTransaction {
    /// Contacts whose email equals `email` or whose phone equals
    /// `phone_number`, ordered by `created_at` then id. Secondaries carry a
    /// snapshot of the contact their `linked_id` points at.
    ///
    /// Returns an empty list when both predicates are absent.
    fn find_connected(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<LinkedContact>, StorageError>;

    /// Read a single non-deleted contact.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Insert a new contact.
    ///
    /// # Errors
    /// - `Constraint`: both email and phone are empty, a primary carries a
    ///   link, a secondary lacks one, or the link target is not a live primary.
    fn insert(&mut self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Bump `updated_at` without any other change.
    fn touch_updated_at(&mut self, id: ContactId) -> Result<(), StorageError>;

    /// Turn every contact in `ids` into a secondary of `new_primary`.
    ///
    /// Contacts currently linked to any id in `ids` are re-pointed at
    /// `new_primary` as well, so no secondary is left two hops away from its
    /// primary. Every touched row gets a fresh `updated_at`.
    fn demote_to_secondary(
        &mut self,
        ids: &BTreeSet<ContactId>,
        new_primary: ContactId,
    ) -> Result<(), StorageError>;

    /// Make a secondary whose primary has disappeared the anchor of its cluster.
    fn promote_to_primary(&mut self, id: ContactId) -> Result<(), StorageError>;

    /// Contacts whose `linked_id` is in `primary_ids`, ordered by `created_at`
    /// then id.
    fn secondaries_of(
        &self,
        primary_ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Make every staged change durable and visible to other transactions.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_contact_store_object_safe(_: &dyn ContactStore) {}
    fn _assert_contact_transaction_object_safe(_: &dyn ContactTransaction) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ContactNotFound(ContactId::new(9));
        assert!(err.to_string().contains("Contact not found: 9"));

        let err = StorageError::BackendError("poisoned lock: contacts.begin".to_string());
        assert!(err.to_string().contains("poisoned lock"));
    }
}
