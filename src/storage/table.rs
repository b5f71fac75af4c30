//! Indexed contact table and the staging transaction shared by all backends.
//!
//! A [`TableTransaction`] holds the table's write guard for its whole
//! lifetime and buffers every change in a private overlay. Reads consult the
//! overlay first, then the table. Nothing reaches the table until commit, so
//! dropping the transaction is a complete rollback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLockWriteGuard;

use tracing::debug;

use crate::clock::Clock;
use crate::contact::{Contact, ContactId, LinkPrecedence, LinkedContact, NewContact};
use crate::storage::traits::{ContactTransaction, StorageError};

/// Durable sink for committed row images. Called before the table is updated.
pub(crate) trait CommitLog: Send + Sync {
    fn append_commit(&self, changes: &[Contact]) -> Result<(), StorageError>;
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, str::is_empty)
}

fn remove_from_index(
    index: &mut HashMap<String, BTreeSet<ContactId>>,
    key: Option<&str>,
    id: ContactId,
) {
    let Some(key) = key else {
        return;
    };
    if let Some(set) = index.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// All contact rows plus lookup indexes.
#[derive(Debug, Default, Clone)]
pub(crate) struct ContactTable {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_link: HashMap<ContactId, BTreeSet<ContactId>>,
    last_id: u64,
}

impl ContactTable {
    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Insert or replace a row image, keeping every index in step.
    pub(crate) fn upsert(&mut self, contact: Contact) {
        let id = contact.id;
        if let Some(prev) = self.by_id.get(&id).cloned() {
            remove_from_index(&mut self.by_email, prev.email(), id);
            remove_from_index(&mut self.by_phone, prev.phone_number(), id);
            if let Some(link) = prev.linked_id {
                if let Some(set) = self.by_link.get_mut(&link) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.by_link.remove(&link);
                    }
                }
            }
        }

        if let Some(email) = contact.email.clone() {
            self.by_email.entry(email).or_default().insert(id);
        }
        if let Some(phone) = contact.phone_number.clone() {
            self.by_phone.entry(phone).or_default().insert(id);
        }
        if let Some(link) = contact.linked_id {
            self.by_link.entry(link).or_default().insert(id);
        }

        self.last_id = self.last_id.max(id.get());
        self.by_id.insert(id, contact);
    }
}

/// Serializable transaction over a [`ContactTable`].
pub(crate) struct TableTransaction<'a> {
    table: RwLockWriteGuard<'a, ContactTable>,
    staged: BTreeMap<ContactId, Contact>,
    next_id: u64,
    clock: &'a dyn Clock,
    log: Option<&'a dyn CommitLog>,
}

impl<'a> TableTransaction<'a> {
    pub(crate) fn new(
        table: RwLockWriteGuard<'a, ContactTable>,
        clock: &'a dyn Clock,
        log: Option<&'a dyn CommitLog>,
    ) -> Self {
        let next_id = table.last_id() + 1;
        Self {
            table,
            staged: BTreeMap::new(),
            next_id,
            clock,
            log,
        }
    }

    fn current(&self, id: ContactId) -> Option<&Contact> {
        self.staged.get(&id).or_else(|| self.table.get(id))
    }

    fn live(&self, id: ContactId) -> Option<&Contact> {
        self.current(id).filter(|c| !c.is_deleted())
    }

    fn live_owned(&self, id: ContactId) -> Result<Contact, StorageError> {
        self.live(id)
            .cloned()
            .ok_or(StorageError::ContactNotFound(id))
    }

    fn stage(&mut self, contact: Contact) {
        self.staged.insert(contact.id, contact);
    }

    /// Stage a soft delete. Already-deleted rows are returned unchanged.
    pub(crate) fn stage_soft_delete(&mut self, id: ContactId) -> Result<Contact, StorageError> {
        let mut contact = self
            .current(id)
            .cloned()
            .ok_or(StorageError::ContactNotFound(id))?;
        if contact.is_deleted() {
            return Ok(contact);
        }
        let now = self.clock.now();
        contact.deleted_at = Some(now);
        contact.touch(now);
        self.stage(contact.clone());
        Ok(contact)
    }

    fn validate_new(&self, new: &NewContact) -> Result<(), StorageError> {
        if is_blank(new.email.as_deref()) && is_blank(new.phone_number.as_deref()) {
            return Err(StorageError::Constraint(
                "contact must carry an email or a phone number".to_string(),
            ));
        }

        match (new.link_precedence, new.linked_id) {
            (LinkPrecedence::Primary, Some(link)) => Err(StorageError::Constraint(format!(
                "primary contact cannot be linked (linked_id={link})"
            ))),
            (LinkPrecedence::Secondary, None) => Err(StorageError::Constraint(
                "secondary contact requires a linked_id".to_string(),
            )),
            (LinkPrecedence::Secondary, Some(link)) => match self.live(link) {
                Some(target) if target.is_primary() => Ok(()),
                Some(_) => Err(StorageError::Constraint(format!(
                    "linked_id {link} is not a primary contact"
                ))),
                None => Err(StorageError::Constraint(format!(
                    "linked_id {link} does not reference a live contact"
                ))),
            },
            (LinkPrecedence::Primary, None) => Ok(()),
        }
    }
}

impl ContactTransaction for TableTransaction<'_> {
    fn find_connected(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<LinkedContact>, StorageError> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }

        let mut ids = BTreeSet::new();
        if let Some(set) = email.and_then(|e| self.table.by_email.get(e)) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = phone_number.and_then(|p| self.table.by_phone.get(p)) {
            ids.extend(set.iter().copied());
        }
        ids.extend(self.staged.keys().copied());

        let mut out: Vec<LinkedContact> = ids
            .into_iter()
            .filter_map(|id| self.live(id))
            .filter(|c| {
                (email.is_some() && c.email() == email)
                    || (phone_number.is_some() && c.phone_number() == phone_number)
            })
            .map(|c| LinkedContact {
                contact: c.clone(),
                linked: c.linked_id.and_then(|link| self.live(link)).cloned(),
            })
            .collect();

        out.sort_by_key(|m| m.contact.age_key());
        Ok(out)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        Ok(self.live(id).cloned())
    }

    fn insert(&mut self, new: NewContact) -> Result<Contact, StorageError> {
        self.validate_new(&new)?;

        let id = ContactId::new(self.next_id);
        self.next_id += 1;
        let now = self.clock.now();
        let contact = Contact {
            id,
            email: new.email,
            phone_number: new.phone_number,
            linked_id: new.linked_id,
            link_precedence: new.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        debug!(contact_id = %id, precedence = %contact.link_precedence, "staged contact insert");
        self.stage(contact.clone());
        Ok(contact)
    }

    fn touch_updated_at(&mut self, id: ContactId) -> Result<(), StorageError> {
        let mut contact = self.live_owned(id)?;
        contact.touch(self.clock.now());
        self.stage(contact);
        Ok(())
    }

    fn demote_to_secondary(
        &mut self,
        ids: &BTreeSet<ContactId>,
        new_primary: ContactId,
    ) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        if ids.contains(&new_primary) {
            return Err(StorageError::Constraint(format!(
                "contact {new_primary} cannot be demoted under itself"
            )));
        }
        let target = self.live_owned(new_primary)?;
        if !target.is_primary() {
            return Err(StorageError::Constraint(format!(
                "demotion target {new_primary} is not a primary contact"
            )));
        }

        let children = self.secondaries_of(ids)?;
        let now = self.clock.now();

        for id in ids {
            let mut contact = self.live_owned(*id)?;
            contact.link_precedence = LinkPrecedence::Secondary;
            contact.linked_id = Some(new_primary);
            contact.touch(now);
            self.stage(contact);
        }

        for mut child in children {
            child.linked_id = Some(new_primary);
            child.touch(now);
            self.stage(child);
        }

        debug!(count = ids.len(), primary = %new_primary, "staged demotion");
        Ok(())
    }

    fn promote_to_primary(&mut self, id: ContactId) -> Result<(), StorageError> {
        let mut contact = self.live_owned(id)?;
        if contact.is_primary() {
            return Ok(());
        }
        contact.link_precedence = LinkPrecedence::Primary;
        contact.linked_id = None;
        contact.touch(self.clock.now());
        self.stage(contact);
        Ok(())
    }

    fn secondaries_of(
        &self,
        primary_ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError> {
        let mut ids = BTreeSet::new();
        for primary in primary_ids {
            if let Some(set) = self.table.by_link.get(primary) {
                ids.extend(set.iter().copied());
            }
        }
        ids.extend(self.staged.keys().copied());

        let mut out: Vec<Contact> = ids
            .into_iter()
            .filter_map(|id| self.live(id))
            .filter(|c| c.linked_id.is_some_and(|link| primary_ids.contains(&link)))
            .cloned()
            .collect();

        out.sort_by_key(Contact::age_key);
        Ok(out)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        let mut table = this.table;
        if this.staged.is_empty() {
            return Ok(());
        }

        let changes: Vec<Contact> = this.staged.into_values().collect();
        if let Some(log) = this.log {
            log.append_commit(&changes)?;
        }

        let count = changes.len();
        for contact in changes {
            table.upsert(contact);
        }
        debug!(rows = count, "transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::RwLock;

    use chrono::Duration;

    use crate::clock::ManualClock;

    fn insert_primary(tx: &mut TableTransaction<'_>, email: &str, phone: &str) -> Contact {
        tx.insert(NewContact::primary(
            Some(email.to_string()),
            Some(phone.to_string()),
        ))
        .unwrap()
    }

    #[test]
    fn test_staged_rows_are_visible_inside_the_transaction_only() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();

        {
            let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);
            let c = insert_primary(&mut tx, "marty@hillvalley.edu", "555");
            assert_eq!(c.id, ContactId::new(1));
            assert_eq!(tx.find_connected(Some("marty@hillvalley.edu"), None).unwrap().len(), 1);
            // dropped: rollback
        }

        assert_eq!(table.read().unwrap().len(), 0);
    }

    #[test]
    fn test_commit_applies_rows_and_advances_ids() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();

        let tx = {
            let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);
            insert_primary(&mut tx, "marty@hillvalley.edu", "555");
            Box::new(tx)
        };
        tx.commit().unwrap();

        let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);
        let c = insert_primary(&mut tx, "doc@hillvalley.edu", "121");
        assert_eq!(c.id, ContactId::new(2));
    }

    #[test]
    fn test_find_connected_orders_by_created_at_then_id() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();
        let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);

        clock.advance(Duration::seconds(10));
        let late = insert_primary(&mut tx, "a@x.io", "1");
        clock.set(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        let early = insert_primary(&mut tx, "b@x.io", "1");
        let same_time = insert_primary(&mut tx, "c@x.io", "1");

        let found = tx.find_connected(None, Some("1")).unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.contact.id).collect();
        assert_eq!(ids, vec![early.id, same_time.id, late.id]);
    }

    #[test]
    fn test_insert_rejects_blank_and_malformed_links() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();
        let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);

        assert!(matches!(
            tx.insert(NewContact::primary(None, Some(String::new()))),
            Err(StorageError::Constraint(_))
        ));
        assert!(matches!(
            tx.insert(NewContact::secondary(Some("a@x.io".into()), None, ContactId::new(99))),
            Err(StorageError::Constraint(_))
        ));

        let primary = insert_primary(&mut tx, "a@x.io", "1");
        let secondary = tx
            .insert(NewContact::secondary(Some("b@x.io".into()), None, primary.id))
            .unwrap();
        assert!(matches!(
            tx.insert(NewContact::secondary(Some("c@x.io".into()), None, secondary.id)),
            Err(StorageError::Constraint(_))
        ));
    }

    #[test]
    fn test_demotion_relinks_existing_secondaries() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();
        let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);

        let a = insert_primary(&mut tx, "a@x.io", "1");
        let b = insert_primary(&mut tx, "b@x.io", "2");
        let b_child = tx
            .insert(NewContact::secondary(Some("b2@x.io".into()), None, b.id))
            .unwrap();

        tx.demote_to_secondary(&BTreeSet::from([b.id]), a.id).unwrap();

        let secondaries = tx.secondaries_of(&BTreeSet::from([a.id])).unwrap();
        let ids: Vec<_> = secondaries.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, b_child.id]);
        assert!(tx.secondaries_of(&BTreeSet::from([b.id])).unwrap().is_empty());
        assert!(matches!(
            tx.demote_to_secondary(&BTreeSet::from([a.id]), a.id),
            Err(StorageError::Constraint(_))
        ));
    }

    #[test]
    fn test_soft_deleted_rows_are_invisible_to_matching() {
        let table = RwLock::new(ContactTable::default());
        let clock = ManualClock::at_epoch();
        let mut tx = TableTransaction::new(table.write().unwrap(), &clock, None);

        let a = insert_primary(&mut tx, "a@x.io", "1");
        tx.stage_soft_delete(a.id).unwrap();
        assert!(tx.find_connected(Some("a@x.io"), Some("1")).unwrap().is_empty());
        assert!(tx.get(a.id).unwrap().is_none());
        assert!(matches!(tx.touch_updated_at(a.id), Err(StorageError::ContactNotFound(_))));
    }
}
