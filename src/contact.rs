//! Contact records and link precedence.
//!
//! A [`Contact`] is one observation of a customer's email and/or phone number.
//! Contacts are grouped into clusters: exactly one primary (the oldest) and any
//! number of secondaries that point at it through `linked_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
///
/// Ids are allocated in increasing order and never reused, so a lower id was
/// always inserted earlier than a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContactId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Position of a contact within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    /// The anchor of a cluster.
    Primary,
    /// Merged into a cluster, see [`Contact::linked_id`].
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub phone_number: Option<String>,

    /// Set only on secondaries; always the cluster's current primary.
    #[serde(default)]
    pub linked_id: Option<ContactId>,

    pub link_precedence: LinkPrecedence,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Returns true if this contact anchors its cluster.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns true if the row has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Email as a borrowed `Option<&str>`.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Phone number as a borrowed `Option<&str>`.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Returns true if this row carries exactly the given pair, absence included.
    #[must_use]
    pub fn has_pair(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        self.email() == email && self.phone_number() == phone_number
    }

    /// Ordering key used to pick the oldest contact: `created_at`, then `id`.
    #[must_use]
    pub fn age_key(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Fields supplied when inserting a contact. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// A new cluster anchor.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// A new member of the cluster anchored at `primary`.
    #[must_use]
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// A matched contact together with a snapshot of the contact its `linked_id`
/// points at, when that contact exists and is not deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedContact {
    pub contact: Contact,
    pub linked: Option<Contact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: u64, created_at: DateTime<Utc>) -> Contact {
        Contact {
            id: ContactId::new(id),
            email: Some("doc@hillvalley.edu".to_string()),
            phone_number: None,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    #[test]
    fn test_age_key_orders_by_time_then_id() {
        let t = Utc::now();
        let a = contact(7, t);
        let b = contact(3, t);
        let c = contact(1, t + chrono::Duration::seconds(1));
        assert!(b.age_key() < a.age_key());
        assert!(a.age_key() < c.age_key());
    }

    #[test]
    fn test_has_pair_distinguishes_absent_fields() {
        let c = contact(1, Utc::now());
        assert!(c.has_pair(Some("doc@hillvalley.edu"), None));
        assert!(!c.has_pair(Some("doc@hillvalley.edu"), Some("555")));
        assert!(!c.has_pair(None, None));
    }

    #[test]
    fn test_serializes_with_camel_case_fields() {
        let c = contact(1, Utc::now());
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["linkPrecedence"], "primary");
        assert!(v.get("phoneNumber").is_some());
        assert!(v.get("deletedAt").is_none());
    }
}
