//! Projection of a resolved cluster into the externally visible summary.

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};

/// Merged identity as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub primary_contact_id: ContactId,
    /// Primary's email first, then distinct secondary emails in input order.
    pub emails: Vec<String>,
    /// Primary's phone first, then distinct secondary phones in input order.
    pub phone_numbers: Vec<String>,
    /// Ascending.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// `{ "contact": { ... } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: IdentitySummary,
}

impl From<IdentitySummary> for IdentifyResponse {
    fn from(contact: IdentitySummary) -> Self {
        Self { contact }
    }
}

fn push_distinct(out: &mut Vec<String>, value: Option<&str>) {
    if let Some(v) = value {
        if !out.iter().any(|existing| existing == v) {
            out.push(v.to_string());
        }
    }
}

/// Build the summary for `primary` and its `secondaries`.
///
/// Pure: reads only its arguments. Secondaries are expected in
/// `created_at` order so that values appear in the order they were seen.
#[must_use]
pub fn build_response(primary: &Contact, secondaries: &[Contact]) -> IdentitySummary {
    let mut emails = Vec::with_capacity(secondaries.len() + 1);
    let mut phone_numbers = Vec::with_capacity(secondaries.len() + 1);

    push_distinct(&mut emails, primary.email());
    push_distinct(&mut phone_numbers, primary.phone_number());
    for s in secondaries {
        push_distinct(&mut emails, s.email());
        push_distinct(&mut phone_numbers, s.phone_number());
    }

    let mut secondary_contact_ids: Vec<ContactId> = secondaries.iter().map(|s| s.id).collect();
    secondary_contact_ids.sort_unstable();
    secondary_contact_ids.dedup();

    IdentitySummary {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    }
}
