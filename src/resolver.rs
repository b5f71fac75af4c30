//! Cluster resolution.
//!
//! Given an incoming (email, phone) pair, the resolver loads every contact
//! sharing either value, works out which identity clusters those contacts
//! belong to, merges the clusters under the oldest primary, and records the
//! pair if it adds information the clusters did not already hold.
//!
//! All reads and writes go through one [`ContactTransaction`]; the caller
//! commits it only if [`ClusterResolver::reconcile`] succeeds.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, info};

use crate::contact::{Contact, ContactId, LinkedContact, NewContact};
use crate::error::{ReconcileError, ReconcileResult, ValidationError};
use crate::storage::ContactTransaction;

/// Upper bound on `linked_id` hops followed while looking for a root primary.
pub const MAX_LINK_HOPS: usize = 128;

/// A validated (email, phone) pair with at least one value present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactKey {
    email: Option<String>,
    phone_number: Option<String>,
}

impl ContactKey {
    /// Build a key, treating empty strings as absent.
    ///
    /// # Errors
    /// `MissingIdentifier` if neither value is present.
    pub fn new(
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<Self, ValidationError> {
        let email = email.filter(|e| !e.is_empty());
        let phone_number = phone_number.filter(|p| !p.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    /// The email, if supplied.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The phone number, if supplied.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Returns true if both values were supplied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.email.is_some() && self.phone_number.is_some()
    }
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Contact inserted for this request, if any.
    pub inserted: Option<ContactId>,
    /// Former primaries demoted under the surviving primary.
    pub demoted: Vec<ContactId>,
    /// Existing contact that matched the pair exactly.
    pub touched: Option<ContactId>,
    /// Orphaned secondary promoted to primary because its anchor was deleted.
    pub promoted: Option<ContactId>,
}

impl ReconcileOutcome {
    /// Returns true if two or more clusters were merged.
    #[must_use]
    pub fn merged(&self) -> bool {
        !self.demoted.is_empty()
    }
}

/// The shape of a cluster after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCluster {
    pub primary: Contact,
    /// Ordered by `created_at`, then id.
    pub secondaries: Vec<Contact>,
    pub outcome: ReconcileOutcome,
}

/// Pick the oldest contact: earliest `created_at`, lowest id on ties.
#[must_use]
pub fn select_winner<'a, I>(candidates: I) -> Option<&'a Contact>
where
    I: IntoIterator<Item = &'a Contact>,
{
    candidates.into_iter().min_by_key(|c| c.age_key())
}

/// Computes and applies the merged cluster shape for incoming pairs.
#[derive(Debug, Clone)]
pub struct ClusterResolver {
    max_link_hops: usize,
}

impl Default for ClusterResolver {
    fn default() -> Self {
        Self {
            max_link_hops: MAX_LINK_HOPS,
        }
    }
}

impl ClusterResolver {
    /// Create a resolver with the default hop limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile `key` against the store, staging every change in `tx`.
    ///
    /// The transaction is left uncommitted; on error the caller must drop it.
    pub fn reconcile(
        &self,
        tx: &mut dyn ContactTransaction,
        key: &ContactKey,
    ) -> ReconcileResult<ResolvedCluster> {
        let matches = tx.find_connected(key.email(), key.phone_number())?;
        debug!(matches = matches.len(), "loaded connected contacts");

        if matches.is_empty() {
            let primary = tx.insert(NewContact::primary(
                key.email.clone(),
                key.phone_number.clone(),
            ))?;
            info!(contact_id = %primary.id, "created new primary contact");
            return Ok(ResolvedCluster {
                outcome: ReconcileOutcome {
                    inserted: Some(primary.id),
                    ..ReconcileOutcome::default()
                },
                primary,
                secondaries: Vec::new(),
            });
        }

        let candidates = self.candidate_primaries(&*tx, &matches)?;
        let winner = select_winner(candidates.values())
            .cloned()
            .ok_or_else(|| ReconcileError::failed("matched contacts yielded no primary"))?;

        let mut outcome = ReconcileOutcome::default();

        if !winner.is_primary() {
            tx.promote_to_primary(winner.id)?;
            outcome.promoted = Some(winner.id);
            info!(contact_id = %winner.id, "promoted orphaned secondary to primary");
        }

        let losers: BTreeSet<ContactId> = candidates
            .keys()
            .copied()
            .filter(|id| *id != winner.id)
            .collect();
        if !losers.is_empty() {
            tx.demote_to_secondary(&losers, winner.id)?;
            outcome.demoted = losers.iter().copied().collect();
            info!(
                primary = %winner.id,
                demoted = ?outcome.demoted,
                "merged identity clusters"
            );
        }

        if let Some(exact) = matches
            .iter()
            .find(|m| m.contact.has_pair(key.email(), key.phone_number()))
        {
            tx.touch_updated_at(exact.contact.id)?;
            outcome.touched = Some(exact.contact.id);
        } else if key.is_complete() && adds_information(key, &matches) {
            let secondary = tx.insert(NewContact::secondary(
                key.email.clone(),
                key.phone_number.clone(),
                winner.id,
            ))?;
            outcome.inserted = Some(secondary.id);
            info!(contact_id = %secondary.id, primary = %winner.id, "linked new secondary contact");
        }

        let winner_id = winner.id;
        let primary = tx.get(winner_id)?.ok_or_else(|| {
            ReconcileError::failed(format!("primary {winner_id} vanished mid-transaction"))
        })?;
        let secondaries = tx.secondaries_of(&BTreeSet::from([winner_id]))?;

        Ok(ResolvedCluster {
            primary,
            secondaries,
            outcome,
        })
    }

    /// Every distinct cluster root reachable from `matches`, keyed by id.
    fn candidate_primaries(
        &self,
        tx: &dyn ContactTransaction,
        matches: &[LinkedContact],
    ) -> ReconcileResult<BTreeMap<ContactId, Contact>> {
        let mut candidates = BTreeMap::new();
        for m in matches {
            let root = if m.contact.is_primary() {
                m.contact.clone()
            } else {
                match &m.linked {
                    Some(linked) if linked.is_primary() => linked.clone(),
                    Some(linked) => self.root_of(tx, linked.clone())?,
                    None => self.root_of(tx, m.contact.clone())?,
                }
            };
            candidates.entry(root.id).or_insert(root);
        }
        Ok(candidates)
    }

    /// Follow `linked_id` until reaching a primary, or a contact whose link
    /// target no longer exists (which then stands in as the root).
    fn root_of(&self, tx: &dyn ContactTransaction, start: Contact) -> ReconcileResult<Contact> {
        let mut current = start;
        let mut seen = HashSet::new();
        for _ in 0..self.max_link_hops {
            if current.is_primary() {
                return Ok(current);
            }
            if !seen.insert(current.id) {
                return Err(ReconcileError::failed(format!(
                    "contact link chain contains a cycle at {}",
                    current.id
                )));
            }
            let Some(link) = current.linked_id else {
                return Ok(current);
            };
            match tx.get(link)? {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(ReconcileError::failed(format!(
            "contact link chain exceeded {} hops",
            self.max_link_hops
        )))
    }
}

/// True if the email or the phone of `key` appears in none of `matches`.
fn adds_information(key: &ContactKey, matches: &[LinkedContact]) -> bool {
    let email_known = matches
        .iter()
        .any(|m| m.contact.email().is_some() && m.contact.email() == key.email());
    let phone_known = matches
        .iter()
        .any(|m| m.contact.phone_number().is_some() && m.contact.phone_number() == key.phone_number());
    !email_known || !phone_known
}
