//! Cluster resolution: seed lookup, primary discovery, and cluster expansion.
//!
//! Nothing here takes locks on its own behalf except [`lock_primaries_in_order`];
//! reads are only consistent once the caller holds the identity mutex and the
//! row locks of every primary involved.

use std::collections::BTreeSet;

use crate::{Contact, ContactId, ContactStore, Fragment, IdentityError};

/// Set with insertion-order iteration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveryOrderSet<T: Ord + Clone> {
    order: Vec<T>,
    seen: BTreeSet<T>,
}

impl<T: Ord + Clone> DiscoveryOrderSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { order: Vec::new(), seen: BTreeSet::new() }
    }

    /// Returns `true` when `value` was not present before.
    pub fn insert(&mut self, value: T) -> bool {
        if self.seen.insert(value.clone()) {
            self.order.push(value);
            return true;
        }
        false
    }

    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.seen.contains(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.order.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.order
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.order
    }
}

impl<T: Ord + Clone> Default for DiscoveryOrderSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> FromIterator<T> for DiscoveryOrderSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

/// Snapshot of the rows belonging to one or more primaries, in store discovery order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Cluster {
    members: Vec<Contact>,
}

impl Cluster {
    #[must_use]
    pub fn new(members: Vec<Contact>) -> Self {
        Self { members }
    }

    #[must_use]
    pub fn members(&self) -> &[Contact] {
        &self.members
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<&Contact> {
        self.members.iter().find(|contact| contact.id == id)
    }

    #[must_use]
    pub fn primaries(&self) -> Vec<&Contact> {
        self.members.iter().filter(|contact| contact.is_primary()).collect()
    }

    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        self.members.iter().any(|contact| contact.email.as_deref() == Some(email))
    }

    #[must_use]
    pub fn has_phone_number(&self, phone_number: &str) -> bool {
        self.members.iter().any(|contact| contact.phone_number.as_deref() == Some(phone_number))
    }

    #[must_use]
    pub fn distinct_emails(&self) -> DiscoveryOrderSet<String> {
        self.members.iter().filter_map(|contact| contact.email.clone()).collect()
    }

    #[must_use]
    pub fn distinct_phone_numbers(&self) -> DiscoveryOrderSet<String> {
        self.members.iter().filter_map(|contact| contact.phone_number.clone()).collect()
    }

    /// Primary ids referenced by members (own id for primaries, `linked_id` otherwise).
    #[must_use]
    pub fn referenced_primary_ids(&self) -> DiscoveryOrderSet<ContactId> {
        self.members.iter().map(Contact::primary_id).collect()
    }
}

/// Every row matching the fragment's email OR phone number. Never a full scan.
///
/// # Errors
/// Propagates store lookup failures.
pub fn resolve_seed(
    store: &mut dyn ContactStore,
    fragment: &Fragment,
) -> Result<Vec<Contact>, IdentityError> {
    if fragment.email().is_none() && fragment.phone_number().is_none() {
        return Ok(Vec::new());
    }
    store.find_by_email_or_phone(fragment.email(), fragment.phone_number())
}

/// Canonical primary ids referenced by the seeds, deduplicated in discovery order.
#[must_use]
pub fn candidate_primary_ids(seeds: &[Contact]) -> DiscoveryOrderSet<ContactId> {
    seeds.iter().map(Contact::primary_id).collect()
}

/// Lock `primary_ids` in ascending id order and return that order.
///
/// Every transaction acquires overlapping primaries in the same global order, so no
/// two of them can each hold a lock the other is waiting for.
///
/// # Errors
/// Propagates lock acquisition failures.
pub fn lock_primaries_in_order(
    store: &mut dyn ContactStore,
    primary_ids: &[ContactId],
) -> Result<Vec<ContactId>, IdentityError> {
    let ordered =
        primary_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
    if ordered.is_empty() {
        return Ok(ordered);
    }
    store.lock_primaries(&ordered)?;
    Ok(ordered)
}

/// Full membership of the named primaries' clusters.
///
/// # Errors
/// Propagates store lookup failures.
pub fn expand_cluster(
    store: &mut dyn ContactStore,
    primary_ids: &[ContactId],
) -> Result<Cluster, IdentityError> {
    if primary_ids.is_empty() {
        return Ok(Cluster::default());
    }
    Ok(Cluster::new(store.find_cluster_by_primary_ids(primary_ids)?))
}

/// Lock the seeds' primaries and expand their clusters until every member's owning
/// primary is itself locked.
///
/// A member can point outside the locked set when a concurrent transaction demoted
/// one of the seed primaries between the seed read and the lock; each extra round
/// locks the newly referenced primaries (ascending) and re-reads.
///
/// # Errors
/// Propagates lock and lookup failures.
pub fn lock_and_expand(
    store: &mut dyn ContactStore,
    seeds: &[Contact],
) -> Result<(DiscoveryOrderSet<ContactId>, Cluster), IdentityError> {
    let mut locked = DiscoveryOrderSet::new();
    let mut pending = candidate_primary_ids(seeds).into_vec();

    loop {
        for id in lock_primaries_in_order(store, &pending)? {
            locked.insert(id);
        }

        let cluster = expand_cluster(store, locked.as_slice())?;
        pending = cluster
            .referenced_primary_ids()
            .into_vec()
            .into_iter()
            .filter(|id| !locked.contains(id))
            .collect();

        if pending.is_empty() {
            return Ok((locked, cluster));
        }
        tracing::debug!(
            extra_primaries = ?pending,
            "cluster references primaries outside the locked set; widening"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryDatabase;
    use crate::ContactDatabase;

    fn id(raw: i64) -> ContactId {
        match ContactId::new(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture id {raw}: {err}"),
        }
    }

    #[test]
    fn discovery_order_set_keeps_first_insertion_position() {
        let set = ["b", "a", "b", "c", "a"].into_iter().collect::<DiscoveryOrderSet<_>>();
        assert_eq!(set.as_slice(), &["b", "a", "c"]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn resolve_seed_matches_email_or_phone() -> Result<(), IdentityError> {
        let db = MemoryDatabase::new();
        let alice = db.seed_primary(Some("alice@x.com"), Some("111"), 10);
        let bob = db.seed_primary(Some("bob@x.com"), Some("222"), 20);
        let _carol = db.seed_primary(Some("carol@x.com"), Some("333"), 30);

        let fragment = Fragment::normalize(Some("alice@x.com"), Some("222"))?;
        let seeds = db.in_transaction(|store| resolve_seed(store, &fragment))?;

        let ids = seeds.iter().map(|contact| contact.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![alice, bob]);
        Ok(())
    }

    #[test]
    fn candidate_primary_ids_follow_links_and_deduplicate() {
        let db = MemoryDatabase::new();
        let primary = db.seed_primary(Some("a@x.com"), Some("111"), 10);
        let _secondary = db.seed_secondary(Some("b@x.com"), Some("111"), primary, 11);

        let ids = candidate_primary_ids(&db.rows());
        assert_eq!(ids.as_slice(), &[primary]);
    }

    #[test]
    fn lock_primaries_in_order_sorts_ascending_and_deduplicates() -> Result<(), IdentityError> {
        let db = MemoryDatabase::new();
        let ordered = db.in_transaction(|store| {
            lock_primaries_in_order(store, &[id(9), id(3), id(9), id(5)])
        })?;

        assert_eq!(ordered, vec![id(3), id(5), id(9)]);
        assert_eq!(db.lock_calls(), vec![vec![id(3), id(5), id(9)]]);
        Ok(())
    }

    #[test]
    fn expand_cluster_with_no_primaries_skips_store() -> Result<(), IdentityError> {
        let db = MemoryDatabase::new();
        let cluster = db.in_transaction(|store| expand_cluster(store, &[]))?;
        assert!(cluster.is_empty());
        Ok(())
    }

    #[test]
    fn lock_and_expand_follows_members_pointing_outside_locked_set() -> Result<(), IdentityError> {
        let db = MemoryDatabase::new();
        let old = db.seed_primary(Some("old@x.com"), Some("111"), 10);
        let demoted = db.seed_secondary(Some("young@x.com"), Some("222"), old, 20);

        // A stale seed that still believes `demoted` is a primary.
        let stale_seed = db
            .rows()
            .into_iter()
            .map(|mut contact| {
                if contact.id == demoted {
                    contact.linked_id = None;
                    contact.link_precedence = crate::LinkPrecedence::Primary;
                }
                contact
            })
            .filter(|contact| contact.id == demoted)
            .collect::<Vec<_>>();

        let (locked, cluster) = db.in_transaction(|store| lock_and_expand(store, &stale_seed))?;

        assert_eq!(locked.as_slice(), &[demoted, old]);
        assert_eq!(cluster.len(), 2);
        assert_eq!(db.lock_calls(), vec![vec![demoted], vec![old]]);
        Ok(())
    }
}
