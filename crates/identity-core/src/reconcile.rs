//! Reconciliation orchestrator.
//!
//! One call runs inside one transaction:
//!
//! 1. take the identity-key mutex for the normalized fragment;
//! 2. look up seed rows; with none, create a primary and stop;
//! 3. lock the seeds' primaries in ascending id order and expand the cluster;
//! 4. fold extra primaries into the earliest-created one;
//! 5. insert a secondary when the fragment carries an unseen email or phone;
//! 6. answer from a fresh read of the final cluster.
//!
//! Any error aborts the transaction, so no partial merge or insert is ever committed.

use crate::resolver::lock_and_expand;
use crate::{
    expand_cluster, merge_primaries, resolve_seed, Cluster, Contact, ContactDatabase, ContactId,
    ContactStore, ContactSummary, Fragment, IdentifyRequest, IdentifyResponse, IdentityError,
};

/// Normalize `request` and reconcile it in its own transaction.
///
/// # Errors
/// Returns [`IdentityError::Validation`] before touching the store when the request
/// carries neither email nor phone number; otherwise any fault from [`reconcile`].
pub fn identify<D>(db: &D, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentityError>
where
    D: ContactDatabase + ?Sized,
{
    let fragment = Fragment::try_from(request)?;
    identify_fragment(db, &fragment)
}

/// Reconcile an already-normalized fragment in its own transaction.
///
/// # Errors
/// Propagates any fault from [`reconcile`] after the transaction is rolled back.
pub fn identify_fragment<D>(db: &D, fragment: &Fragment) -> Result<IdentifyResponse, IdentityError>
where
    D: ContactDatabase + ?Sized,
{
    db.in_transaction(|store| reconcile(store, fragment))
}

/// Run the reconciliation steps against an open transaction.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] on any violated cluster invariant and
/// propagates store faults unchanged.
pub fn reconcile(
    store: &mut dyn ContactStore,
    fragment: &Fragment,
) -> Result<IdentifyResponse, IdentityError> {
    let key = fragment.identity_key();
    let span = tracing::debug_span!("reconcile", identity_key = %key);
    let _entered = span.enter();

    store.acquire_identity_lock(&key)?;

    let seeds = resolve_seed(store, fragment)?;
    if seeds.is_empty() {
        let primary = store.create_primary(fragment.email(), fragment.phone_number())?;
        tracing::info!(primary = %primary.id, "created primary contact");
        return Ok(singleton_response(&primary));
    }
    tracing::debug!(seeds = seeds.len(), "resolved seed contacts");

    let (locked, mut cluster) = lock_and_expand(store, &seeds)?;
    tracing::debug!(locked = ?locked.as_slice(), members = cluster.len(), "expanded cluster");

    let canonical_id = if cluster.primaries().len() > 1 {
        let outcome = merge_primaries(store, &cluster)?;
        cluster = expand_cluster(store, &[outcome.canonical.id])?;
        outcome.canonical.id
    } else {
        sole_primary(&cluster)?
    };

    if introduces_new_information(&cluster, fragment) {
        let secondary =
            store.create_secondary(fragment.email(), fragment.phone_number(), canonical_id)?;
        tracing::info!(
            secondary = %secondary.id,
            primary = %canonical_id,
            "created secondary contact"
        );
        cluster = expand_cluster(store, &[canonical_id])?;
    }

    build_response(&cluster, canonical_id)
}

fn sole_primary(cluster: &Cluster) -> Result<ContactId, IdentityError> {
    match cluster.primaries().as_slice() {
        [primary] => Ok(primary.id),
        [] => Err(IdentityError::Consistency(format!(
            "cluster of {} contacts has no primary",
            cluster.len()
        ))),
        many => Err(IdentityError::Consistency(format!(
            "cluster unexpectedly holds {} primaries",
            many.len()
        ))),
    }
}

fn introduces_new_information(cluster: &Cluster, fragment: &Fragment) -> bool {
    let new_email = fragment.email().is_some_and(|email| !cluster.has_email(email));
    let new_phone =
        fragment.phone_number().is_some_and(|phone_number| !cluster.has_phone_number(phone_number));
    new_email || new_phone
}

fn singleton_response(primary: &Contact) -> IdentifyResponse {
    IdentifyResponse {
        contact: ContactSummary {
            primary_contact_id: primary.id,
            emails: primary.email.iter().cloned().collect(),
            phone_numbers: primary.phone_number.iter().cloned().collect(),
            secondary_contact_ids: Vec::new(),
        },
    }
}

/// Move the entry equal to `primary_value` to the front; everything else keeps its
/// relative order.
fn primary_first(values: Vec<String>, primary_value: Option<&str>) -> Vec<String> {
    let Some(primary_value) = primary_value else {
        return values;
    };
    let (mut front, rest): (Vec<_>, Vec<_>) =
        values.into_iter().partition(|value| value == primary_value);
    front.extend(rest);
    front
}

/// Assemble the response from the final cluster state.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when `primary_id` is not a member of `cluster`.
pub fn build_response(
    cluster: &Cluster,
    primary_id: ContactId,
) -> Result<IdentifyResponse, IdentityError> {
    let primary = cluster.get(primary_id).ok_or_else(|| {
        IdentityError::Consistency(format!("canonical primary {primary_id} missing from cluster"))
    })?;

    let emails = primary_first(cluster.distinct_emails().into_vec(), primary.email.as_deref());
    let phone_numbers = primary_first(
        cluster.distinct_phone_numbers().into_vec(),
        primary.phone_number.as_deref(),
    );

    let mut secondary_contact_ids = cluster
        .members()
        .iter()
        .map(|contact| contact.id)
        .filter(|id| *id != primary.id)
        .collect::<Vec<_>>();
    secondary_contact_ids.sort_unstable();

    Ok(IdentifyResponse {
        contact: ContactSummary {
            primary_contact_id: primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        },
    })
}
