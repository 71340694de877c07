use std::cmp::Ordering;

use crate::{Cluster, Contact, ContactId, ContactStore, IdentityError};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MergeOutcome {
    pub canonical: Contact,
    /// Former primaries, in the order they were demoted.
    pub demoted: Vec<ContactId>,
}

fn canonical_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

/// The earliest-created primary; equal timestamps fall back to the lowest id.
#[must_use]
pub fn select_canonical<'a>(primaries: &[&'a Contact]) -> Option<&'a Contact> {
    primaries.iter().copied().min_by(|lhs, rhs| canonical_order(lhs, rhs))
}

/// Fold every primary of `cluster` other than the canonical one into it.
///
/// Each extra primary is demoted and its dependents are re-pointed in discovery
/// order. The caller must re-read the cluster afterwards; `cluster` is stale once
/// this returns.
///
/// # Errors
/// Returns [`IdentityError::Consistency`] when the cluster holds no primary or a
/// demotion does not affect exactly one row, and propagates store failures.
pub fn merge_primaries(
    store: &mut dyn ContactStore,
    cluster: &Cluster,
) -> Result<MergeOutcome, IdentityError> {
    let primaries = cluster.primaries();
    let canonical = select_canonical(&primaries).cloned().ok_or_else(|| {
        IdentityError::Consistency("merge requested for a cluster without primaries".to_string())
    })?;

    let mut demoted = Vec::new();
    for primary in primaries {
        if primary.id == canonical.id {
            continue;
        }
        demote_into(store, primary.id, canonical.id)?;
        demoted.push(primary.id);
    }

    Ok(MergeOutcome { canonical, demoted })
}

fn demote_into(
    store: &mut dyn ContactStore,
    primary_id: ContactId,
    canonical_id: ContactId,
) -> Result<(), IdentityError> {
    let affected = store.demote_primary(primary_id, canonical_id)?;
    if affected != 1 {
        return Err(IdentityError::Consistency(format!(
            "demote_primary({primary_id} -> {canonical_id}): expected to update 1 row, got {affected}"
        )));
    }

    let reattached = store.reattach_secondaries(primary_id, canonical_id)?;
    tracing::info!(
        demoted = %primary_id,
        canonical = %canonical_id,
        reattached,
        "demoted primary into canonical contact"
    );
    Ok(())
}
