//! Structural checks over a snapshot of live contact rows.

use std::collections::HashMap;

use serde::Serialize;

use crate::{Contact, ContactId, LinkPrecedence};

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    /// Offending row, or `None` for cluster-wide findings.
    pub contact_id: Option<ContactId>,
    pub message: String,
}

impl InvariantViolation {
    fn row(contact_id: ContactId, message: impl Into<String>) -> Self {
        Self { contact_id: Some(contact_id), message: message.into() }
    }

    fn cluster(message: impl Into<String>) -> Self {
        Self { contact_id: None, message: message.into() }
    }
}

/// Union-find over row positions; path halving, union by size.
struct Components {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl Components {
    fn new(len: usize) -> Self {
        Self { parent: (0..len).collect(), size: vec![1; len] }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, lhs: usize, rhs: usize) {
        let (mut lhs, mut rhs) = (self.find(lhs), self.find(rhs));
        if lhs == rhs {
            return;
        }
        if self.size[lhs] < self.size[rhs] {
            std::mem::swap(&mut lhs, &mut rhs);
        }
        self.parent[rhs] = lhs;
        self.size[lhs] += self.size[rhs];
    }
}

/// Report every broken link invariant in `contacts`. Soft-deleted rows are ignored.
///
/// Clusters are the connected components of shared email, shared phone number and
/// `linked_id` edges; each must hold exactly one primary.
#[must_use]
pub fn check_invariants(contacts: &[Contact]) -> Vec<InvariantViolation> {
    let live = contacts.iter().filter(|contact| contact.deleted_at.is_none()).collect::<Vec<_>>();
    let position = live
        .iter()
        .enumerate()
        .map(|(index, contact)| (contact.id, index))
        .collect::<HashMap<_, _>>();

    let mut violations = Vec::new();
    for contact in &live {
        if contact.email.is_none() && contact.phone_number.is_none() {
            violations.push(InvariantViolation::row(contact.id, "row has neither email nor phone"));
        }
        match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, Some(linked)) => violations.push(InvariantViolation::row(
                contact.id,
                format!("primary row carries linked_id {linked}"),
            )),
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Secondary, None) => violations
                .push(InvariantViolation::row(contact.id, "secondary row has no linked_id")),
            (LinkPrecedence::Secondary, Some(linked)) => {
                match position.get(&linked).map(|index| live[*index]) {
                    None => violations.push(InvariantViolation::row(
                        contact.id,
                        format!("linked_id {linked} is not a live contact"),
                    )),
                    Some(target) if !target.is_primary() => {
                        violations.push(InvariantViolation::row(
                            contact.id,
                            format!("linked_id {linked} points at a secondary"),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let mut components = Components::new(live.len());
    let mut by_email = HashMap::new();
    let mut by_phone = HashMap::new();
    for (index, contact) in live.iter().enumerate() {
        if let Some(email) = contact.email.as_deref() {
            let first = *by_email.entry(email).or_insert(index);
            components.union(first, index);
        }
        if let Some(phone_number) = contact.phone_number.as_deref() {
            let first = *by_phone.entry(phone_number).or_insert(index);
            components.union(first, index);
        }
        if let Some(target) = contact.linked_id.and_then(|linked| position.get(&linked)) {
            components.union(*target, index);
        }
    }

    let mut primaries_by_root: HashMap<usize, Vec<ContactId>> = HashMap::new();
    let mut roots = Vec::new();
    for (index, contact) in live.iter().enumerate() {
        let root = components.find(index);
        let primaries = primaries_by_root.entry(root).or_insert_with(|| {
            roots.push(root);
            Vec::new()
        });
        if contact.is_primary() {
            primaries.push(contact.id);
        }
    }

    for root in roots {
        let primaries = primaries_by_root.get(&root).map(Vec::as_slice).unwrap_or_default();
        match primaries {
            [_] => {}
            [] => violations.push(InvariantViolation::cluster(format!(
                "cluster containing contact {} has no primary",
                live[root].id
            ))),
            many => violations.push(InvariantViolation::cluster(format!(
                "cluster holds {} primaries: {}",
                many.len(),
                many.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    violations
}
