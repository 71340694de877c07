//! In-memory `ContactDatabase` for engine tests. Single-threaded; a failed
//! transaction restores the row snapshot taken when it began.

use std::cell::RefCell;

use time::{Duration, OffsetDateTime};

use crate::{
    Contact, ContactDatabase, ContactId, ContactStore, IdentityError, IdentityKey, LinkPrecedence,
};

const INSERT_CLOCK_START: i64 = 1_000;

fn fixture_time(offset_seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds)
}

fn fixture_id(raw: i64) -> ContactId {
    match ContactId::new(raw) {
        Ok(id) => id,
        Err(err) => panic!("invalid fixture id {raw}: {err}"),
    }
}

#[derive(Debug, Clone)]
struct MemoryState {
    rows: Vec<Contact>,
    next_id: i64,
    clock: i64,
    lock_calls: Vec<Vec<ContactId>>,
    identity_locks: Vec<String>,
    fail_demotions: bool,
}

#[derive(Debug)]
pub(crate) struct MemoryDatabase {
    state: RefCell<MemoryState>,
}

impl MemoryDatabase {
    pub(crate) fn new() -> Self {
        Self {
            state: RefCell::new(MemoryState {
                rows: Vec::new(),
                next_id: 1,
                clock: INSERT_CLOCK_START,
                lock_calls: Vec::new(),
                identity_locks: Vec::new(),
                fail_demotions: false,
            }),
        }
    }

    fn insert_row(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<ContactId>,
        created_offset: i64,
    ) -> ContactId {
        let mut state = self.state.borrow_mut();
        let id = fixture_id(state.next_id);
        state.next_id += 1;
        state.rows.push(Contact {
            id,
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id,
            link_precedence: if linked_id.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            created_at: fixture_time(created_offset),
            updated_at: fixture_time(created_offset),
            deleted_at: None,
        });
        id
    }

    pub(crate) fn seed_primary(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        created_offset: i64,
    ) -> ContactId {
        self.insert_row(email, phone_number, None, created_offset)
    }

    pub(crate) fn seed_secondary(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        primary_id: ContactId,
        created_offset: i64,
    ) -> ContactId {
        self.insert_row(email, phone_number, Some(primary_id), created_offset)
    }

    pub(crate) fn soft_delete(&self, id: ContactId) {
        let mut state = self.state.borrow_mut();
        for row in state.rows.iter_mut().filter(|row| row.id == id) {
            row.deleted_at = Some(fixture_time(INSERT_CLOCK_START - 1));
        }
    }

    pub(crate) fn fail_demotions(&self) {
        self.state.borrow_mut().fail_demotions = true;
    }

    pub(crate) fn rows(&self) -> Vec<Contact> {
        self.state.borrow().rows.clone()
    }

    pub(crate) fn lock_calls(&self) -> Vec<Vec<ContactId>> {
        self.state.borrow().lock_calls.clone()
    }

    pub(crate) fn identity_locks(&self) -> Vec<String> {
        self.state.borrow().identity_locks.clone()
    }
}

impl ContactDatabase for MemoryDatabase {
    fn in_transaction<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>,
    {
        let mut state = self.state.borrow_mut();
        let snapshot = state.rows.clone();
        let next_id = state.next_id;

        let result = {
            let mut tx = MemoryTx { state: &mut *state };
            f(&mut tx)
        };

        if result.is_err() {
            state.rows = snapshot;
            state.next_id = next_id;
        }
        result
    }
}

struct MemoryTx<'a> {
    state: &'a mut MemoryState,
}

fn live_rows(rows: &[Contact]) -> impl Iterator<Item = &Contact> {
    rows.iter().filter(|row| row.deleted_at.is_none())
}

impl MemoryTx<'_> {
    fn insert(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<ContactId>,
    ) -> Result<Contact, IdentityError> {
        let id = ContactId::new(self.state.next_id)?;
        self.state.next_id += 1;
        let now = fixture_time(self.state.clock);
        self.state.clock += 1;

        let contact = Contact {
            id,
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id,
            link_precedence: if linked_id.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.state.rows.push(contact.clone());
        Ok(contact)
    }
}

impl ContactStore for MemoryTx<'_> {
    fn acquire_identity_lock(&mut self, key: &IdentityKey) -> Result<(), IdentityError> {
        self.state.identity_locks.push(key.as_str().to_string());
        Ok(())
    }

    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        Ok(live_rows(&self.state.rows)
            .filter(|row| {
                (email.is_some() && row.email.as_deref() == email)
                    || (phone_number.is_some() && row.phone_number.as_deref() == phone_number)
            })
            .cloned()
            .collect())
    }

    fn find_cluster_by_primary_ids(
        &mut self,
        primary_ids: &[ContactId],
    ) -> Result<Vec<Contact>, IdentityError> {
        Ok(live_rows(&self.state.rows)
            .filter(|row| {
                primary_ids.contains(&row.id)
                    || row.linked_id.is_some_and(|linked| primary_ids.contains(&linked))
            })
            .cloned()
            .collect())
    }

    fn lock_primaries(&mut self, primary_ids: &[ContactId]) -> Result<(), IdentityError> {
        self.state.lock_calls.push(primary_ids.to_vec());
        Ok(())
    }

    fn create_primary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Contact, IdentityError> {
        self.insert(email, phone_number, None)
    }

    fn create_secondary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        primary_id: ContactId,
    ) -> Result<Contact, IdentityError> {
        self.insert(email, phone_number, Some(primary_id))
    }

    fn demote_primary(
        &mut self,
        primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, IdentityError> {
        if self.state.fail_demotions {
            return Ok(0);
        }
        let mut affected = 0;
        for row in self
            .state
            .rows
            .iter_mut()
            .filter(|row| row.id == primary_id && row.deleted_at.is_none())
        {
            row.linked_id = Some(new_primary_id);
            row.link_precedence = LinkPrecedence::Secondary;
            affected += 1;
        }
        Ok(affected)
    }

    fn reattach_secondaries(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, IdentityError> {
        let mut affected = 0;
        for row in self.state.rows.iter_mut().filter(|row| row.linked_id == Some(old_primary_id)) {
            row.linked_id = Some(new_primary_id);
            affected += 1;
        }
        Ok(affected)
    }
}
