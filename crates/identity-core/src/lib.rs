use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub mod invariants;
pub mod merge;
pub mod reconcile;
pub mod resolver;

#[cfg(test)]
pub(crate) mod test_support;

pub use invariants::{check_invariants, InvariantViolation};
pub use merge::{merge_primaries, select_canonical, MergeOutcome};
pub use reconcile::{build_response, identify, identify_fragment, reconcile};
pub use resolver::{
    candidate_primary_ids, expand_cluster, lock_and_expand, lock_primaries_in_order, resolve_seed,
    Cluster, DiscoveryOrderSet,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("consistency fault: {0}")]
    Consistency(String),
    #[error("transient store fault: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Coarse failure classes a transport maps onto its own status codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Internal,
    Transient,
}

impl IdentityError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Consistency(_) | Self::Store(_) => ErrorKind::Internal,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }
}

/// Store-assigned contact identifier. Always strictly positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub struct ContactId(i64);

impl ContactId {
    /// Wrap a raw store id.
    ///
    /// # Errors
    /// Returns [`IdentityError::Consistency`] when `raw` is not strictly positive.
    pub fn new(raw: i64) -> Result<Self, IdentityError> {
        if raw <= 0 {
            return Err(IdentityError::Consistency(format!("invalid contact id {raw}")));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for ContactId {
    type Error = IdentityError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContactId> for i64 {
    fn from(value: ContactId) -> Self {
        value.0
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The id of the primary that owns this row: `linked_id` when set, otherwise the row itself.
    #[must_use]
    pub fn primary_id(&self) -> ContactId {
        self.linked_id.unwrap_or(self.id)
    }
}

/// A normalized identity fragment. At least one of email and phone number is present.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fragment {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Fragment {
    /// Normalize raw fragment fields: trim both, lower-case the email, and treat
    /// empty values as absent.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither field survives normalization.
    pub fn normalize(
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let email = normalize_email(email);
        let phone_number = normalize_phone_number(phone_number);

        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(
                "either email or phoneNumber must be provided".to_string(),
            ));
        }

        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.email(), self.phone_number())
    }
}

impl TryFrom<&IdentifyRequest> for Fragment {
    type Error = IdentityError;

    fn try_from(request: &IdentifyRequest) -> Result<Self, Self::Error> {
        Self::normalize(request.email.as_deref(), request.phone_number.as_deref())
    }
}

#[must_use]
pub fn normalize_email(email: Option<&str>) -> Option<String> {
    email.map(|raw| raw.trim().to_lowercase()).filter(|value| !value.is_empty())
}

#[must_use]
pub fn normalize_phone_number(phone_number: Option<&str>) -> Option<String> {
    phone_number.map(|raw| raw.trim().to_string()).filter(|value| !value.is_empty())
}

/// Key that scopes the creation mutex: `"{email}#{phone}"` with absent parts left empty.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self(format!("{}#{}", email.unwrap_or_default(), phone_number.unwrap_or_default()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-width lock id: the first eight bytes of the key's SHA-256, big-endian.
    #[must_use]
    pub fn lock_id(&self) -> i64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(prefix)
    }
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyResponse {
    pub contact: ContactSummary,
}

/// Per-transaction execution context over the contact table.
///
/// Every read excludes soft-deleted rows. Implementations hold all locks they hand out
/// until the enclosing transaction ends.
pub trait ContactStore {
    /// Block until the transaction-scoped mutex for `key` is held.
    ///
    /// # Errors
    /// Returns an error when the underlying store fails while waiting.
    fn acquire_identity_lock(&mut self, key: &IdentityKey) -> Result<(), IdentityError>;

    /// Rows whose email equals `email` OR whose phone equals `phone_number`.
    /// Absent arguments contribute no predicate; with both absent the result is empty.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError>;

    /// Rows whose `id` or `linked_id` is one of `primary_ids`, ordered by ascending id.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    fn find_cluster_by_primary_ids(
        &mut self,
        primary_ids: &[ContactId],
    ) -> Result<Vec<Contact>, IdentityError>;

    /// Take exclusive row locks on `primary_ids`, in the order given.
    ///
    /// # Errors
    /// Returns an error when a lock cannot be taken.
    fn lock_primaries(&mut self, primary_ids: &[ContactId]) -> Result<(), IdentityError>;

    /// # Errors
    /// Returns an error when the insert fails.
    fn create_primary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Contact, IdentityError>;

    /// # Errors
    /// Returns an error when the insert fails.
    fn create_secondary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        primary_id: ContactId,
    ) -> Result<Contact, IdentityError>;

    /// Turn `primary_id` into a secondary of `new_primary_id`. Returns the affected row count.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    fn demote_primary(
        &mut self,
        primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, IdentityError>;

    /// Point every row linked to `old_primary_id` at `new_primary_id`. Returns the affected
    /// row count.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    fn reattach_secondaries(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, IdentityError>;
}

/// Injected store handle that hands out transactional [`ContactStore`] contexts.
pub trait ContactDatabase {
    /// Run `f` inside one transaction: commit when it returns `Ok`, roll back otherwise.
    /// Locks taken through the context are released when the transaction ends either way.
    ///
    /// # Errors
    /// Returns the error produced by `f`, or a store error from begin/commit.
    fn in_transaction<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn normalize_trims_and_lowercases_email() -> Result<(), IdentityError> {
        let fragment = Fragment::normalize(Some("  DOC@FLUX.COM  "), Some(" 555 "))?;
        assert_eq!(fragment.email(), Some("doc@flux.com"));
        assert_eq!(fragment.phone_number(), Some("555"));
        Ok(())
    }

    #[test]
    fn normalize_treats_blank_fields_as_absent() -> Result<(), IdentityError> {
        let fragment = Fragment::normalize(Some("   "), Some("123"))?;
        assert_eq!(fragment.email(), None);
        assert_eq!(fragment.phone_number(), Some("123"));
        Ok(())
    }

    #[test]
    fn normalize_rejects_fragment_without_any_field() {
        for (email, phone) in [(None, None), (Some(""), Some("")), (Some("  "), None)] {
            let result = Fragment::normalize(email, phone);
            assert!(
                matches!(result, Err(IdentityError::Validation(_))),
                "expected validation error for {email:?}/{phone:?}"
            );
        }
    }

    #[test]
    fn identity_key_uses_empty_placeholders() -> Result<(), IdentityError> {
        let both = Fragment::normalize(Some("a@x.com"), Some("111"))?;
        let email_only = Fragment::normalize(Some("a@x.com"), None)?;
        let phone_only = Fragment::normalize(None, Some("111"))?;

        assert_eq!(both.identity_key().as_str(), "a@x.com#111");
        assert_eq!(email_only.identity_key().as_str(), "a@x.com#");
        assert_eq!(phone_only.identity_key().as_str(), "#111");
        assert_ne!(email_only.identity_key().lock_id(), phone_only.identity_key().lock_id());
        Ok(())
    }

    #[test]
    fn contact_id_rejects_non_positive_values() {
        assert!(matches!(ContactId::new(0), Err(IdentityError::Consistency(_))));
        assert!(matches!(ContactId::new(-7), Err(IdentityError::Consistency(_))));
        assert!(ContactId::new(1).is_ok());
    }

    #[test]
    fn contact_id_deserialization_validates_positivity() {
        assert!(serde_json::from_str::<ContactId>("0").is_err());
        assert!(matches!(serde_json::from_str::<ContactId>("42").map(ContactId::get), Ok(42)));
    }

    #[test]
    fn error_kinds_classify_faults() {
        assert_eq!(IdentityError::Validation(String::new()).kind(), ErrorKind::Validation);
        assert_eq!(IdentityError::Consistency(String::new()).kind(), ErrorKind::Internal);
        assert_eq!(IdentityError::Store(String::new()).kind(), ErrorKind::Internal);
        assert_eq!(IdentityError::Transient(String::new()).kind(), ErrorKind::Transient);
    }

    #[test]
    fn response_serializes_with_camel_case_fields() -> Result<(), Box<dyn std::error::Error>> {
        let response = IdentifyResponse {
            contact: ContactSummary {
                primary_contact_id: ContactId::new(1)?,
                emails: vec!["a@x.com".to_string()],
                phone_numbers: vec!["111".to_string()],
                secondary_contact_ids: vec![ContactId::new(2)?],
            },
        };
        let value = serde_json::to_value(&response)?;
        assert_eq!(
            value,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": ["a@x.com"],
                    "phoneNumbers": ["111"],
                    "secondaryContactIds": [2]
                }
            })
        );
        Ok(())
    }

    proptest! {
        #[test]
        fn property_identity_key_is_deterministic_after_normalization(
            email in "[a-z]{1,8}@[a-z]{1,8}\\.com",
            phone in "[0-9]{3,10}",
            pad in 0_usize..4,
        ) {
            let padding = " ".repeat(pad);
            let noisy_email = format!("{padding}{}{padding}", email.to_uppercase());
            let noisy_phone = format!("{padding}{phone}{padding}");

            let clean = Fragment::normalize(Some(&email), Some(&phone));
            let noisy = Fragment::normalize(Some(&noisy_email), Some(&noisy_phone));
            prop_assert!(clean.is_ok() && noisy.is_ok());
            if let (Ok(clean), Ok(noisy)) = (clean, noisy) {
                prop_assert_eq!(clean.identity_key().lock_id(), noisy.identity_key().lock_id());
                prop_assert_eq!(clean, noisy);
            }
        }
    }
}
