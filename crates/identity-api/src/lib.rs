use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use identity_core::{Contact, Fragment, IdentifyRequest, IdentifyResponse, IdentityError};
use identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteContactDb, StoreConfig};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Process-level handle over one contact database.
///
/// Cheap to clone; every clone shares the same connection pool and lock table, which
/// is what keeps concurrent `identify` calls from racing each other.
#[derive(Debug, Clone)]
pub struct IdentityApi {
    db: Arc<SqliteContactDb>,
}

impl IdentityApi {
    /// Open the database without touching its schema.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or configured.
    pub fn open(db_path: &Path, config: StoreConfig) -> Result<Self> {
        let db = SqliteContactDb::open(db_path, config)?;
        Ok(Self { db: Arc::new(db) })
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db.path().to_path_buf()
    }

    /// Reconcile one request against the stored contacts.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] for an empty request, `Transient` when the
    /// database stays busy past its timeout, and `Consistency`/`Store` for internal faults.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentityError> {
        identity_core::identify(self.db.as_ref(), request)
    }

    /// Same as [`IdentityApi::identify`] for a fragment the caller already normalized.
    ///
    /// # Errors
    /// Returns `Transient` when the database stays busy past its timeout, and
    /// `Consistency`/`Store` for internal faults.
    pub fn identify_fragment(&self, fragment: &Fragment) -> Result<IdentifyResponse, IdentityError> {
        identity_core::identify_fragment(self.db.as_ref(), fragment)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.db.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let before = self.db.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        self.db.migrate()?;
        let after = self.db.schema_status()?;
        tracing::debug!(
            from = before.current_version,
            to = after.current_version,
            "schema migration finished"
        );
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.db.integrity_check()
    }

    /// # Errors
    /// Returns an error when the contact listing cannot be read.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.db.list_contacts()
    }
}
