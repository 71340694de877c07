use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use identity_core::{
    check_invariants, Contact, ContactDatabase, ContactId, ContactStore, IdentityError,
    IdentityKey, InvariantViolation, LinkPrecedence,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod locks;

pub use locks::{LockKey, LockTable, TxLocks};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK ((link_precedence = 'primary') = (linked_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a statement waits on a locked database before failing as busy.
    pub busy_timeout: Duration,
    /// Connections kept open for reuse once released.
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { busy_timeout: Duration::from_millis(5_000), max_idle_connections: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub invariant_violations: Vec<InvariantViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.invariant_violations.is_empty()
            && self.schema_status.pending_versions.is_empty()
    }
}

/// File-backed contact database with a small pool of idle connections.
///
/// Every connection of one handle shares the same [`LockTable`]; open one handle per
/// database file and share it (it is `Sync`). `:memory:` is not supported because each
/// pooled connection would see its own empty database.
#[derive(Debug)]
pub struct SqliteContactDb {
    path: PathBuf,
    config: StoreConfig,
    idle: Mutex<Vec<Connection>>,
    locks: Arc<LockTable>,
    next_owner: AtomicU64,
}

impl SqliteContactDb {
    /// Open the database at `path` and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        let conn = open_connection(path, &config)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            idle: Mutex::new(vec![conn]),
            locks: Arc::new(LockTable::new()),
            next_owner: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        open_connection(&self.path, &self.config)
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(conn);
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.checkout()?;
        let result = f(&mut conn);
        self.checkin(conn);
        result
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.with_connection(|conn| schema_status_on(conn))
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database reports a newer
    /// schema than this build understands.
    pub fn migrate(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
                .context("failed to apply schema_migrations table")?;

            let version = current_schema_version(conn)?;
            if version > LATEST_SCHEMA_VERSION {
                return Err(anyhow!(
                    "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
                ));
            }
            if version < 1 {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .context("failed to start migration transaction")?;
                tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
                record_schema_version(&tx, 1)?;
                tx.commit().context("failed to commit migration 1")?;
                tracing::info!(version = 1, path = %self.path.display(), "applied migration");
            }
            Ok(())
        })
    }

    /// Every contact row ordered by id, soft-deleted rows included.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"))
                .context("failed to prepare contact listing")?;
            let rows = stmt.query_map([], contact_from_row)?;

            let mut contacts = Vec::new();
            for row in rows {
                contacts.push(row.context("failed to decode contact row")?);
            }
            Ok(contacts)
        })
    }

    /// Run quick-check, foreign-key-check, schema status, and cluster invariant probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let (quick_check_message, foreign_key_violations, schema_status) =
            self.with_connection(|conn| {
                let quick_check_message: String = conn
                    .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                    .context("failed to run PRAGMA quick_check")?;

                let mut stmt = conn
                    .prepare("PRAGMA foreign_key_check")
                    .context("failed to prepare PRAGMA foreign_key_check")?;
                let rows = stmt.query_map([], |row| {
                    Ok(ForeignKeyViolation {
                        table: row.get(0)?,
                        rowid: row.get(1)?,
                        parent: row.get(2)?,
                        fk_index: row.get(3)?,
                    })
                })?;

                let mut foreign_key_violations = Vec::new();
                for row in rows {
                    foreign_key_violations.push(row?);
                }
                drop(stmt);

                Ok((quick_check_message, foreign_key_violations, schema_status_on(conn)?))
            })?;

        let invariant_violations = if schema_status.current_version >= 1 {
            check_invariants(&self.list_contacts()?)
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            invariant_violations,
            schema_status,
        })
    }

    fn run_transaction<T, F>(&self, conn: &mut Connection, f: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>,
    {
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        // Declared before the transaction so locks outlive commit or rollback.
        let mut locks = TxLocks::new(Arc::clone(&self.locks), owner);

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| store_error("begin transaction", &err))?;

        let result = {
            let mut store = SqliteTx { conn: &tx, locks: &mut locks };
            f(&mut store)
        };

        match result {
            Ok(value) => {
                tx.commit().map_err(|err| store_error("commit transaction", &err))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl ContactDatabase for SqliteContactDb {
    fn in_transaction<T, F>(&self, f: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>,
    {
        let mut conn =
            self.checkout().map_err(|err| IdentityError::Store(format!("{err:#}")))?;
        let result = self.run_transaction(&mut conn, f);
        self.checkin(conn);
        result
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
    locks: &'a mut TxLocks,
}

impl SqliteTx<'_> {
    fn query_contacts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Contact>, IdentityError> {
        let mut stmt =
            self.conn.prepare_cached(sql).map_err(|err| store_error("prepare query", &err))?;
        let rows = stmt
            .query_map(params, contact_from_row)
            .map_err(|err| store_error("query contacts", &err))?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(|err| store_error("decode contact row", &err))?);
        }
        Ok(contacts)
    }

    fn insert(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<ContactId>,
    ) -> Result<Contact, IdentityError> {
        let link_precedence =
            if linked_id.is_some() { LinkPrecedence::Secondary } else { LinkPrecedence::Primary };
        let now = OffsetDateTime::now_utc();
        let stamp = format_rfc3339(now)?;

        self.conn
            .execute(
                "INSERT INTO contacts(email, phone_number, linked_id, link_precedence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    email,
                    phone_number,
                    linked_id.map(ContactId::get),
                    link_precedence.as_str(),
                    stamp
                ],
            )
            .map_err(|err| store_error("insert contact", &err))?;

        Ok(Contact {
            id: ContactId::new(self.conn.last_insert_rowid())?,
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id,
            link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }
}

impl ContactStore for SqliteTx<'_> {
    fn acquire_identity_lock(&mut self, key: &IdentityKey) -> Result<(), IdentityError> {
        self.locks.acquire(LockKey::Identity(key.lock_id()));
        Ok(())
    }

    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }
        // `= NULL` never matches, so an absent side drops out of the filter.
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (email = ?1 OR phone_number = ?2)
                 ORDER BY id ASC"
            ),
            params![email, phone_number],
        )
    }

    fn find_cluster_by_primary_ids(
        &mut self,
        primary_ids: &[ContactId],
    ) -> Result<Vec<Contact>, IdentityError> {
        if primary_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders =
            (1..=primary_ids.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (id IN ({placeholders}) OR linked_id IN ({placeholders}))
                 ORDER BY id ASC"
            ),
            params_from_iter(primary_ids.iter().map(|id| id.get())),
        )
    }

    fn lock_primaries(&mut self, primary_ids: &[ContactId]) -> Result<(), IdentityError> {
        for id in primary_ids {
            self.locks.acquire(LockKey::Row(id.get()));
        }
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
        let stamp = format_rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "UPDATE contacts
                 SET linked_id = ?1, link_precedence = 'secondary', updated_at = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![new_primary_id.get(), stamp, primary_id.get()],
            )
            .map_err(|err| store_error("demote primary", &err))
    }

    fn reattach_secondaries(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, IdentityError> {
        let stamp = format_rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "UPDATE contacts SET linked_id = ?1, updated_at = ?2 WHERE linked_id = ?3",
                params![new_primary_id.get(), stamp, old_primary_id.get()],
            )
            .map_err(|err| store_error("reattach secondaries", &err))
    }
}

fn open_connection(path: &Path, config: &StoreConfig) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    // busy_timeout first so the journal-mode switch itself waits out a busy writer.
    conn.busy_timeout(config.busy_timeout).context("failed to set sqlite busy timeout")?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// `Transient` for busy or locked databases, `Store` for everything else.
fn store_error(operation: &str, err: &rusqlite::Error) -> IdentityError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            IdentityError::Transient(format!("{operation}: {err}"))
        }
        _ => IdentityError::Store(format!("{operation}: {err}")),
    }
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    let id = ContactId::new(row.get(0)?).map_err(|err| conversion_error(0, Type::Integer, err))?;
    let linked_id = row
        .get::<_, Option<i64>>(3)?
        .map(ContactId::new)
        .transpose()
        .map_err(|err| conversion_error(3, Type::Integer, err))?;
    let precedence: String = row.get(4)?;
    let link_precedence = LinkPrecedence::parse(&precedence).ok_or_else(|| {
        conversion_error(4, Type::Text, anyhow!("unknown link_precedence {precedence}"))
    })?;

    Ok(Contact {
        id,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id,
        link_precedence,
        created_at: timestamp_column(row, 5)?,
        updated_at: timestamp_column(row, 6)?,
        deleted_at: row
            .get::<_, Option<String>>(7)?
            .map(|value| parse_rfc3339(&value))
            .transpose()
            .map_err(|err| conversion_error(7, Type::Text, err))?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let value: String = row.get(index)?;
    parse_rfc3339(&value).map_err(|err| conversion_error(index, Type::Text, err))
}

fn conversion_error(
    index: usize,
    column_type: Type,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, column_type, err.into())
}

fn schema_status_on(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = format_rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String, IdentityError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IdentityError::Store(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
