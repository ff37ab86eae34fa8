//! StateStore: redb-backed state persistence for spotgrid.
//!
//! Owns the database handle, the clock used to stamp records, and the
//! low-level row helpers shared by the job, resource, and assignment
//! operations (see `jobs.rs`, `resources.rs`, `assignments.rs`). Supports
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use spotgrid_core::{SharedClock, SystemClock};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

const FRAMEWORK_ID: &str = "framework_id";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: SharedClock,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: SystemClock::shared(),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            clock: SystemClock::shared(),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the clock used to stamp events and timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(JOB_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(USERS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` in a read transaction.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    /// Dropping an uncommitted redb transaction aborts it.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// Read every row of a record table.
    pub(crate) fn scan<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        self.read(|txn| {
            let table = txn.open_table(def).map_err(map_err!(Table))?;
            scan_rows(&table)
        })
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert or update a user. A zero id allocates a fresh one.
    pub fn put_user(&self, user: &User) -> StateResult<User> {
        let stored = self.write(|txn| {
            let mut user = user.clone();
            if user.id == 0 {
                user.id = next_sequence(txn, "user")?;
            }
            let mut table = txn.open_table(USERS).map_err(map_err!(Table))?;
            put_row(&mut table, &id_key(user.id), &user)?;
            Ok(user)
        })?;
        debug!(user_id = stored.id, "user stored");
        Ok(stored)
    }

    pub fn get_user(&self, id: UserId) -> StateResult<Option<User>> {
        self.read(|txn| {
            let table = txn.open_table(USERS).map_err(map_err!(Table))?;
            get_row(&table, &id_key(id))
        })
    }

    /// Get a user, failing with `NotFound` if absent.
    pub fn require_user(&self, id: UserId) -> StateResult<User> {
        self.get_user(id)?
            .ok_or_else(|| StateError::NotFound(format!("user {id}")))
    }

    pub fn list_users(&self) -> StateResult<Vec<User>> {
        self.scan(USERS)
    }

    // ── Framework ──────────────────────────────────────────────────

    pub fn get_framework_id(&self) -> StateResult<Option<String>> {
        self.read(|txn| {
            let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            let value = table
                .get(FRAMEWORK_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            Ok(value)
        })
    }

    pub fn set_framework_id(&self, framework_id: &str) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            table
                .insert(FRAMEWORK_ID, framework_id)
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(%framework_id, "framework id stored");
        Ok(())
    }
}

// ── Row helpers ────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn get_row<T, Tb>(table: &Tb, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn scan_rows<T, Tb>(table: &Tb) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn scan_prefix<T, Tb>(table: &Tb, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn put_row<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Bump and return a named counter. Counters start at 1 so 0 stays "none".
pub(crate) fn next_sequence(txn: &WriteTransaction, counter: &str) -> StateResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(counter)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(counter, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotgrid_core::{Region, Zone};

    fn test_user(name: &str) -> User {
        let mut account = CloudAccount::default();
        account
            .subnet_ids
            .insert(Zone::from("us-west-1a"), "subnet-a".into());
        account
            .ssh_keys
            .insert(Region::from("us-west-1"), "key-west".into());
        User {
            id: 0,
            name: name.to_string(),
            account,
        }
    }

    #[test]
    fn open_in_memory() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_users().unwrap().is_empty());
        assert!(store.get_framework_id().unwrap().is_none());
    }

    #[test]
    fn user_crud() {
        let store = StateStore::open_in_memory().unwrap();
        let alice = store.put_user(&test_user("alice")).unwrap();
        let bob = store.put_user(&test_user("bob")).unwrap();
        assert_eq!(alice.id, 1);
        assert_eq!(bob.id, 2);

        let fetched = store.get_user(alice.id).unwrap().unwrap();
        assert_eq!(fetched, alice);
        assert_eq!(
            fetched.account.subnet(&Zone::from("us-west-1a")),
            Some("subnet-a")
        );
        assert!(store.get_user(99).unwrap().is_none());
        assert!(matches!(
            store.require_user(99),
            Err(StateError::NotFound(_))
        ));
        assert_eq!(store.list_users().unwrap().len(), 2);
    }

    #[test]
    fn framework_id_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        store.set_framework_id("fw-123").unwrap();
        assert_eq!(store.get_framework_id().unwrap().as_deref(), Some("fw-123"));
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotgrid.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_user(&test_user("carol")).unwrap();
            store.set_framework_id("fw-persist").unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_users().unwrap()[0].name, "carol");
        assert_eq!(
            store.get_framework_id().unwrap().as_deref(),
            Some("fw-persist")
        );
        // Counters persist too: the next user does not reuse id 1.
        assert_eq!(store.put_user(&test_user("dave")).unwrap().id, 2);
    }
}
