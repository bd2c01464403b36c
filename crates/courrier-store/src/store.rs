//! Key-value blob persistence of the projected state.

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

/// The top-level namespaces the projection persists. Everything else
/// (protocol client info, task tables) is rebuilt at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Messenger,
    Settings,
    Groups,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Messenger, Namespace::Settings, Namespace::Groups];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Messenger => "messenger",
            Namespace::Settings => "settings",
            Namespace::Groups => "groups",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blob store over the declared namespaces.
///
/// Implementations must be callable from the dispatcher task; writes are
/// small (one JSON blob per namespace) and synchronous.
pub trait StateStore: Send + Sync {
    fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>>;
    fn save(&self, namespace: Namespace, blob: &[u8]) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl StateStore for SqliteStore {
    fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().expect("store lock");
        let mut stmt = db
            .conn()
            .prepare("SELECT data FROM namespaces WHERE name = ?1")?;
        let mut rows = stmt.query(params![namespace.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn save(&self, namespace: Namespace, blob: &[u8]) -> Result<()> {
        let db = self.db.lock().expect("store lock");
        db.conn().execute(
            "INSERT INTO namespaces (name, data) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET data = excluded.data",
            params![namespace.as_str(), blob],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let db = self.db.lock().expect("store lock");
        db.conn().execute("DELETE FROM namespaces", [])?;
        tracing::info!("persisted namespaces cleared");
        Ok(())
    }
}

/// In-memory store used by tests.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<Namespace, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, namespace: Namespace) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().expect("store lock").get(&namespace).cloned())
    }

    fn save(&self, namespace: Namespace, blob: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .expect("store lock")
            .insert(namespace, blob.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.blobs.lock().expect("store lock").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("s.db")).unwrap();
        let store = SqliteStore::new(db);

        assert!(store.load(Namespace::Messenger).unwrap().is_none());

        store.save(Namespace::Messenger, b"{\"a\":1}").unwrap();
        store.save(Namespace::Messenger, b"{\"a\":2}").unwrap();
        assert_eq!(
            store.load(Namespace::Messenger).unwrap().as_deref(),
            Some(&b"{\"a\":2}"[..])
        );

        store.clear().unwrap();
        assert!(store.load(Namespace::Messenger).unwrap().is_none());
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = MemoryStore::new();
        store.save(Namespace::Groups, b"g").unwrap();
        assert!(store.load(Namespace::Settings).unwrap().is_none());
        assert_eq!(store.load(Namespace::Groups).unwrap().as_deref(), Some(&b"g"[..]));
    }
}
