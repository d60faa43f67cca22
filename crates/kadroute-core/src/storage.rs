//! Ordered key-value storage
//!
//! The routing table persists two namespaces (`kbuckets` and `nodes`) through
//! this contract. Range queries over bucket boundaries rely on `list`
//! returning keys in ascending byte order.

use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;

/// An ordered key-value namespace
///
/// Implementations are not expected to offer cross-key transactions.
pub trait KeyValueStore: Send {
    /// Get the value stored under `key`, or `Error::NotFound`
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Insert or overwrite `key`
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete `key`; deleting an absent key is not an error
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// List keys `>= start` in ascending byte order, at most `limit` of them
    /// (`0` means no limit)
    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Release the underlying resources
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn not_found(key: &[u8]) -> Error {
    Error::NotFound(format!("key {}", hex::encode(key)))
}

/// In-memory store backed by a BTreeMap
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.entries.get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Vec<u8>>> {
        let start = start.unwrap_or_default().to_vec();
        let keys = self.entries.range(start..).map(|(k, _)| k.clone());
        Ok(if limit == 0 {
            keys.collect()
        } else {
            keys.take(limit).collect()
        })
    }
}

/// SQLite-backed store, one table per namespace
pub struct SqliteStore {
    conn: Option<Connection>,
    namespace: String,
}

impl SqliteStore {
    /// Open or create the namespace `namespace` in the database at `path`
    pub fn open(path: &Path, namespace: &str) -> Result<Self> {
        Self::with_connection(Connection::open(path)?, namespace)
    }

    /// Open a namespace in a private in-memory database
    pub fn open_in_memory(namespace: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> Result<Self> {
        // The namespace is interpolated into SQL below.
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidData(format!(
                "invalid namespace {:?}",
                namespace
            )));
        }

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {namespace} (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            "#
        ))?;

        Ok(Self {
            conn: Some(conn),
            namespace: namespace.to_string(),
        })
    }

    /// Name of the namespace (table) this store writes to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("store {} is closed", self.namespace)))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let value: Option<Vec<u8>> = self
            .conn()?
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?", self.namespace),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        value.ok_or_else(|| not_found(key))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
                self.namespace
            ),
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.conn()?.execute(
            &format!("DELETE FROM {} WHERE key = ?", self.namespace),
            params![key],
        )?;
        Ok(())
    }

    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Vec<u8>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT key FROM {} WHERE key >= ? ORDER BY key LIMIT ?",
            self.namespace
        ))?;

        let start = start.unwrap_or_default();
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let keys = stmt
            .query_map(params![start, limit], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(keys)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        Ok(())
    }
}

/// Store decorator that traces every operation
pub struct LoggingStore<S> {
    inner: S,
    name: &'static str,
}

impl<S: KeyValueStore> LoggingStore<S> {
    pub fn new(name: &'static str, inner: S) -> Self {
        Self { inner, name }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: KeyValueStore> KeyValueStore for LoggingStore<S> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let result = self.inner.get(key);
        tracing::trace!(store = self.name, key = %hex::encode(key), found = result.is_ok(), "get");
        result
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        tracing::trace!(store = self.name, key = %hex::encode(key), len = value.len(), "put");
        self.inner.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        tracing::trace!(store = self.name, key = %hex::encode(key), "delete");
        self.inner.delete(key)
    }

    fn list(&self, start: Option<&[u8]>, limit: usize) -> Result<Vec<Vec<u8>>> {
        let result = self.inner.list(start, limit);
        tracing::trace!(
            store = self.name,
            start = %start.map(hex::encode).unwrap_or_default(),
            limit,
            returned = result.as_ref().map(|k| k.len()).unwrap_or(0),
            "list"
        );
        result
    }

    fn close(&mut self) -> Result<()> {
        tracing::trace!(store = self.name, "close");
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn exercise(store: &mut dyn KeyValueStore) {
        assert!(store.get(b"missing").unwrap_err().is_not_found());

        store.put(&[2, 0], b"b").unwrap();
        store.put(&[1, 255], b"a").unwrap();
        store.put(&[255, 255], b"c").unwrap();
        store.put(&[2, 0], b"b2").unwrap();

        assert_eq!(store.get(&[2, 0]).unwrap(), b"b2");
        assert_eq!(
            store.list(None, 0).unwrap(),
            vec![vec![1, 255], vec![2, 0], vec![255, 255]]
        );
        assert_eq!(store.list(Some(&[2, 0]), 0).unwrap(), vec![vec![2, 0], vec![255, 255]]);
        assert_eq!(store.list(None, 1).unwrap(), vec![vec![1, 255]]);

        store.delete(&[2, 0]).unwrap();
        store.delete(&[9, 9]).unwrap();
        assert!(store.get(&[2, 0]).unwrap_err().is_not_found());
        assert_eq!(store.list(None, 0).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        exercise(&mut store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sqlite_store() {
        let mut store = SqliteStore::open_in_memory("nodes").unwrap();
        exercise(&mut store);
    }

    #[test]
    fn test_logging_store_delegates() {
        let mut store = LoggingStore::new("test", MemoryStore::new());
        exercise(&mut store);
        assert_eq!(store.into_inner().len(), 2);
    }

    #[test]
    fn test_sqlite_namespaces_share_file() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut buckets = SqliteStore::open(temp.path(), "kbuckets").unwrap();
            let mut nodes = SqliteStore::open(temp.path(), "nodes").unwrap();
            buckets.put(&[255], b"t").unwrap();
            nodes.put(&[1], b"n").unwrap();
            buckets.close().unwrap();
            nodes.close().unwrap();
            assert!(nodes.get(&[1]).is_err());
        }

        let buckets = SqliteStore::open(temp.path(), "kbuckets").unwrap();
        let nodes = SqliteStore::open(temp.path(), "nodes").unwrap();
        assert_eq!(buckets.list(None, 0).unwrap(), vec![vec![255]]);
        assert_eq!(nodes.get(&[1]).unwrap(), b"n");
        assert!(buckets.get(&[1]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_sqlite_rejects_bad_namespace() {
        assert!(SqliteStore::open_in_memory("nodes; DROP TABLE x").is_err());
        assert!(SqliteStore::open_in_memory("").is_err());
    }
}
