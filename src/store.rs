//! Backing store for strings and representation records
//!
//! Two tables: `strings` maps string keys to raw byte strings, `reps` maps
//! rep keys to serialized representation records. Keys are allocated by the
//! store from a per-table counter kept under a reserved `next-key` record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::error::{FsError, Result};
use crate::rep::{RepKey, Representation, StringKey};

/// Reserved record holding the next allocatable key of a table.
const NEXT_KEY: &str = "next-key";

/// Operations the representation engine consumes from the backing store.
///
/// All methods are synchronous; callers reach them through a trail.
pub trait Store: Send + Sync {
    /// Append `data` to the string at `key`, or to a freshly allocated
    /// string when `key` is `None`. Returns the (possibly new) key.
    /// Appending zero bytes with an absent key still allocates a key.
    fn string_append(&self, key: Option<&StringKey>, data: &[u8]) -> Result<StringKey>;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read; zero signals end-of-string.
    fn string_read(&self, key: &StringKey, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total length of the string at `key`.
    fn string_size(&self, key: &StringKey) -> Result<u64>;

    /// Truncate the string at `key` to empty, preserving the key.
    fn string_clear(&self, key: &StringKey) -> Result<()>;

    /// Remove the string at `key`.
    fn string_delete(&self, key: &StringKey) -> Result<()>;

    /// Load the representation record at `key`.
    fn read_rep(&self, key: &RepKey) -> Result<Representation>;

    /// Store `rep` at `key`, replacing any existing record.
    fn write_rep(&self, key: &RepKey, rep: &Representation) -> Result<()>;

    /// Store `rep` under a freshly allocated key and return it.
    fn write_new_rep(&self, rep: &Representation) -> Result<RepKey>;

    /// Remove the representation record at `key`.
    fn delete_rep(&self, key: &RepKey) -> Result<()>;
}

/// Copy the readable slice of `data` starting at `offset` into `buf`.
fn read_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    if offset >= data.len() as u64 {
        return 0;
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Persistent store over a fjall keyspace
///
/// One partition per table. Durability is batched; call [`FjallStore::persist`]
/// to fsync.
pub struct FjallStore {
    keyspace: Keyspace,
    strings: PartitionHandle,
    reps: PartitionHandle,
}

impl FjallStore {
    /// Open or create a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| FsError::Database(format!("failed to open keyspace: {e}")))?;
        let strings = keyspace
            .open_partition("strings", PartitionCreateOptions::default())
            .map_err(|e| FsError::Database(format!("failed to open strings table: {e}")))?;
        let reps = keyspace
            .open_partition("reps", PartitionCreateOptions::default())
            .map_err(|e| FsError::Database(format!("failed to open reps table: {e}")))?;
        Ok(Self {
            keyspace,
            strings,
            reps,
        })
    }

    /// Flush all pending writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| FsError::Database(format!("failed to persist: {e}")))?;
        Ok(())
    }

    /// Allocate the next key of `table` by bumping its `next-key` record.
    fn allocate_key(table: &PartitionHandle) -> Result<String> {
        let next: u64 = match table.get(NEXT_KEY)? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    FsError::Corrupt("next-key record is not a decimal counter".to_string())
                })?,
            None => 0,
        };
        table.insert(NEXT_KEY, (next + 1).to_string())?;
        Ok(next.to_string())
    }

    fn get_string(&self, key: &StringKey) -> Result<Vec<u8>> {
        self.strings
            .get(key.as_str())?
            .map(|v| v.to_vec())
            .ok_or_else(|| FsError::NotFound(format!("no string `{key}`")))
    }
}

impl Store for FjallStore {
    fn string_append(&self, key: Option<&StringKey>, data: &[u8]) -> Result<StringKey> {
        let key = match key {
            Some(k) => k.clone(),
            None => StringKey::new(Self::allocate_key(&self.strings)?),
        };
        let mut value = self
            .strings
            .get(key.as_str())?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        value.extend_from_slice(data);
        self.strings.insert(key.as_str(), value)?;
        Ok(key)
    }

    fn string_read(&self, key: &StringKey, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let value = self.get_string(key)?;
        Ok(read_at(&value, offset, buf))
    }

    fn string_size(&self, key: &StringKey) -> Result<u64> {
        Ok(self.get_string(key)?.len() as u64)
    }

    fn string_clear(&self, key: &StringKey) -> Result<()> {
        self.get_string(key)?;
        self.strings.insert(key.as_str(), b"")?;
        Ok(())
    }

    fn string_delete(&self, key: &StringKey) -> Result<()> {
        self.get_string(key)?;
        self.strings.remove(key.as_str())?;
        Ok(())
    }

    fn read_rep(&self, key: &RepKey) -> Result<Representation> {
        let raw = self
            .reps
            .get(key.as_str())?
            .ok_or_else(|| FsError::NotFound(format!("no representation `{key}`")))?;
        Representation::from_bytes(&raw)
    }

    fn write_rep(&self, key: &RepKey, rep: &Representation) -> Result<()> {
        self.reps.insert(key.as_str(), rep.to_bytes()?)?;
        Ok(())
    }

    fn write_new_rep(&self, rep: &Representation) -> Result<RepKey> {
        let key = RepKey::new(Self::allocate_key(&self.reps)?);
        self.write_rep(&key, rep)?;
        Ok(key)
    }

    fn delete_rep(&self, key: &RepKey) -> Result<()> {
        if self.reps.get(key.as_str())?.is_none() {
            return Err(FsError::NotFound(format!("no representation `{key}`")));
        }
        self.reps.remove(key.as_str())?;
        Ok(())
    }
}

#[derive(Default)]
struct MemInner {
    strings: HashMap<String, Vec<u8>>,
    reps: HashMap<String, Representation>,
    next_string: u64,
    next_rep: u64,
}

/// In-memory store for tests and embedders
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // A poisoned mutex means a panic mid-write; nothing to salvage.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemStore {
    fn string_append(&self, key: Option<&StringKey>, data: &[u8]) -> Result<StringKey> {
        let mut inner = self.lock();
        let key = match key {
            Some(k) => k.clone(),
            None => {
                let k = StringKey::new(inner.next_string.to_string());
                inner.next_string += 1;
                k
            }
        };
        inner
            .strings
            .entry(key.as_str().to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(key)
    }

    fn string_read(&self, key: &StringKey, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock();
        let value = inner
            .strings
            .get(key.as_str())
            .ok_or_else(|| FsError::NotFound(format!("no string `{key}`")))?;
        Ok(read_at(value, offset, buf))
    }

    fn string_size(&self, key: &StringKey) -> Result<u64> {
        let inner = self.lock();
        inner
            .strings
            .get(key.as_str())
            .map(|v| v.len() as u64)
            .ok_or_else(|| FsError::NotFound(format!("no string `{key}`")))
    }

    fn string_clear(&self, key: &StringKey) -> Result<()> {
        let mut inner = self.lock();
        inner
            .strings
            .get_mut(key.as_str())
            .map(|v| v.clear())
            .ok_or_else(|| FsError::NotFound(format!("no string `{key}`")))
    }

    fn string_delete(&self, key: &StringKey) -> Result<()> {
        let mut inner = self.lock();
        inner
            .strings
            .remove(key.as_str())
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("no string `{key}`")))
    }

    fn read_rep(&self, key: &RepKey) -> Result<Representation> {
        let inner = self.lock();
        inner
            .reps
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("no representation `{key}`")))
    }

    fn write_rep(&self, key: &RepKey, rep: &Representation) -> Result<()> {
        let mut inner = self.lock();
        inner.reps.insert(key.as_str().to_string(), rep.clone());
        Ok(())
    }

    fn write_new_rep(&self, rep: &Representation) -> Result<RepKey> {
        let mut inner = self.lock();
        let key = RepKey::new(inner.next_rep.to_string());
        inner.next_rep += 1;
        inner.reps.insert(key.as_str().to_string(), rep.clone());
        Ok(key)
    }

    fn delete_rep(&self, key: &RepKey) -> Result<()> {
        let mut inner = self.lock();
        inner
            .reps
            .remove(key.as_str())
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("no representation `{key}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rep::Representation;

    fn check_string_contract(store: &dyn Store) {
        // Absent key allocates, even for zero bytes.
        let empty = store.string_append(None, b"").unwrap();
        assert_eq!(store.string_size(&empty).unwrap(), 0);

        let key = store.string_append(None, b"hello").unwrap();
        assert_ne!(key, empty);
        let same = store.string_append(Some(&key), b", world").unwrap();
        assert_eq!(same, key);
        assert_eq!(store.string_size(&key).unwrap(), 12);

        let mut buf = [0u8; 64];
        let n = store.string_read(&key, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, world");

        // Offset reads and end-of-string.
        let n = store.string_read(&key, 7, &mut buf[..3]).unwrap();
        assert_eq!(&buf[..n], b"wor");
        assert_eq!(store.string_read(&key, 12, &mut buf).unwrap(), 0);
        assert_eq!(store.string_read(&key, 100, &mut buf).unwrap(), 0);

        // Clear preserves the key.
        store.string_clear(&key).unwrap();
        assert_eq!(store.string_size(&key).unwrap(), 0);
        store.string_append(Some(&key), b"again").unwrap();
        assert_eq!(store.string_size(&key).unwrap(), 5);

        store.string_delete(&key).unwrap();
        assert!(matches!(
            store.string_size(&key),
            Err(FsError::NotFound(_))
        ));
    }

    fn check_rep_contract(store: &dyn Store) {
        let rep = Representation::fulltext(StringKey::new("1"), None, None);
        let key = store.write_new_rep(&rep).unwrap();
        assert_eq!(store.read_rep(&key).unwrap(), rep);

        let other = Representation::fulltext(StringKey::new("2"), None, None);
        store.write_rep(&key, &other).unwrap();
        assert_eq!(store.read_rep(&key).unwrap(), other);

        store.delete_rep(&key).unwrap();
        assert!(matches!(store.read_rep(&key), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_mem_store_contract() {
        let store = MemStore::new();
        check_string_contract(&store);
        check_rep_contract(&store);
    }

    #[test]
    fn test_fjall_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();
        check_string_contract(&store);
        check_rep_contract(&store);
    }

    #[test]
    fn test_fjall_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key;
        {
            let store = FjallStore::open(dir.path()).unwrap();
            key = store.string_append(None, b"durable").unwrap();
            store.persist().unwrap();
        }
        let store = FjallStore::open(dir.path()).unwrap();
        let mut buf = [0u8; 16];
        let n = store.string_read(&key, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"durable");

        // Key allocation continues past the reopened counter.
        let next = store.string_append(None, b"x").unwrap();
        assert_ne!(next, key);
    }
}
