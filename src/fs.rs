//! Filesystem handle and trails
//!
//! A [`Trail`] scopes one attempt of a transactional operation: engine code
//! only reaches the backing store through trail methods. [`Fs::retry`] runs a
//! closure against a fresh trail and replays it while the store reports
//! transient failures.

use std::path::Path;

use bytes::Bytes;

use crate::content;
use crate::deltify;
use crate::error::Result;
use crate::rep::{RepKey, Representation, StringKey, TxnId, MD5_DIGEST_SIZE};
use crate::store::{FjallStore, MemStore, Store};

/// Upper bound on replays of a transient failure.
const MAX_ATTEMPTS: usize = 8;

/// Handle to a representation store
pub struct Fs {
    store: Box<dyn Store>,
}

impl Fs {
    /// Open a persistent filesystem rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: Box::new(FjallStore::open(path)?),
        })
    }

    /// Create a filesystem over an in-memory store.
    pub fn open_in_memory() -> Self {
        Self {
            store: Box::new(MemStore::new()),
        }
    }

    /// Create a filesystem over a caller-provided store.
    pub fn with_store(store: Box<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Run `body` inside a trail, replaying it on transient store errors.
    ///
    /// The body must be restartable: it sees a fresh trail on every attempt
    /// and must not keep state from a failed one.
    pub fn retry<T>(&self, mut body: impl FnMut(&Trail<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            let trail = Trail {
                store: self.store.as_ref(),
            };
            match body(&trail) {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => attempt += 1,
                other => return other,
            }
        }
    }

    /// Return `base` if it is mutable under `txn_id`, else create a fresh
    /// empty mutable fulltext rep owned by `txn_id`.
    pub fn get_mutable_rep(&self, base: Option<&RepKey>, txn_id: &TxnId) -> Result<RepKey> {
        self.retry(|t| content::get_mutable_rep(t, base, txn_id))
    }

    /// Delete `rep_key` and its owned strings iff it is mutable under
    /// `txn_id` (transaction-abort cleanup).
    pub fn delete_rep_if_mutable(&self, rep_key: &RepKey, txn_id: &TxnId) -> Result<()> {
        self.retry(|t| content::delete_rep_if_mutable(t, rep_key, txn_id))
    }

    /// Length of the reconstructed content of `rep_key`.
    pub fn rep_contents_size(&self, rep_key: &RepKey) -> Result<u64> {
        self.retry(|t| content::rep_contents_size(t, rep_key))
    }

    /// Stored content digest of `rep_key`.
    pub fn rep_contents_checksum(&self, rep_key: &RepKey) -> Result<[u8; MD5_DIGEST_SIZE]> {
        self.retry(|t| content::rep_contents_checksum(t, rep_key))
    }

    /// Reconstruct and verify the whole content of `rep_key`.
    pub fn rep_contents(&self, rep_key: &RepKey) -> Result<Bytes> {
        self.retry(|t| content::rep_contents(t, rep_key))
    }

    /// Replace the fulltext rep at `target` with a delta against `source`.
    pub fn rep_deltify(&self, target: &RepKey, source: &RepKey) -> Result<()> {
        self.retry(|t| deltify::rep_deltify(t, target, source))
    }

    /// Materialize the delta rep at `rep_key` back into a fulltext rep.
    pub fn rep_undeltify(&self, rep_key: &RepKey) -> Result<()> {
        self.retry(|t| deltify::rep_undeltify(t, rep_key))
    }
}

/// One attempt of a transactional operation against the backing store
pub struct Trail<'a> {
    store: &'a dyn Store,
}

impl Trail<'_> {
    pub fn string_append(&self, key: Option<&StringKey>, data: &[u8]) -> Result<StringKey> {
        self.store.string_append(key, data)
    }

    pub fn string_read(&self, key: &StringKey, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.store.string_read(key, offset, buf)
    }

    pub fn string_size(&self, key: &StringKey) -> Result<u64> {
        self.store.string_size(key)
    }

    pub fn string_clear(&self, key: &StringKey) -> Result<()> {
        self.store.string_clear(key)
    }

    pub fn string_delete(&self, key: &StringKey) -> Result<()> {
        self.store.string_delete(key)
    }

    pub fn read_rep(&self, key: &RepKey) -> Result<Representation> {
        self.store.read_rep(key)
    }

    pub fn write_rep(&self, key: &RepKey, rep: &Representation) -> Result<()> {
        self.store.write_rep(key, rep)
    }

    pub fn write_new_rep(&self, rep: &Representation) -> Result<RepKey> {
        self.store.write_new_rep(rep)
    }

    pub fn delete_rep(&self, key: &RepKey) -> Result<()> {
        self.store.delete_rep(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper that fails the first `failures` string reads with a
    /// transient error.
    struct Flaky {
        inner: MemStore,
        failures: usize,
        seen: AtomicUsize,
    }

    impl Store for Flaky {
        fn string_append(&self, key: Option<&StringKey>, data: &[u8]) -> Result<StringKey> {
            self.inner.string_append(key, data)
        }

        fn string_read(&self, key: &StringKey, offset: u64, buf: &mut [u8]) -> Result<usize> {
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(FsError::Transient("simulated conflict".to_string()));
            }
            self.inner.string_read(key, offset, buf)
        }

        fn string_size(&self, key: &StringKey) -> Result<u64> {
            self.inner.string_size(key)
        }

        fn string_clear(&self, key: &StringKey) -> Result<()> {
            self.inner.string_clear(key)
        }

        fn string_delete(&self, key: &StringKey) -> Result<()> {
            self.inner.string_delete(key)
        }

        fn read_rep(&self, key: &RepKey) -> Result<Representation> {
            self.inner.read_rep(key)
        }

        fn write_rep(&self, key: &RepKey, rep: &Representation) -> Result<()> {
            self.inner.write_rep(key, rep)
        }

        fn write_new_rep(&self, rep: &Representation) -> Result<RepKey> {
            self.inner.write_new_rep(rep)
        }

        fn delete_rep(&self, key: &RepKey) -> Result<()> {
            self.inner.delete_rep(key)
        }
    }

    fn flaky_fs(failures: usize) -> (Fs, StringKey) {
        let inner = MemStore::new();
        let key = inner.string_append(None, b"payload").unwrap();
        let fs = Fs::with_store(Box::new(Flaky {
            inner,
            failures,
            seen: AtomicUsize::new(0),
        }));
        (fs, key)
    }

    #[test]
    fn test_retry_replays_transient_errors() {
        let (fs, key) = flaky_fs(3);
        let mut buf = [0u8; 16];
        let n = fs
            .retry(|t| t.string_read(&key, 0, &mut buf))
            .unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn test_retry_gives_up_eventually() {
        let (fs, key) = flaky_fs(usize::MAX);
        let mut buf = [0u8; 16];
        let err = fs.retry(|t| t.string_read(&key, 0, &mut buf)).unwrap_err();
        assert!(err.is_transient());
    }
}
