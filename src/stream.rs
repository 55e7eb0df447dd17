//! Read and write streams over representations
//!
//! Streams layer chunked access and checksum bookkeeping over the range
//! reader and the strings table. Every call takes the trail it should run
//! in; the stream itself carries only position and digest state, so one
//! stream may span several trails.

use md5::{Digest, Md5};

use crate::content;
use crate::error::{FsError, Result};
use crate::fs::Trail;
use crate::rep::{digests_match, RepContents, RepKey, TxnId, MD5_DIGEST_SIZE};

/// Reader over a representation's reconstructed content
///
/// Snapshots the content size at open; the moment the last byte is read the
/// running digest is finalized and verified against the stored checksum.
pub struct ReadStream {
    rep_key: Option<RepKey>,
    offset: u64,
    size: u64,
    md5: Md5,
    finalized: bool,
}

impl ReadStream {
    /// Open a stream over `rep_key`. `None` reads as empty content.
    pub fn open(trail: &Trail<'_>, rep_key: Option<&RepKey>) -> Result<Self> {
        let size = match rep_key {
            Some(key) => content::rep_contents_size(trail, key)?,
            None => 0,
        };
        Ok(Self {
            rep_key: rep_key.cloned(),
            offset: 0,
            size,
            md5: Md5::new(),
            finalized: false,
        })
    }

    /// Length of the content as snapshotted at open.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes. Returns the bytes read; zero signals
    /// end of stream. Repeated reads at end of stream are no-ops.
    pub fn read(&mut self, trail: &Trail<'_>, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(rep_key) = self.rep_key.clone() else {
            if self.offset > 0 {
                return Err(FsError::RepChanged(
                    "representation has no content, but the stream is past offset zero"
                        .to_string(),
                ));
            }
            return Ok(0);
        };

        let n = content::read_range(trail, &rep_key, self.offset, buf)?;
        self.offset += n as u64;

        if self.finalized {
            if n != 0 {
                // The size snapshot was exhausted; new bytes mean the rep
                // was written under this stream.
                return Err(FsError::RepChanged(format!(
                    "representation `{rep_key}` grew while being read"
                )));
            }
            return Ok(0);
        }

        self.md5.update(&buf[..n]);
        if self.offset == self.size {
            // Compare the moment the last byte is seen; a caller reading an
            // exact-length buffer never observes a short read first.
            let digest: [u8; MD5_DIGEST_SIZE] = self.md5.clone().finalize().into();
            self.finalized = true;
            let rep = trail.read_rep(&rep_key)?;
            if !digests_match(&digest, &rep.checksum) {
                return Err(content::checksum_mismatch(&rep_key, &rep.checksum, &digest));
            }
        } else if n == 0 {
            return Err(FsError::RepChanged(format!(
                "representation `{rep_key}` shrank while being read"
            )));
        }

        Ok(n)
    }
}

/// Writer appending to a mutable representation
///
/// Opening the stream clears the rep's current contents; closing it seals
/// the accumulated digest into the rep record.
pub struct WriteStream {
    rep_key: RepKey,
    txn_id: TxnId,
    md5: Md5,
    digest: Option<[u8; MD5_DIGEST_SIZE]>,
}

impl WriteStream {
    /// Open a write stream over `rep_key`, which must be mutable under
    /// `txn_id`. The rep's current contents are cleared.
    pub fn open(trail: &Trail<'_>, rep_key: &RepKey, txn_id: &TxnId) -> Result<Self> {
        // Clearing doubles as the mutability check.
        content::rep_contents_clear(trail, rep_key, txn_id)?;
        Ok(Self {
            rep_key: rep_key.clone(),
            txn_id: txn_id.clone(),
            md5: Md5::new(),
            digest: None,
        })
    }

    /// Append `data` to the rep's backing string.
    pub fn write(&mut self, trail: &Trail<'_>, data: &[u8]) -> Result<()> {
        let rep = trail.read_rep(&self.rep_key)?;
        if !rep.is_mutable(&self.txn_id) {
            return Err(FsError::RepNotMutable(self.rep_key.clone()));
        }
        match &rep.contents {
            RepContents::Fulltext { string_key } => {
                trail.string_append(Some(string_key), data)?;
            }
            RepContents::Delta { .. } => {
                return Err(FsError::Corrupt(format!(
                    "representation `{}` is both mutable and non-fulltext",
                    self.rep_key
                )));
            }
        }
        self.md5.update(data);
        Ok(())
    }

    /// Finalize the digest and seal it into the rep record. Idempotent over
    /// the finalize step.
    pub fn close(&mut self, trail: &Trail<'_>) -> Result<()> {
        let digest = *self
            .digest
            .get_or_insert_with(|| self.md5.clone().finalize().into());
        let mut rep = trail.read_rep(&self.rep_key)?;
        rep.checksum = digest;
        trail.write_rep(&self.rep_key, &rep)
    }
}
