//! Reading representations and the representation lifecycle
//!
//! The range reader serves random-access reads over any representation.
//! Fulltext reps delegate straight to the strings table; delta reps walk the
//! chain, fold one window per link into a single combined window, and apply
//! it to a slice of the terminal fulltext.

use bytes::Bytes;
use md5::{Digest, Md5};

use crate::delta::compose::{compose_windows, ComposeCtx};
use crate::delta::svndiff;
use crate::delta::window::{apply_window, Window};
use crate::error::{FsError, Result};
use crate::fs::Trail;
use crate::rep::{
    digests_match, DeltaChunk, RepContents, RepKey, Representation, StringKey, TxnId,
    MD5_DIGEST_SIZE, ZERO_MD5,
};

/// Read granularity for stored diff payloads.
const DIFF_HUNK_SIZE: usize = 4096;

/// Return `base` if it is mutable under `txn_id`; otherwise allocate a fresh
/// empty fulltext rep owned by `txn_id` and return its key.
pub fn get_mutable_rep(
    trail: &Trail<'_>,
    base: Option<&RepKey>,
    txn_id: &TxnId,
) -> Result<RepKey> {
    if let Some(key) = base {
        let rep = trail.read_rep(key)?;
        if rep.is_mutable(txn_id) {
            return Ok(key.clone());
        }
    }

    let string_key = trail.string_append(None, b"")?;
    let rep = Representation::fulltext(string_key, Some(txn_id.clone()), Some(ZERO_MD5));
    trail.write_new_rep(&rep)
}

/// Delete `rep_key` and the strings it owns iff it is mutable under
/// `txn_id`; a no-op otherwise. Transaction-abort cleanup.
pub fn delete_rep_if_mutable(trail: &Trail<'_>, rep_key: &RepKey, txn_id: &TxnId) -> Result<()> {
    let rep = trail.read_rep(rep_key)?;
    if !rep.is_mutable(txn_id) {
        return Ok(());
    }

    match &rep.contents {
        RepContents::Fulltext { string_key } => trail.string_delete(string_key)?,
        RepContents::Delta { .. } => {
            for key in rep.delta_string_keys()? {
                trail.string_delete(&key)?;
            }
        }
    }
    trail.delete_rep(rep_key)
}

/// Length of the reconstructed content of `rep_key`.
pub fn rep_contents_size(trail: &Trail<'_>, rep_key: &RepKey) -> Result<u64> {
    let rep = trail.read_rep(rep_key)?;
    match &rep.contents {
        RepContents::Fulltext { string_key } => trail.string_size(string_key),
        RepContents::Delta { chunks } => {
            // Size falls out of the ordering invariant: the last chunk ends
            // the fulltext.
            let last = chunks.last().ok_or_else(|| {
                FsError::Corrupt(format!("delta representation `{rep_key}` has no chunks"))
            })?;
            Ok(last.offset + last.size)
        }
    }
}

/// Stored content digest of `rep_key`.
pub fn rep_contents_checksum(
    trail: &Trail<'_>,
    rep_key: &RepKey,
) -> Result<[u8; MD5_DIGEST_SIZE]> {
    Ok(trail.read_rep(rep_key)?.checksum)
}

/// Reconstruct the whole content of `rep_key` and verify it against the
/// stored digest.
pub fn rep_contents(trail: &Trail<'_>, rep_key: &RepKey) -> Result<Bytes> {
    let size = rep_contents_size(trail, rep_key)?;
    let len = usize::try_from(size).map_err(|_| {
        FsError::General(format!(
            "contents of representation `{rep_key}` are too large for one buffer ({size} bytes)"
        ))
    })?;

    let mut data = vec![0u8; len];
    let read = read_range(trail, rep_key, 0, &mut data)?;
    if read != len {
        return Err(FsError::Corrupt(format!(
            "failure reading representation `{rep_key}`: got {read} of {len} bytes"
        )));
    }

    let mut md5 = Md5::new();
    md5.update(&data);
    let digest: [u8; MD5_DIGEST_SIZE] = md5.finalize().into();
    let rep = trail.read_rep(rep_key)?;
    if !digests_match(&digest, &rep.checksum) {
        return Err(checksum_mismatch(rep_key, &rep.checksum, &digest));
    }

    Ok(Bytes::from(data))
}

/// Build the corruption error for a content digest mismatch.
pub(crate) fn checksum_mismatch(
    rep_key: &RepKey,
    expected: &[u8; MD5_DIGEST_SIZE],
    actual: &[u8; MD5_DIGEST_SIZE],
) -> FsError {
    FsError::Corrupt(format!(
        "checksum mismatch on representation `{rep_key}`: expected {}, actual {}",
        hex::encode(expected),
        hex::encode(actual)
    ))
}

/// Clear the contents of the mutable rep `rep_key` so it represents the
/// empty string.
pub fn rep_contents_clear(trail: &Trail<'_>, rep_key: &RepKey, txn_id: &TxnId) -> Result<()> {
    let mut rep = trail.read_rep(rep_key)?;
    if !rep.is_mutable(txn_id) {
        return Err(FsError::RepNotMutable(rep_key.clone()));
    }

    // Mutable reps are created fulltext and must stay that way.
    let string_key = match &rep.contents {
        RepContents::Fulltext { string_key } => string_key.clone(),
        RepContents::Delta { .. } => {
            return Err(FsError::Corrupt(format!(
                "representation `{rep_key}` is both mutable and non-fulltext"
            )))
        }
    };

    trail.string_clear(&string_key)?;
    rep.checksum = crate::rep::EMPTY_MD5;
    trail.write_rep(rep_key, &rep)
}

/// Locate the chunk whose target range contains `offset`.
///
/// Returns the chunk index and the offset within that chunk, or `None` when
/// `offset` lies past the end of the represented data. Linear scan; chunk
/// counts stay small.
fn chunk_offset(
    rep_key: &RepKey,
    chunks: &[DeltaChunk],
    offset: u64,
) -> Result<Option<(usize, usize)>> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.size == 0 {
            return Err(FsError::Corrupt(format!(
                "representation `{rep_key}` has an empty chunk at offset {}",
                chunk.offset
            )));
        }
        if chunk.offset + chunk.size > offset {
            if chunk.offset > offset {
                return Err(FsError::Corrupt(format!(
                    "chunks of representation `{rep_key}` are not contiguous"
                )));
            }
            return Ok(Some((i, (offset - chunk.offset) as usize)));
        }
    }
    Ok(None)
}

/// Folds one window per chain link into a single combined window.
struct Composer {
    window: Option<Window>,
    /// Set once further composition cannot change the result.
    done: bool,
    /// Set between links; distinguishes the parser's end-of-stream marker
    /// (ignored) from a genuinely missing window (terminates composition).
    init: bool,
}

impl Composer {
    fn new() -> Self {
        Self {
            window: None,
            done: false,
            init: false,
        }
    }

    /// Mark the start of the next link's window stream.
    fn begin(&mut self) {
        self.init = true;
    }

    fn feed(&mut self, incoming: Option<Window>) -> Result<()> {
        if !self.init && incoming.is_none() {
            return Ok(());
        }
        self.init = false;

        let Some(incoming) = incoming else {
            self.done = true;
            return Ok(());
        };

        match self.window.take() {
            None => {
                self.done = incoming.sview_len == 0 || incoming.src_ops == 0;
                self.window = Some(incoming);
            }
            Some(combined) => {
                let mut ctx = ComposeCtx::default();
                match compose_windows(&incoming, &combined, &mut ctx)? {
                    Some(next) => self.window = Some(next),
                    None => {
                        if !ctx.use_second {
                            return Err(FsError::Corrupt(
                                "window composition produced no window".to_string(),
                            ));
                        }
                        // The combined window never touches source data; it
                        // stands, rebased onto the incoming link's source.
                        let mut kept = combined;
                        kept.sview_offset = ctx.sview_offset;
                        kept.sview_len = ctx.sview_len;
                        self.window = Some(kept);
                        self.done = true;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Stream the stored diff payload of `chunk`, re-synthesizing the stream
/// header, and feed the parsed windows to `composer`.
fn feed_one_window(
    trail: &Trail<'_>,
    chunk: &DeltaChunk,
    version: u8,
    composer: &mut Composer,
) -> Result<()> {
    composer.begin();

    let mut raw = Vec::with_capacity(DIFF_HUNK_SIZE + 4);
    raw.extend_from_slice(&svndiff::SVNDIFF_MAGIC);
    raw.push(version);

    let mut offset = 0u64;
    let mut hunk = [0u8; DIFF_HUNK_SIZE];
    loop {
        let n = trail.string_read(&chunk.string_key, offset, &mut hunk)?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&hunk[..n]);
        offset += n as u64;
    }

    let (_, windows) = svndiff::parse(&raw)?;
    for window in windows {
        composer.feed(Some(window))?;
    }
    composer.feed(None)
}

/// The chain of delta records contributing one chunk's window each, plus the
/// terminal fulltext string when the chain reaches one.
struct Chain {
    deltas: Vec<Representation>,
    fulltext: Option<StringKey>,
}

/// Walk the chain from `rep` at chunk index `cur`, collecting every delta
/// record that still has a chunk at that index.
///
/// A link whose chain is shorter than `cur + 1` chunks predates the data and
/// contributes no source; the walk stops there without a fulltext.
fn collect_chain(
    trail: &Trail<'_>,
    rep_key: &RepKey,
    rep: &Representation,
    cur: usize,
) -> Result<Chain> {
    let mut deltas = Vec::new();
    let mut fulltext = None;
    let mut walked = vec![rep_key.clone()];

    let mut key = check_chunk_versions(rep_key, rep, cur)?;
    deltas.push(rep.clone());

    loop {
        if walked.contains(&key) {
            return Err(FsError::Corrupt(format!(
                "delta chain of representation `{rep_key}` revisits `{key}`"
            )));
        }
        walked.push(key.clone());

        let next = trail.read_rep(&key)?;
        match &next.contents {
            RepContents::Fulltext { string_key } => {
                fulltext = Some(string_key.clone());
                break;
            }
            RepContents::Delta { chunks } if chunks.len() > cur => {
                let follow = check_chunk_versions(&key, &next, cur)?;
                deltas.push(next);
                key = follow;
            }
            RepContents::Delta { .. } => break,
        }
    }

    Ok(Chain { deltas, fulltext })
}

/// Verify that chunk `cur` of `rep` matches the first chunk's diff version,
/// and return the source key it deltas against.
fn check_chunk_versions(rep_key: &RepKey, rep: &Representation, cur: usize) -> Result<RepKey> {
    let RepContents::Delta { chunks } = &rep.contents else {
        return Err(FsError::Corrupt(format!(
            "representation `{rep_key}` is not a delta"
        )));
    };
    let chunk = &chunks[cur];
    if chunk.version != chunks[0].version {
        return Err(FsError::Corrupt(format!(
            "diff version inconsistencies in representation `{rep_key}`"
        )));
    }
    Ok(chunk.rep_key.clone())
}

/// Reconstruct one chunk's worth of target text into `out`.
///
/// `skip` is the caller's offset within the chunk; the bytes before it are
/// produced into a scratch buffer and discarded. Returns the bytes written
/// to `out`.
fn undeltify_chunk(
    trail: &Trail<'_>,
    rep_key: &RepKey,
    rep: &Representation,
    cur: usize,
    skip: usize,
    out: &mut [u8],
) -> Result<usize> {
    let chain = collect_chain(trail, rep_key, rep, cur)?;

    let mut composer = Composer::new();
    for link in &chain.deltas {
        if composer.done {
            break;
        }
        let RepContents::Delta { chunks } = &link.contents else {
            unreachable!("collected chain links are deltas");
        };
        feed_one_window(trail, &chunks[cur], chunks[0].version, &mut composer)?;
    }

    let Some(window) = composer.window.take() else {
        // No window at all: no more data in this chain.
        return Ok(0);
    };

    // The combined window's source view addresses the terminal fulltext.
    let source = match &chain.fulltext {
        Some(string_key) if window.sview_len > 0 && window.src_ops > 0 => {
            let mut buf = vec![0u8; window.sview_len];
            let n = trail.string_read(string_key, window.sview_offset, &mut buf)?;
            if n != window.sview_len {
                return Err(FsError::Corrupt(format!(
                    "short source read for representation `{rep_key}`: got {n} of {} bytes",
                    window.sview_len
                )));
            }
            buf
        }
        _ => Vec::new(),
    };

    if skip > 0 {
        let mut scratch = vec![0u8; out.len() + skip];
        let produced = apply_window(&window, &source, &mut scratch)?;
        if produced <= skip {
            return Err(FsError::Corrupt(format!(
                "window of representation `{rep_key}` ends inside its own chunk"
            )));
        }
        let n = produced - skip;
        out[..n].copy_from_slice(&scratch[skip..produced]);
        Ok(n)
    } else {
        apply_window(&window, &source, out)
    }
}

/// Copy up to `buf.len()` bytes of reconstructed fulltext starting at
/// `offset` into `buf`. Returns the bytes copied; zero signals end of
/// content.
pub fn read_range(
    trail: &Trail<'_>,
    rep_key: &RepKey,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let mut written = 0usize;
    let mut pos = offset;

    while written < buf.len() {
        // Re-fetch the record for every chunk: a concurrent deltification
        // may swap the rep's shape mid-read, and content is only guaranteed
        // stable across shape changes, not the record itself.
        let rep = trail.read_rep(rep_key)?;
        match &rep.contents {
            RepContents::Fulltext { string_key } => {
                written += trail.string_read(string_key, pos, &mut buf[written..])?;
                break;
            }
            RepContents::Delta { chunks } => {
                let Some((cur, skip)) = chunk_offset(rep_key, chunks, pos)? else {
                    break;
                };
                let n = undeltify_chunk(trail, rep_key, &rep, cur, skip, &mut buf[written..])?;
                if n == 0 {
                    break;
                }
                written += n;
                pos += n as u64;
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Fs;
    use crate::rep::EMPTY_MD5;

    fn chunk(offset: u64, size: u64) -> DeltaChunk {
        DeltaChunk {
            offset,
            size,
            version: 0,
            string_key: StringKey::new("s"),
            rep_key: RepKey::new("r"),
            checksum: ZERO_MD5,
        }
    }

    #[test]
    fn test_chunk_offset_locates_and_localizes() {
        let key = RepKey::new("x");
        let chunks = vec![chunk(0, 100), chunk(100, 100), chunk(200, 50)];
        assert_eq!(chunk_offset(&key, &chunks, 0).unwrap(), Some((0, 0)));
        assert_eq!(chunk_offset(&key, &chunks, 99).unwrap(), Some((0, 99)));
        assert_eq!(chunk_offset(&key, &chunks, 100).unwrap(), Some((1, 0)));
        assert_eq!(chunk_offset(&key, &chunks, 249).unwrap(), Some((2, 49)));
        assert_eq!(chunk_offset(&key, &chunks, 250).unwrap(), None);
        assert_eq!(chunk_offset(&key, &chunks, 1000).unwrap(), None);
    }

    #[test]
    fn test_chunk_offset_rejects_empty_chunk() {
        let key = RepKey::new("x");
        let chunks = vec![chunk(0, 100), chunk(100, 0)];
        assert!(chunk_offset(&key, &chunks, 150).is_err());
    }

    #[test]
    fn test_get_mutable_rep_reuses_own_rep() {
        let fs = Fs::open_in_memory();
        let txn = TxnId::new("t1");
        let key = fs.get_mutable_rep(None, &txn).unwrap();
        let again = fs.get_mutable_rep(Some(&key), &txn).unwrap();
        assert_eq!(key, again);

        // A different transaction gets a fresh rep.
        let other = fs.get_mutable_rep(Some(&key), &TxnId::new("t2")).unwrap();
        assert_ne!(key, other);
    }

    #[test]
    fn test_fresh_mutable_rep_is_empty_fulltext() {
        let fs = Fs::open_in_memory();
        let txn = TxnId::new("t1");
        let key = fs.get_mutable_rep(None, &txn).unwrap();
        assert_eq!(fs.rep_contents_size(&key).unwrap(), 0);
        assert_eq!(fs.rep_contents_checksum(&key).unwrap(), ZERO_MD5);
        assert_eq!(fs.rep_contents(&key).unwrap().as_ref(), b"");
    }

    #[test]
    fn test_delete_rep_if_mutable_respects_owner() {
        let fs = Fs::open_in_memory();
        let txn = TxnId::new("t1");
        let key = fs.get_mutable_rep(None, &txn).unwrap();

        // Wrong transaction: no-op.
        fs.delete_rep_if_mutable(&key, &TxnId::new("t2")).unwrap();
        assert!(fs.rep_contents_size(&key).is_ok());

        fs.delete_rep_if_mutable(&key, &txn).unwrap();
        assert!(matches!(
            fs.rep_contents_size(&key),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_clear_requires_mutability() {
        let fs = Fs::open_in_memory();
        let txn = TxnId::new("t1");
        let key = fs.get_mutable_rep(None, &txn).unwrap();

        let err = fs
            .retry(|t| rep_contents_clear(t, &key, &TxnId::new("t2")))
            .unwrap_err();
        assert!(matches!(err, FsError::RepNotMutable(_)));

        fs.retry(|t| {
            t.string_append(
                Some(&match t.read_rep(&key)?.contents {
                    RepContents::Fulltext { string_key } => string_key,
                    _ => unreachable!(),
                }),
                b"data",
            )?;
            rep_contents_clear(t, &key, &txn)
        })
        .unwrap();
        assert_eq!(fs.rep_contents_size(&key).unwrap(), 0);
        assert_eq!(fs.rep_contents_checksum(&key).unwrap(), EMPTY_MD5);
    }
}
