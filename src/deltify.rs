//! Deltified storage
//!
//! Converts a representation in place: `rep_deltify` replaces a rep's
//! contents with a chain of diff windows against a source rep, and
//! `rep_undeltify` materializes a delta rep back into a fulltext. Both
//! preserve the reconstructed content and the stored checksum, and both
//! release the strings the old shape owned.

use md5::{Digest, Md5};
use tracing::debug;

use crate::content;
use crate::delta::svndiff::SvndiffEmitter;
use crate::delta::{DeltaStream, SVNDIFF_VERSION, WINDOW_SIZE};
use crate::error::{FsError, Result};
use crate::fs::Trail;
use crate::rep::{
    digests_match, DeltaChunk, RepContents, RepKey, Representation, StringKey, MD5_DIGEST_SIZE,
};
use crate::stream::ReadStream;

/// Writes diff data into one string per window, stripping the 4-byte stream
/// header and capturing the version byte it carries.
struct WindowStringsWriter<'a, 'b> {
    trail: &'a Trail<'b>,
    /// Key of the string in progress; `None` until the first append.
    key: Option<StringKey>,
    /// Bytes written to the current string, header bytes included.
    size: usize,
    header_read: usize,
    version: u8,
}

impl<'a, 'b> WindowStringsWriter<'a, 'b> {
    fn new(trail: &'a Trail<'b>) -> Self {
        Self {
            trail,
            key: None,
            size: 0,
            header_read: 0,
            version: 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let total = data.len();
        let mut payload = data;
        if self.header_read < 4 {
            let n = (4 - self.header_read).min(payload.len());
            self.header_read += n;
            if self.header_read == 4 {
                self.version = payload[n - 1];
            }
            payload = &payload[n..];
        }
        let key = self.trail.string_append(self.key.as_ref(), payload)?;
        self.key = Some(key);
        self.size += total;
        Ok(())
    }

    /// Reset per-window accounting so the next window opens a new string.
    fn next_window(&mut self) {
        self.key = None;
        self.size = 0;
    }
}

/// Bookkeeping for one window written during deltification.
struct WindowWrite {
    key: StringKey,
    /// Serialized diff bytes this window contributed.
    diff_len: u64,
    /// Offset of the target fulltext run this window represents.
    text_offset: u64,
    /// Length of that target run.
    text_len: u64,
}

/// Replace the contents of `target` with a delta chain against `source`.
///
/// When `target` is currently a fulltext, the swap only happens if the diff
/// is strictly smaller than the fulltext; replacing an existing delta is
/// unconditional (a time optimization, not a space one).
pub fn rep_deltify(trail: &Trail<'_>, target: &RepKey, source: &RepKey) -> Result<()> {
    // A rep deltified against itself would leave no fulltext reachable
    // anywhere in the chain.
    if target == source {
        return Err(FsError::Corrupt(format!(
            "attempt to deltify `{target}` against itself"
        )));
    }

    let mut source_stream = ReadStream::open(trail, Some(source))?;
    let mut target_stream = ReadStream::open(trail, Some(target))?;
    let mut delta_stream = DeltaStream::new(
        |buf: &mut [u8]| source_stream.read(trail, buf),
        |buf: &mut [u8]| target_stream.read(trail, buf),
    );

    let mut writer = WindowStringsWriter::new(trail);
    let mut emitter = SvndiffEmitter::new(SVNDIFF_VERSION);
    let mut windows: Vec<WindowWrite> = Vec::new();
    let mut text_offset = 0u64;
    let mut diff_size = 0u64;

    while let Some(window) = delta_stream.next_window()? {
        writer.next_window();
        emitter.emit(&window, &mut |bytes| writer.write(bytes))?;
        let key = writer.key.clone().ok_or_else(|| {
            FsError::General("deltification produced a window with no string key".to_string())
        })?;
        let write = WindowWrite {
            key,
            diff_len: writer.size as u64,
            text_offset,
            text_len: window.tview_len as u64,
        };
        text_offset += write.text_len;
        diff_size += write.diff_len;
        windows.push(write);
    }

    let digest = delta_stream.md5_digest().ok_or_else(|| {
        FsError::ChecksumAbsent(format!("failed to calculate MD5 digest for `{source}`"))
    })?;

    if windows.is_empty() {
        // Empty target: nothing to replace.
        return Ok(());
    }

    let old_rep = trail.read_rep(target)?;
    if !digests_match(&digest, &old_rep.checksum) {
        return Err(content::checksum_mismatch(target, &old_rep.checksum, &digest));
    }

    let orig_keys: Vec<StringKey> = match &old_rep.contents {
        RepContents::Fulltext { string_key } => {
            let old_size = trail.string_size(string_key)?;
            if diff_size >= old_size {
                debug!(%target, %source, diff_size, old_size, "diff not smaller, keeping fulltext");
                for write in &windows {
                    trail.string_delete(&write.key)?;
                }
                return Ok(());
            }
            vec![string_key.clone()]
        }
        RepContents::Delta { .. } => old_rep.delta_string_keys()?,
    };

    let chunks: Vec<DeltaChunk> = windows
        .iter()
        .map(|write| DeltaChunk {
            offset: write.text_offset,
            size: write.text_len,
            version: writer.version,
            string_key: write.key.clone(),
            rep_key: source.clone(),
            checksum: digest,
        })
        .collect();
    let new_rep = Representation {
        txn_id: None,
        // The fulltext digest survives deltification unchanged.
        checksum: old_rep.checksum,
        contents: RepContents::Delta { chunks },
    };

    trail.write_rep(target, &new_rep)?;
    for key in &orig_keys {
        trail.string_delete(key)?;
    }

    debug!(%target, %source, windows = windows.len(), diff_size, "deltified representation");
    Ok(())
}

/// Materialize the delta rep at `rep_key` back into a fulltext rep.
/// A no-op when the rep already is a fulltext.
pub fn rep_undeltify(trail: &Trail<'_>, rep_key: &RepKey) -> Result<()> {
    let rep = trail.read_rep(rep_key)?;
    if rep.is_fulltext() {
        return Ok(());
    }
    let orig_keys = rep.delta_string_keys()?;

    let mut md5 = Md5::new();
    let mut reader = ReadStream::open(trail, Some(rep_key))?;
    let mut new_key: Option<StringKey> = None;
    let mut buf = vec![0u8; WINDOW_SIZE];
    loop {
        let n = reader.read(trail, &mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        new_key = Some(trail.string_append(new_key.as_ref(), &buf[..n])?);
    }
    // An empty reconstruction still needs its backing string.
    let new_key = match new_key {
        Some(key) => key,
        None => trail.string_append(None, b"")?,
    };

    let digest: [u8; MD5_DIGEST_SIZE] = md5.finalize().into();
    if !digests_match(&rep.checksum, &digest) {
        return Err(content::checksum_mismatch(rep_key, &rep.checksum, &digest));
    }

    let new_rep = Representation::fulltext(new_key, None, Some(digest));
    trail.write_rep(rep_key, &new_rep)?;
    for key in &orig_keys {
        trail.string_delete(key)?;
    }

    debug!(%rep_key, "undeltified representation");
    Ok(())
}
