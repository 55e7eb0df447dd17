//! Window producer for deltification
//!
//! Reads source and target text in lockstep windows and emits one delta
//! window per target chunk. Matching is prefix/suffix against the aligned
//! source chunk, which captures the common cases (appends, localized edits)
//! cheaply; unmatched bytes travel as new data.

use md5::{Digest, Md5};

use crate::delta::window::{Op, OpKind, Window};
use crate::delta::WINDOW_SIZE;
use crate::error::Result;
use crate::rep::MD5_DIGEST_SIZE;

/// Fill `buf` from `read`, stopping early only at end of stream.
fn read_full(
    read: &mut impl FnMut(&mut [u8]) -> Result<usize>,
    buf: &mut [u8],
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Build one window turning `source` into `target`, both being the aligned
/// chunk starting at absolute offset `offset`.
fn build_window(offset: u64, source: &[u8], target: &[u8]) -> Window {
    let max_match = source.len().min(target.len());
    let prefix = source
        .iter()
        .zip(target)
        .take_while(|(s, t)| s == t)
        .count();
    let mut suffix = 0;
    while suffix < max_match - prefix
        && source[source.len() - 1 - suffix] == target[target.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut ops = Vec::new();
    let mut new_data = Vec::new();
    if prefix > 0 {
        ops.push(Op { kind: OpKind::Source, offset: 0, len: prefix });
    }
    let middle = &target[prefix..target.len() - suffix];
    if !middle.is_empty() {
        ops.push(Op { kind: OpKind::New, offset: 0, len: middle.len() });
        new_data.extend_from_slice(middle);
    }
    if suffix > 0 {
        ops.push(Op {
            kind: OpKind::Source,
            offset: source.len() - suffix,
            len: suffix,
        });
    }

    let src_ops = Window::count_src_ops(&ops);
    let (sview_offset, sview_len) = if src_ops == 0 {
        (offset, 0)
    } else {
        (offset, source.len())
    };
    Window {
        sview_offset,
        sview_len,
        tview_len: target.len(),
        src_ops,
        ops,
        new_data,
    }
}

/// Pull-based stream of delta windows turning a source text into a target
/// text, with a running digest of the target
pub struct DeltaStream<S, T>
where
    S: FnMut(&mut [u8]) -> Result<usize>,
    T: FnMut(&mut [u8]) -> Result<usize>,
{
    source: S,
    target: T,
    offset: u64,
    md5: Md5,
    digest: Option<[u8; MD5_DIGEST_SIZE]>,
    done: bool,
}

impl<S, T> DeltaStream<S, T>
where
    S: FnMut(&mut [u8]) -> Result<usize>,
    T: FnMut(&mut [u8]) -> Result<usize>,
{
    pub fn new(source: S, target: T) -> Self {
        Self {
            source,
            target,
            offset: 0,
            md5: Md5::new(),
            digest: None,
            done: false,
        }
    }

    /// Produce the next window, or `None` once the target is exhausted.
    pub fn next_window(&mut self) -> Result<Option<Window>> {
        if self.done {
            return Ok(None);
        }
        let mut sbuf = vec![0u8; WINDOW_SIZE];
        let mut tbuf = vec![0u8; WINDOW_SIZE];
        let slen = read_full(&mut self.source, &mut sbuf)?;
        let tlen = read_full(&mut self.target, &mut tbuf)?;
        if tlen == 0 {
            self.done = true;
            self.digest = Some(self.md5.clone().finalize().into());
            return Ok(None);
        }
        self.md5.update(&tbuf[..tlen]);
        let window = build_window(self.offset, &sbuf[..slen], &tbuf[..tlen]);
        self.offset += tlen as u64;
        Ok(Some(window))
    }

    /// Digest of the target text; available only after the stream returned
    /// its final `None`.
    pub fn md5_digest(&self) -> Option<[u8; MD5_DIGEST_SIZE]> {
        self.digest
    }
}
