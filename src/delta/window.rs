//! In-memory delta windows and instruction application

use crate::error::{FsError, Result};

/// Instruction selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Copy from the window's source view
    Source,
    /// Copy from already-produced target bytes
    Target,
    /// Copy from the window's new-data section
    New,
}

/// One instruction of a window
///
/// `offset` is relative to the source view for `Source`, to the start of the
/// produced target for `Target`, and into the new-data section for `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub offset: usize,
    pub len: usize,
}

/// One delta window
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Absolute offset of the source view within the source text
    pub sview_offset: u64,
    /// Length of the source view
    pub sview_len: usize,
    /// Length of the target run this window produces
    pub tview_len: usize,
    /// Number of `Source` instructions
    pub src_ops: usize,
    pub ops: Vec<Op>,
    pub new_data: Vec<u8>,
}

impl Window {
    /// Recount `src_ops` from the instruction stream.
    pub fn count_src_ops(ops: &[Op]) -> usize {
        ops.iter().filter(|op| op.kind == OpKind::Source).count()
    }
}

/// Execute `window`'s instruction stream against `source`, producing up to
/// `out.len()` target bytes. Returns the number of bytes produced, which is
/// the smaller of `out.len()` and the window's target view length.
///
/// Target-copies run forward byte by byte, so an instruction overlapping its
/// own output behaves as a run-length fill.
pub fn apply_window(window: &Window, source: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut tpos = 0usize;
    for op in &window.ops {
        if tpos == out.len() {
            break;
        }
        let len = op.len.min(out.len() - tpos);
        match op.kind {
            OpKind::Source => {
                let end = op.offset + len;
                if end > source.len() {
                    return Err(FsError::Corrupt(format!(
                        "window instruction reads past source view ({} > {})",
                        end,
                        source.len()
                    )));
                }
                out[tpos..tpos + len].copy_from_slice(&source[op.offset..end]);
            }
            OpKind::Target => {
                if op.offset >= tpos {
                    return Err(FsError::Corrupt(
                        "window instruction reads unproduced target bytes".to_string(),
                    ));
                }
                for i in 0..len {
                    out[tpos + i] = out[op.offset + i];
                }
            }
            OpKind::New => {
                let end = op.offset + len;
                if end > window.new_data.len() {
                    return Err(FsError::Corrupt(
                        "window instruction reads past new data".to_string(),
                    ));
                }
                out[tpos..tpos + len].copy_from_slice(&window.new_data[op.offset..end]);
            }
        }
        tpos += len;
    }
    Ok(tpos)
}
