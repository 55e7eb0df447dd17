//! Window composition
//!
//! Folds two windows of adjacent chain links into one window equivalent to
//! applying the older window and then the newer one. The newer window's
//! source view lies within the older window's target view, so every
//! source-copy of the newer window can be rewritten in terms of the older
//! window's instructions.

use crate::delta::window::{Op, OpKind, Window};
use crate::error::{FsError, Result};

/// Out-parameters of a composition that kept the newer window
#[derive(Debug, Default)]
pub struct ComposeCtx {
    pub sview_offset: u64,
    pub sview_len: usize,
    /// Set when the newer window never touches its source: the caller keeps
    /// the newer window but must overwrite its source view from this context.
    pub use_second: bool,
}

/// One run of the older window's target, resolved to either its source view
/// or its new-data section.
#[derive(Debug, Clone, Copy)]
struct Segment {
    kind: OpKind,
    offset: usize,
    len: usize,
}

/// Append the segments covering `[start, start + len)` of the flattened
/// target to `out`, reading only the already-present prefix of `flat`.
fn slice_segments(flat: &[Segment], start: usize, len: usize, out: &mut Vec<Segment>) -> Result<()> {
    let mut pos = 0usize;
    let mut need = len;
    let mut target = start;
    for seg in flat {
        let seg_end = pos + seg.len;
        if seg_end <= target {
            pos = seg_end;
            continue;
        }
        let begin = target - pos;
        let take = (seg.len - begin).min(need);
        out.push(Segment {
            kind: seg.kind,
            offset: seg.offset + begin,
            len: take,
        });
        need -= take;
        target += take;
        pos = seg_end;
        if need == 0 {
            break;
        }
    }
    if need > 0 {
        return Err(FsError::Corrupt(
            "window composition ran out of source segments".to_string(),
        ));
    }
    Ok(())
}

/// Resolve `window`'s instruction stream into a run of source/new segments,
/// expanding target-copies against the already-resolved prefix.
fn flatten(window: &Window) -> Result<Vec<Segment>> {
    let mut flat: Vec<Segment> = Vec::with_capacity(window.ops.len());
    let mut produced = 0usize;
    for op in &window.ops {
        match op.kind {
            OpKind::Source | OpKind::New => {
                flat.push(Segment {
                    kind: op.kind,
                    offset: op.offset,
                    len: op.len,
                });
                produced += op.len;
            }
            OpKind::Target => {
                if op.offset >= produced {
                    return Err(FsError::Corrupt(
                        "window instruction reads unproduced target bytes".to_string(),
                    ));
                }
                let mut pos = op.offset;
                let mut need = op.len;
                while need > 0 {
                    let take = need.min(produced - pos);
                    let mut run = Vec::new();
                    slice_segments(&flat, pos, take, &mut run)?;
                    flat.extend_from_slice(&run);
                    produced += take;
                    pos += take;
                    need -= take;
                }
            }
        }
    }
    Ok(flat)
}

/// Combine `older` and `newer` into a window that reads from `older`'s
/// source and produces `newer`'s target.
///
/// Returns `None` with `ctx.use_second` set when `newer` has no source-copy
/// instructions; `older` is then irrelevant and the caller keeps `newer`
/// after patching its source view from `ctx`.
pub fn compose_windows(
    older: &Window,
    newer: &Window,
    ctx: &mut ComposeCtx,
) -> Result<Option<Window>> {
    if newer.src_ops == 0 {
        ctx.sview_offset = older.sview_offset;
        ctx.sview_len = 0;
        ctx.use_second = true;
        return Ok(None);
    }

    let flat = flatten(older)?;

    let mut ops = Vec::with_capacity(newer.ops.len());
    let mut new_data = Vec::with_capacity(newer.new_data.len());
    for op in &newer.ops {
        match op.kind {
            OpKind::New => {
                let offset = new_data.len();
                new_data.extend_from_slice(&newer.new_data[op.offset..op.offset + op.len]);
                ops.push(Op { kind: OpKind::New, offset, len: op.len });
            }
            OpKind::Target => {
                ops.push(*op);
            }
            OpKind::Source => {
                if op.offset + op.len > older.tview_len {
                    return Err(FsError::Corrupt(
                        "window reads outside the target view it composes against".to_string(),
                    ));
                }
                let mut run = Vec::new();
                slice_segments(&flat, op.offset, op.len, &mut run)?;
                for seg in run {
                    match seg.kind {
                        OpKind::Source => ops.push(Op {
                            kind: OpKind::Source,
                            offset: seg.offset,
                            len: seg.len,
                        }),
                        OpKind::New => {
                            let offset = new_data.len();
                            new_data.extend_from_slice(
                                &older.new_data[seg.offset..seg.offset + seg.len],
                            );
                            ops.push(Op { kind: OpKind::New, offset, len: seg.len });
                        }
                        OpKind::Target => unreachable!("flattened segments have no target copies"),
                    }
                }
            }
        }
    }

    let src_ops = Window::count_src_ops(&ops);
    Ok(Some(Window {
        sview_offset: older.sview_offset,
        sview_len: older.sview_len,
        tview_len: newer.tview_len,
        src_ops,
        ops,
        new_data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::window::apply_window;

    fn apply_all(w: &Window, source: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; w.tview_len];
        let n = apply_window(w, source, &mut out).unwrap();
        assert_eq!(n, w.tview_len);
        out
    }

    fn check_composition(older: &Window, newer: &Window, source: &[u8]) {
        let intermediate = apply_all(older, source);
        let expected = apply_all(newer, &intermediate);

        let mut ctx = ComposeCtx::default();
        let combined = compose_windows(older, newer, &mut ctx)
            .unwrap()
            .expect("composition should produce a window");
        assert_eq!(combined.sview_offset, older.sview_offset);
        assert_eq!(combined.tview_len, newer.tview_len);
        assert_eq!(apply_all(&combined, source), expected);
    }

    #[test]
    fn test_compose_prefix_copy_chains() {
        // older: copy 4 source bytes, append "WX"; newer: copy all 6, append "YZ".
        let older = Window {
            sview_offset: 0,
            sview_len: 4,
            tview_len: 6,
            src_ops: 1,
            ops: vec![
                Op { kind: OpKind::Source, offset: 0, len: 4 },
                Op { kind: OpKind::New, offset: 0, len: 2 },
            ],
            new_data: b"WX".to_vec(),
        };
        let newer = Window {
            sview_offset: 0,
            sview_len: 6,
            tview_len: 8,
            src_ops: 1,
            ops: vec![
                Op { kind: OpKind::Source, offset: 0, len: 6 },
                Op { kind: OpKind::New, offset: 0, len: 2 },
            ],
            new_data: b"YZ".to_vec(),
        };
        check_composition(&older, &newer, b"abcd");
    }

    #[test]
    fn test_compose_through_target_copies() {
        // older produces "ababab" from new data via an overlapping copy.
        let older = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 6,
            src_ops: 0,
            ops: vec![
                Op { kind: OpKind::New, offset: 0, len: 2 },
                Op { kind: OpKind::Target, offset: 0, len: 4 },
            ],
            new_data: b"ab".to_vec(),
        };
        let newer = Window {
            sview_offset: 0,
            sview_len: 6,
            tview_len: 4,
            src_ops: 1,
            ops: vec![
                Op { kind: OpKind::Source, offset: 2, len: 3 },
                Op { kind: OpKind::New, offset: 0, len: 1 },
            ],
            new_data: b"Q".to_vec(),
        };
        check_composition(&older, &newer, b"");
    }

    #[test]
    fn test_compose_scattered_source_reads() {
        let older = Window {
            sview_offset: 10,
            sview_len: 8,
            tview_len: 10,
            src_ops: 2,
            ops: vec![
                Op { kind: OpKind::Source, offset: 4, len: 4 },
                Op { kind: OpKind::New, offset: 0, len: 2 },
                Op { kind: OpKind::Source, offset: 0, len: 4 },
            ],
            new_data: b"--".to_vec(),
        };
        let newer = Window {
            sview_offset: 0,
            sview_len: 10,
            tview_len: 7,
            src_ops: 2,
            ops: vec![
                Op { kind: OpKind::Source, offset: 3, len: 4 },
                Op { kind: OpKind::Source, offset: 0, len: 3 },
            ],
            new_data: Vec::new(),
        };
        check_composition(&older, &newer, b"abcdefgh");
    }

    #[test]
    fn test_compose_keeps_sourceless_newer_window() {
        let older = Window {
            sview_offset: 7,
            sview_len: 3,
            tview_len: 3,
            src_ops: 1,
            ops: vec![Op { kind: OpKind::Source, offset: 0, len: 3 }],
            new_data: Vec::new(),
        };
        let newer = Window {
            sview_offset: 0,
            sview_len: 3,
            tview_len: 2,
            src_ops: 0,
            ops: vec![Op { kind: OpKind::New, offset: 0, len: 2 }],
            new_data: b"hi".to_vec(),
        };
        let mut ctx = ComposeCtx::default();
        let combined = compose_windows(&older, &newer, &mut ctx).unwrap();
        assert!(combined.is_none());
        assert!(ctx.use_second);
        assert_eq!(ctx.sview_offset, 7);
        assert_eq!(ctx.sview_len, 0);
    }

    #[test]
    fn test_compose_rejects_reads_past_older_target() {
        let older = Window {
            sview_offset: 0,
            sview_len: 2,
            tview_len: 2,
            src_ops: 1,
            ops: vec![Op { kind: OpKind::Source, offset: 0, len: 2 }],
            new_data: Vec::new(),
        };
        let newer = Window {
            sview_offset: 0,
            sview_len: 4,
            tview_len: 4,
            src_ops: 1,
            ops: vec![Op { kind: OpKind::Source, offset: 0, len: 4 }],
            new_data: Vec::new(),
        };
        let mut ctx = ComposeCtx::default();
        assert!(matches!(
            compose_windows(&older, &newer, &mut ctx),
            Err(FsError::Corrupt(_))
        ));
    }
}
