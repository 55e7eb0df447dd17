//! svndiff wire codec
//!
//! A diff stream is the 4-byte header `"SVN"` + version, then windows. Each
//! window is five varints (source view offset and length, target view
//! length, instruction-section length, new-data length) followed by the
//! instruction section and the new-data section. Instructions carry a 2-bit
//! selector and a 6-bit immediate length (0 means a varint length follows);
//! source and target copies append a varint offset.
//!
//! Varints are base-128, most-significant group first, continuation bit
//! `0x80` on every byte but the last.

use crate::delta::window::{Op, OpKind, Window};
use crate::error::{FsError, Result};

/// Magic bytes opening every diff stream.
pub const SVNDIFF_MAGIC: [u8; 3] = *b"SVN";

/// Wire-format version this crate produces.
pub const SVNDIFF_VERSION: u8 = 0;

/// Longest encoding of a 64-bit varint (ceil(64 / 7)).
const MAX_VARINT_LEN: usize = 10;

/// If these bits are set before a shift, the next `<< 7` would overflow.
const OVERFLOW_MASK: u64 = 0xFE00_0000_0000_0000;

/// Append the varint encoding of `n` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut n: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut i = MAX_VARINT_LEN;
    loop {
        i -= 1;
        buf[i] = (n as u8 & 0x7F) | 0x80;
        n >>= 7;
        if n == 0 {
            break;
        }
    }
    buf[MAX_VARINT_LEN - 1] &= 0x7F;
    out.extend_from_slice(&buf[i..]);
}

/// Decode a varint from `data` starting at `*pos`, advancing `*pos`.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut val: u64 = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| FsError::Corrupt("truncated varint in diff data".to_string()))?;
        *pos += 1;
        if val & OVERFLOW_MASK != 0 {
            return Err(FsError::Corrupt("varint overflow in diff data".to_string()));
        }
        val = (val << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok(val);
        }
    }
}

fn read_len(data: &[u8], pos: &mut usize) -> Result<usize> {
    usize::try_from(read_varint(data, pos)?)
        .map_err(|_| FsError::Corrupt("diff length exceeds address space".to_string()))
}

/// Serialize one window body (no stream header) into `out`.
pub fn write_window(window: &Window, out: &mut Vec<u8>) {
    let mut instructions = Vec::new();
    let mut new_data = Vec::new();
    for op in &window.ops {
        if op.len == 0 {
            continue;
        }
        let selector: u8 = match op.kind {
            OpKind::Source => 0,
            OpKind::Target => 1,
            OpKind::New => 2,
        };
        if op.len < 64 {
            instructions.push((selector << 6) | op.len as u8);
        } else {
            instructions.push(selector << 6);
            write_varint(&mut instructions, op.len as u64);
        }
        match op.kind {
            OpKind::Source | OpKind::Target => {
                write_varint(&mut instructions, op.offset as u64);
            }
            OpKind::New => {
                new_data.extend_from_slice(&window.new_data[op.offset..op.offset + op.len]);
            }
        }
    }

    write_varint(out, window.sview_offset);
    write_varint(out, window.sview_len as u64);
    write_varint(out, window.tview_len as u64);
    write_varint(out, instructions.len() as u64);
    write_varint(out, new_data.len() as u64);
    out.extend_from_slice(&instructions);
    out.extend_from_slice(&new_data);
}

/// Parse one window body from `data` starting at `*pos`, advancing `*pos`.
pub fn read_window(data: &[u8], pos: &mut usize) -> Result<Window> {
    let sview_offset = read_varint(data, pos)?;
    let sview_len = read_len(data, pos)?;
    let tview_len = read_len(data, pos)?;
    let ins_len = read_len(data, pos)?;
    let new_len = read_len(data, pos)?;

    let ins_end = pos
        .checked_add(ins_len)
        .filter(|end| {
            end.checked_add(new_len)
                .is_some_and(|total| total <= data.len())
        })
        .ok_or_else(|| FsError::Corrupt("truncated window in diff data".to_string()))?;

    let mut ops = Vec::new();
    let mut produced = 0usize;
    let mut new_used = 0usize;
    while *pos < ins_end {
        let byte = data[*pos];
        *pos += 1;
        let mut len = (byte & 0x3F) as usize;
        if len == 0 {
            len = read_len(data, pos)?;
        }
        if *pos > ins_end {
            return Err(FsError::Corrupt(
                "window instruction overruns its section".to_string(),
            ));
        }
        let op = match byte >> 6 {
            0 => {
                let offset = read_len(data, pos)?;
                if offset.checked_add(len).map_or(true, |end| end > sview_len) {
                    return Err(FsError::Corrupt(
                        "window instruction exceeds source view".to_string(),
                    ));
                }
                Op { kind: OpKind::Source, offset, len }
            }
            1 => {
                let offset = read_len(data, pos)?;
                if offset >= produced {
                    return Err(FsError::Corrupt(
                        "window instruction reads unproduced target bytes".to_string(),
                    ));
                }
                Op { kind: OpKind::Target, offset, len }
            }
            2 => {
                let op = Op { kind: OpKind::New, offset: new_used, len };
                new_used = new_used.checked_add(len).ok_or_else(|| {
                    FsError::Corrupt("window new-data lengths overflow".to_string())
                })?;
                op
            }
            _ => {
                return Err(FsError::Corrupt(
                    "unknown window instruction selector".to_string(),
                ))
            }
        };
        if *pos > ins_end {
            return Err(FsError::Corrupt(
                "window instruction overruns its section".to_string(),
            ));
        }
        produced = produced.checked_add(op.len).ok_or_else(|| {
            FsError::Corrupt("window instruction lengths overflow".to_string())
        })?;
        ops.push(op);
    }

    if produced != tview_len {
        return Err(FsError::Corrupt(format!(
            "window instructions produce {produced} bytes, target view is {tview_len}"
        )));
    }
    if new_used != new_len {
        return Err(FsError::Corrupt(format!(
            "window instructions consume {new_used} new bytes, section is {new_len}"
        )));
    }

    let new_data = data[ins_end..ins_end + new_len].to_vec();
    *pos = ins_end + new_len;

    let src_ops = Window::count_src_ops(&ops);
    Ok(Window {
        sview_offset,
        sview_len,
        tview_len,
        src_ops,
        ops,
        new_data,
    })
}

/// Parse a full diff stream (header plus windows).
pub fn parse(data: &[u8]) -> Result<(u8, Vec<Window>)> {
    if data.len() < 4 || data[..3] != SVNDIFF_MAGIC {
        return Err(FsError::Corrupt("diff data has no svndiff header".to_string()));
    }
    let version = data[3];
    if version != SVNDIFF_VERSION {
        return Err(FsError::Corrupt(format!(
            "unsupported svndiff version {version}"
        )));
    }
    let mut pos = 4;
    let mut windows = Vec::new();
    while pos < data.len() {
        windows.push(read_window(data, &mut pos)?);
    }
    Ok((version, windows))
}

/// Serializer that prefixes its first window with the stream header
pub struct SvndiffEmitter {
    version: u8,
    header_sent: bool,
}

impl SvndiffEmitter {
    pub fn new(version: u8) -> Self {
        Self {
            version,
            header_sent: false,
        }
    }

    /// Serialize `window`, handing the header and then the window body to
    /// `sink` as separate writes.
    pub fn emit(
        &mut self,
        window: &Window,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        if !self.header_sent {
            let header = [SVNDIFF_MAGIC[0], SVNDIFF_MAGIC[1], SVNDIFF_MAGIC[2], self.version];
            sink(&header)?;
            self.header_sent = true;
        }
        let mut body = Vec::new();
        write_window(window, &mut body);
        sink(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::window::apply_window;

    #[test]
    fn test_varint_roundtrip() {
        for n in [0u64, 1, 63, 64, 127, 128, 300, 102_400, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), n);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_single_byte_below_128() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100);
        assert_eq!(buf, vec![100]);
    }

    fn sample_window() -> Window {
        let ops = vec![
            Op { kind: OpKind::Source, offset: 0, len: 7 },
            Op { kind: OpKind::New, offset: 0, len: 5 },
            Op { kind: OpKind::Target, offset: 2, len: 70 },
        ];
        Window {
            sview_offset: 42,
            sview_len: 12,
            tview_len: 82,
            src_ops: 1,
            ops,
            new_data: b"there".to_vec(),
        }
    }

    #[test]
    fn test_window_roundtrip() {
        let w = sample_window();
        let mut buf = Vec::new();
        write_window(&w, &mut buf);
        let mut pos = 0;
        let back = read_window(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        assert_eq!(back, w);
    }

    #[test]
    fn test_stream_roundtrip_via_emitter() {
        let w = sample_window();
        let mut stream = Vec::new();
        let mut emitter = SvndiffEmitter::new(SVNDIFF_VERSION);
        emitter
            .emit(&w, &mut |bytes| {
                stream.extend_from_slice(bytes);
                Ok(())
            })
            .unwrap();
        emitter
            .emit(&w, &mut |bytes| {
                stream.extend_from_slice(bytes);
                Ok(())
            })
            .unwrap();

        let (version, windows) = parse(&stream).unwrap();
        assert_eq!(version, SVNDIFF_VERSION);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], w);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        assert!(matches!(parse(b"NVS\0"), Err(FsError::Corrupt(_))));
        assert!(matches!(parse(b"SV"), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_parse_rejects_short_instruction_sum() {
        let w = sample_window();
        let mut buf = Vec::new();
        write_window(&w, &mut buf);
        // Bump the declared target view length without touching instructions.
        let mut broken = Vec::new();
        write_varint(&mut broken, w.sview_offset);
        write_varint(&mut broken, w.sview_len as u64);
        write_varint(&mut broken, w.tview_len as u64 + 1);
        let mut pos = 0;
        for _ in 0..3 {
            read_varint(&buf, &mut pos).unwrap();
        }
        broken.extend_from_slice(&buf[pos..]);
        let mut at = 0;
        assert!(matches!(
            read_window(&broken, &mut at),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_parsed_window_applies() {
        let w = sample_window();
        let mut buf = Vec::new();
        write_window(&w, &mut buf);
        let mut pos = 0;
        let back = read_window(&buf, &mut pos).unwrap();

        let source = b"hello, world";
        let mut out = vec![0u8; back.tview_len];
        let n = apply_window(&back, source, &mut out).unwrap();
        assert_eq!(n, 82);
        assert_eq!(&out[..12], b"hello, there");
    }
}
