//! Chunk alignment for terminal output.
//!
//! PTY reads end at arbitrary byte offsets. [`OutputAligner`] holds back any
//! trailing bytes that would split an ESC sequence or a UTF-8 code point so
//! that every emitted chunk is self-contained.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// A withheld escape tail larger than this is released as-is.
pub const MAX_WITHHELD_ESCAPE: usize = 64 * 1024;

/// Where the escape sequence starting at `start` ends (exclusive), or `None`
/// if the buffer stops before it does.
pub fn escape_end(buf: &[u8], start: usize) -> Option<usize> {
    debug_assert_eq!(buf.get(start), Some(&ESC));
    let kind = *buf.get(start + 1)?;
    match kind {
        b'[' => {
            let mut pos = start + 2;
            while pos < buf.len() {
                match buf[pos] {
                    0x40..=0x7e => return Some(pos + 1),
                    0x20..=0x3f => pos += 1,
                    // Malformed: the sequence stops before this byte.
                    _ => return Some(pos),
                }
            }
            None
        }
        b']' => {
            let mut pos = start + 2;
            while pos < buf.len() {
                match buf[pos] {
                    BEL => return Some(pos + 1),
                    ESC => {
                        let next = *buf.get(pos + 1)?;
                        return Some(if next == b'\\' { pos + 2 } else { pos });
                    }
                    _ => pos += 1,
                }
            }
            None
        }
        _ => Some(start + 2),
    }
}

/// Length of a trailing incomplete UTF-8 code point in `buf`, 0 if none.
pub fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    let n = buf.len();
    for k in 1..=n.min(3) {
        let b = buf[n - k];
        if b & 0xc0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        return if needed > k { k } else { 0 };
    }
    0
}

/// Start offset of an incomplete escape sequence at the end of `buf`.
fn incomplete_escape_start(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        if buf[pos] == ESC {
            match escape_end(buf, pos) {
                Some(end) => pos = end,
                None => return Some(pos),
            }
        } else {
            pos += 1;
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct OutputAligner {
    pending: Vec<u8>,
}

impl OutputAligner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return the longest prefix that is safe to emit.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);

        // Withholding a code point can leave a malformed CSI dangling at the
        // new end, so iterate until the cut is stable.
        let mut cut = self.pending.len();
        loop {
            let mut next = cut;
            if let Some(start) = incomplete_escape_start(&self.pending[..next]) {
                if next - start <= MAX_WITHHELD_ESCAPE {
                    next = start;
                } else {
                    tracing::debug!(
                        withheld = next - start,
                        "unterminated escape sequence exceeded limit, releasing"
                    );
                }
            }
            next -= incomplete_utf8_tail(&self.pending[..next]);
            if next == cut {
                break;
            }
            cut = next;
        }

        let rest = self.pending.split_off(cut);
        std::mem::replace(&mut self.pending, rest)
    }

    /// Release everything withheld.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
