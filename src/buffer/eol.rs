//! Line-ending scanning for [`super::ByteBuffer::read_line`].

use std::collections::VecDeque;

/// End-of-line convention for `read_line` / `write_line`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EolStyle {
    /// Tolerant CRLF: a lone LF also terminates a line.
    Crlf,
    /// Only a `\r\n` pair terminates a line.
    CrlfStrict,
    Lf,
    Nul,
    /// Any of `\r`, `\n`, `\0` terminates a line; a `\r` immediately
    /// followed by `\n` is treated as a single two-byte delimiter.
    Any,
}

impl EolStyle {
    /// Bytes `write_line` appends after the line payload.
    pub fn delimiter(self) -> &'static [u8] {
        match self {
            EolStyle::Crlf | EolStyle::CrlfStrict => b"\r\n",
            EolStyle::Lf | EolStyle::Any => b"\n",
            EolStyle::Nul => b"\0",
        }
    }
}

/// Scans `queue` for the next line ending matching `style`. Returns
/// `(line_len, delimiter_len)` where `line_len` excludes the delimiter.
pub fn scan(queue: &VecDeque<u8>, style: EolStyle) -> Option<(usize, usize)> {
    match style {
        EolStyle::Lf => find_byte(queue, b'\n').map(|i| (i, 1)),
        EolStyle::Nul => find_byte(queue, 0).map(|i| (i, 1)),
        EolStyle::CrlfStrict => find_crlf_pair(queue),
        EolStyle::Crlf => find_crlf_pair(queue).or_else(|| find_byte(queue, b'\n').map(|i| (i, 1))),
        EolStyle::Any => find_any(queue),
    }
}

fn find_byte(queue: &VecDeque<u8>, needle: u8) -> Option<usize> {
    queue.iter().position(|&b| b == needle)
}

fn find_crlf_pair(queue: &VecDeque<u8>) -> Option<(usize, usize)> {
    let mut prev_cr_at: Option<usize> = None;
    for (i, &b) in queue.iter().enumerate() {
        if b == b'\n' {
            if let Some(cr) = prev_cr_at {
                if cr == i - 1 {
                    return Some((cr, 2));
                }
            }
        }
        prev_cr_at = if b == b'\r' { Some(i) } else { None };
    }
    None
}

fn find_any(queue: &VecDeque<u8>) -> Option<(usize, usize)> {
    for (i, &b) in queue.iter().enumerate() {
        if b == b'\r' {
            let next_is_lf = queue.get(i + 1) == Some(&b'\n');
            return Some((i, if next_is_lf { 2 } else { 1 }));
        }
        if b == b'\n' || b == 0 {
            return Some((i, 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(bytes: &[u8]) -> VecDeque<u8> {
        bytes.iter().copied().collect()
    }

    #[test]
    fn lf_finds_bare_newline() {
        assert_eq!(scan(&queue(b"abc\ndef"), EolStyle::Lf), Some((3, 1)));
    }

    #[test]
    fn crlf_strict_rejects_lone_lf() {
        assert_eq!(scan(&queue(b"abc\ndef"), EolStyle::CrlfStrict), None);
        assert_eq!(scan(&queue(b"abc\r\ndef"), EolStyle::CrlfStrict), Some((3, 2)));
    }

    #[test]
    fn crlf_tolerant_accepts_lone_lf() {
        assert_eq!(scan(&queue(b"abc\ndef"), EolStyle::Crlf), Some((3, 1)));
        assert_eq!(scan(&queue(b"abc\r\ndef"), EolStyle::Crlf), Some((3, 2)));
    }

    #[test]
    fn any_prefers_crlf_pair_over_bare_cr() {
        assert_eq!(scan(&queue(b"abc\r\ndef"), EolStyle::Any), Some((3, 2)));
        assert_eq!(scan(&queue(b"abc\rdef"), EolStyle::Any), Some((3, 1)));
        assert_eq!(scan(&queue(b"abc\0def"), EolStyle::Any), Some((3, 1)));
    }
}
